//! Journey step advancement: location locking, the queue fabric and worker
//! pool, the step dispatcher, and the admission surface built on them.

#![warn(clippy::unwrap_used)]

pub mod catalog;
pub mod demo;
pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod location;
pub mod queue;
pub mod registry;
pub mod sender;

pub use catalog::InMemoryCatalog;
pub use dispatcher::{EngineContext, Outcome, StepDispatcher};
pub use engine::{JourneyEngine, Ticket};
pub use location::{InMemoryLocationStore, LocationTracker};
pub use queue::{QueueFabric, RecordingQueue, WorkerPool};
pub use registry::JourneyRegistry;
pub use sender::{LoggingSender, RecordingSender};
