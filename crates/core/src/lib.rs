//! Core model, collaborator contracts, configuration and telemetry for the
//! courier journey step-advancement engine.

pub mod clock;
pub mod config;
pub mod contracts;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CourierError, CourierResult, SendFault};
