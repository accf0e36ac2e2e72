//! Delivery controls for journey message steps: quiet hours, journey rate
//! limits, the send gate that combines them, and template rendering.

pub mod gate;
pub mod quiet_hours;
pub mod rate_limit;
pub mod render;

pub use gate::{GateDecision, SendGate, SendVerdict};
pub use quiet_hours::QuietHoursVerdict;
pub use rate_limit::{InMemoryRateLimitStore, RateLimiter, Reservation};
pub use render::TemplateRenderer;
