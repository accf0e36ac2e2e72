//! Telemetry bus: trait for recording delivery and journey events from the engine.
//!
//! The dispatcher accepts an `Arc<dyn EventSink>` and records `sent`,
//! `aborted`, fault and lifecycle events. Recording is fire-and-forget.

use crate::types::{TelemetryEvent, TelemetryEventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Trait for recording telemetry events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Writes every event as a structured log line on the `telemetry` target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        info!(
            target: "telemetry",
            event_id = %event.event_id,
            event_type = ?event.event_type,
            journey_id = %event.journey_id,
            customer_id = %event.customer_id,
            step_id = ?event.step_id,
            detail = ?event.detail,
            "telemetry event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: TelemetryEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating `TelemetryEvent` with minimal boilerplate.
pub fn make_event(
    event_type: TelemetryEventType,
    journey_id: Uuid,
    customer_id: impl Into<String>,
    step_id: Option<Uuid>,
) -> TelemetryEvent {
    TelemetryEvent {
        event_id: Uuid::new_v4(),
        event_type,
        journey_id,
        customer_id: customer_id.into(),
        step_id,
        session: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
