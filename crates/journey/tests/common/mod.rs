#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use courier_core::clock::{Clock, ManualClock};
use courier_core::contracts::{JobQueue, LocationStore, StepStore};
use courier_core::event_bus::{CaptureSink, EventSink};
use courier_core::types::{
    Channel, Customer, Job, Journey, JourneySettings, QueuePayload, Step, StepKind, Template,
    WebhookSpec,
};
use courier_core::CourierResult;
use courier_delivery::{InMemoryRateLimitStore, RateLimiter, SendGate, TemplateRenderer};
use courier_journey::queue::QueuedPayload;
use courier_journey::{
    EngineContext, InMemoryCatalog, InMemoryLocationStore, JourneyEngine, JourneyRegistry,
    LocationTracker, Outcome, RecordingQueue, RecordingSender, StepDispatcher,
};
use uuid::Uuid;

pub const PING_URL: &str = "http://diagnostics.local/ping";

/// Monday 2024-03-04 12:00:30 UTC.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 30).unwrap()
}

pub fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

/// Shared fakes behind an engine context.
pub struct Fakes {
    pub catalog: Arc<InMemoryCatalog>,
    pub locations: Arc<InMemoryLocationStore>,
    pub sender: Arc<RecordingSender>,
    pub telemetry: Arc<CaptureSink>,
    pub journeys: Arc<JourneyRegistry>,
}

pub fn context(
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    mock_send: bool,
) -> (EngineContext, Fakes) {
    let fakes = Fakes {
        catalog: Arc::new(InMemoryCatalog::new()),
        locations: Arc::new(InMemoryLocationStore::new()),
        sender: Arc::new(RecordingSender::new()),
        telemetry: Arc::new(CaptureSink::new()),
        journeys: Arc::new(JourneyRegistry::new()),
    };
    let limiter = RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()));
    let ctx = EngineContext {
        steps: fakes.catalog.clone(),
        templates: fakes.catalog.clone(),
        locations: LocationTracker::new(fakes.locations.clone(), chrono::Duration::seconds(300)),
        queue,
        sender: fakes.sender.clone(),
        telemetry: fakes.telemetry.clone() as Arc<dyn EventSink>,
        gate: SendGate::new(limiter, mock_send),
        journeys: fakes.journeys.clone(),
        clock,
        renderer: TemplateRenderer::new(),
        mock_ping_url: mock_send.then(|| PING_URL.to_string()),
    };
    (ctx, fakes)
}

/// Engine wired to a recording queue and a manual clock; jobs run when the
/// test pops them.
pub struct Harness {
    pub engine: JourneyEngine,
    pub dispatcher: Arc<StepDispatcher>,
    pub queue: Arc<RecordingQueue>,
    pub clock: Arc<ManualClock>,
    pub fakes: Fakes,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    pub fn mocked() -> Self {
        Self::build(true)
    }

    fn build(mock_send: bool) -> Self {
        let queue = Arc::new(RecordingQueue::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let (ctx, fakes) = context(queue.clone(), clock.clone(), mock_send);
        let engine = JourneyEngine::new(ctx);
        Self {
            dispatcher: engine.dispatcher(),
            engine,
            queue,
            clock,
            fakes,
        }
    }

    pub fn store(&self) -> &InMemoryLocationStore {
        &self.fakes.locations
    }

    /// Registers a journey whose steps are given in order; returns the journey id.
    pub fn journey(&self, settings: JourneySettings, steps: &[(Uuid, StepKind)]) -> Uuid {
        let journey_id = Uuid::new_v4();
        for (id, kind) in steps {
            self.fakes.catalog.insert_step(Step {
                id: *id,
                journey_id,
                name: kind.label().to_string(),
                kind: kind.clone(),
            });
        }
        let now = self.clock.now();
        self.fakes.journeys.register(Journey {
            id: journey_id,
            owner_id: Uuid::nil(),
            name: "test journey".to_string(),
            steps: steps.iter().map(|(id, _)| *id).collect(),
            settings,
            is_paused: false,
            is_stopped: false,
            created_at: now,
            updated_at: now,
            version: 1,
        });
        journey_id
    }

    /// The manual clock's "now" plus `secs`.
    pub fn later(&self, secs: i64) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::seconds(secs)
    }

    pub async fn step(&self, id: Uuid) -> Step {
        self.fakes.catalog.get_by_id(id).await.unwrap().unwrap()
    }

    pub fn email_template(&self) -> Uuid {
        self.template(Channel::Email, None)
    }

    pub fn webhook_template(&self, url: &str) -> Uuid {
        self.template(
            Channel::Webhook,
            Some(WebhookSpec {
                url: url.to_string(),
                method: "POST".to_string(),
                headers: Default::default(),
            }),
        )
    }

    fn template(&self, channel: Channel, webhook: Option<WebhookSpec>) -> Uuid {
        let id = Uuid::new_v4();
        self.fakes.catalog.insert_template(Template {
            id,
            owner_id: Uuid::nil(),
            name: "test template".to_string(),
            channel,
            subject: Some("Hello".to_string()),
            body: "Hi {{customer.first_name | default}}".to_string(),
            webhook,
        });
        id
    }

    pub async fn admit(&self, customer: &Customer, journey_id: Uuid, start: Uuid) {
        self.engine
            .admit(customer.clone(), journey_id, start, None)
            .await
            .unwrap();
    }

    /// Pops the oldest queued payload.
    pub fn next(&self) -> QueuedPayload {
        self.queue.pop().expect("queue is empty")
    }

    pub fn next_job(&self) -> Job {
        match self.next().payload {
            QueuePayload::Step(job) => *job,
            QueuePayload::Webhook(_) => panic!("expected a step job, got a webhook"),
        }
    }

    /// Runs the oldest queued payload.
    pub async fn run_next(&self) -> CourierResult<Outcome> {
        self.run(self.next().payload).await
    }

    pub async fn run(&self, payload: QueuePayload) -> CourierResult<Outcome> {
        match payload {
            QueuePayload::Step(job) => self.dispatcher.process(*job).await,
            QueuePayload::Webhook(dispatch) => self.dispatcher.dispatch_webhook(&dispatch).await,
        }
    }

    pub async fn is_locked(&self, customer_id: &str, journey_id: Uuid) -> bool {
        self.store()
            .get(customer_id, journey_id)
            .await
            .unwrap()
            .map_or(false, |l| l.is_locked())
    }

    pub async fn current_step(&self, customer_id: &str, journey_id: Uuid) -> Option<Uuid> {
        self.store()
            .get(customer_id, journey_id)
            .await
            .unwrap()
            .map(|l| l.current_step_id)
    }
}

pub fn customer(id: &str) -> Customer {
    Customer::new(id)
        .with_attribute("email", serde_json::json!(format!("{id}@example.com")))
        .with_attribute("first_name", serde_json::json!("Ada"))
}
