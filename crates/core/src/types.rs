use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A journey definition: a directed graph of steps a customer moves through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// Ids of every step belonging to this journey.
    pub steps: Vec<Uuid>,
    #[serde(default)]
    pub settings: JourneySettings,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_stopped: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u32,
}

/// Delivery settings applied to every message step of a journey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneySettings {
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
    #[serde(default)]
    pub max_messages_per_minute: RateLimitConfig,
    #[serde(default)]
    pub max_customers_messaged: DistinctLimitConfig,
}

/// Time-of-day window, in the journey's local time, during which sends are suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    pub enabled: bool,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Local time = UTC + offset.
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub fallback: Option<QuietHoursFallback>,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
            end_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            timezone_offset_minutes: 0,
            fallback: Some(QuietHoursFallback::RequeueAtNextAvailableTime),
        }
    }
}

/// What happens to a send attempted inside quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuietHoursFallback {
    RequeueAtNextAvailableTime,
    Abort,
}

/// Per-minute send cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max: u64,
}

/// Cap on the number of distinct customers messaged by a journey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistinctLimitConfig {
    pub enabled: bool,
    pub max: u64,
    /// Counting window; `None` counts over the journey's lifetime.
    #[serde(default)]
    pub window_secs: Option<u64>,
}

/// A node of a journey graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub journey_id: Uuid,
    #[serde(default)]
    pub name: String,
    pub kind: StepKind,
}

/// The closed set of step types together with their type-specific metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "metadata")]
pub enum StepKind {
    Start(StartMetadata),
    Message(MessageMetadata),
    TimeDelay(TimeDelayMetadata),
    TimeWindow(TimeWindowMetadata),
    WaitUntilBranch(WaitUntilMetadata),
    Multisplit(MultisplitMetadata),
    Experiment(ExperimentMetadata),
    Loop(LoopMetadata),
    Exit(ExitMetadata),
    AbTest(serde_json::Value),
    RandomCohortBranch(serde_json::Value),
    Tracker(serde_json::Value),
    AttributeBranch(serde_json::Value),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Start(_) => "start",
            StepKind::Message(_) => "message",
            StepKind::TimeDelay(_) => "time_delay",
            StepKind::TimeWindow(_) => "time_window",
            StepKind::WaitUntilBranch(_) => "wait_until_branch",
            StepKind::Multisplit(_) => "multisplit",
            StepKind::Experiment(_) => "experiment",
            StepKind::Loop(_) => "loop",
            StepKind::Exit(_) => "exit",
            StepKind::AbTest(_) => "ab_test",
            StepKind::RandomCohortBranch(_) => "random_cohort_branch",
            StepKind::Tracker(_) => "tracker",
            StepKind::AttributeBranch(_) => "attribute_branch",
        }
    }

    /// Queue that processes this step type. Reserved step types have none.
    pub fn queue(&self) -> Option<QueueName> {
        match self {
            StepKind::Start(_) => Some(QueueName::Start),
            StepKind::Message(_) => Some(QueueName::Message),
            StepKind::TimeDelay(_) => Some(QueueName::TimeDelay),
            StepKind::TimeWindow(_) => Some(QueueName::TimeWindow),
            StepKind::WaitUntilBranch(_) => Some(QueueName::WaitUntil),
            StepKind::Multisplit(_) => Some(QueueName::Multisplit),
            StepKind::Experiment(_) => Some(QueueName::Experiment),
            StepKind::Loop(_) => Some(QueueName::Loop),
            StepKind::Exit(_) => Some(QueueName::Exit),
            StepKind::AbTest(_)
            | StepKind::RandomCohortBranch(_)
            | StepKind::Tracker(_)
            | StepKind::AttributeBranch(_) => None,
        }
    }

    /// Timer-class steps park the customer instead of being chained into.
    pub fn is_timer(&self) -> bool {
        matches!(
            self,
            StepKind::TimeDelay(_) | StepKind::TimeWindow(_) | StepKind::WaitUntilBranch(_)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartMetadata {
    /// The journey's first real step.
    pub destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub template_id: Uuid,
    pub destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeDelayMetadata {
    pub delay_secs: u64,
    pub destination: Option<Uuid>,
}

/// A recurring daily window, in local time, inside which the customer may proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowMetadata {
    pub from: NaiveTime,
    pub to: NaiveTime,
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    /// Allowed days; empty allows every day.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitUntilMetadata {
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub timeout_destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultisplitMetadata {
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub default_destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub variants: Vec<ExperimentVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub name: String,
    pub weight: f32,
    pub destination: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMetadata {
    pub destination: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitMetadata {
    #[serde(default)]
    pub reason: String,
}

/// A guarded edge out of a branching step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub condition: Condition,
    pub destination: Option<Uuid>,
}

/// Predicate evaluated against the customer's attributes or the triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum Condition {
    Always,
    Customer {
        key: String,
        operator: ComparisonOperator,
        #[serde(default)]
        value: serde_json::Value,
    },
    Event {
        key: String,
        operator: ComparisonOperator,
        #[serde(default)]
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    IsSet,
    IsNotSet,
    InList,
}

/// Message content definition referenced by message steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub channel: Channel,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    /// External side-channel; when present the send goes to this endpoint.
    #[serde(default)]
    pub webhook: Option<WebhookSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Webhook => "webhook",
        }
    }
}

/// A customer snapshot as carried by jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Customer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Destination address for a channel, read from well-known attributes.
    pub fn address_for(&self, channel: Channel) -> Option<String> {
        let key = match channel {
            Channel::Email => "email",
            Channel::Sms => "phone",
            Channel::Push => "push_token",
            Channel::Webhook => return None,
        };
        self.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// The event that admitted or re-triggered a customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Mutual-exclusion state of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LockState {
    Unlocked,
    /// Handed off to the queued job carrying `token`; only that job may claim it.
    Reserved { token: Uuid },
    /// A worker running the job `token` is advancing the customer.
    Held { token: Uuid },
}

/// Where a customer currently is in a journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyLocation {
    pub customer_id: String,
    pub journey_id: Uuid,
    pub current_step_id: Uuid,
    pub lock: LockState,
    pub locked_at: Option<DateTime<Utc>>,
    pub message_sent: bool,
    pub step_entered_at: DateTime<Utc>,
    pub admitted_at: DateTime<Utc>,
}

impl JourneyLocation {
    pub fn new(customer_id: &str, journey_id: Uuid, step_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            journey_id,
            current_step_id: step_id,
            lock: LockState::Unlocked,
            locked_at: None,
            message_sent: false,
            step_entered_at: now,
            admitted_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        !matches!(self.lock, LockState::Unlocked)
    }

    /// Whether the job `token` holds or has been handed this location's lock.
    pub fn is_owned_by(&self, token: Uuid) -> bool {
        match self.lock {
            LockState::Reserved { token: owner } | LockState::Held { token: owner } => owner == token,
            LockState::Unlocked => false,
        }
    }
}

/// Result of a lock attempt on a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// A lock held past the maximum hold time was force-released and re-acquired.
    Reclaimed { previous: Uuid },
    Busy,
    Missing,
}

/// Queue identifiers: one per implemented step type plus the webhook fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Start,
    Message,
    TimeDelay,
    TimeWindow,
    WaitUntil,
    Multisplit,
    Experiment,
    Loop,
    Exit,
    WebhookDispatch,
}

impl QueueName {
    pub const ALL: [QueueName; 10] = [
        QueueName::Start,
        QueueName::Message,
        QueueName::TimeDelay,
        QueueName::TimeWindow,
        QueueName::WaitUntil,
        QueueName::Multisplit,
        QueueName::Experiment,
        QueueName::Loop,
        QueueName::Exit,
        QueueName::WebhookDispatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Start => "start",
            QueueName::Message => "message",
            QueueName::TimeDelay => "time-delay",
            QueueName::TimeWindow => "time-window",
            QueueName::WaitUntil => "wait-until",
            QueueName::Multisplit => "multisplit",
            QueueName::Experiment => "experiment",
            QueueName::Loop => "loop",
            QueueName::Exit => "exit",
            QueueName::WebhookDispatch => "webhook-dispatch",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full context snapshot for one advancement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique per hop; doubles as the location lock token.
    pub id: Uuid,
    pub step: Step,
    pub owner_id: Uuid,
    pub journey: Journey,
    pub customer: Customer,
    pub location: JourneyLocation,
    /// Correlation id shared by every hop of one admission.
    pub session: Uuid,
    #[serde(default)]
    pub event: Option<TriggerEvent>,
    #[serde(default)]
    pub branch: Option<usize>,
}

impl Job {
    /// Same customer, journey and session, positioned at `step`.
    pub fn follow_up(&self, step: Step, location: JourneyLocation, branch: Option<usize>) -> Job {
        Job {
            id: Uuid::new_v4(),
            step,
            owner_id: self.owner_id,
            journey: self.journey.clone(),
            customer: self.customer.clone(),
            location,
            session: self.session,
            event: self.event.clone(),
            branch,
        }
    }

    /// A fresh attempt at the same step.
    pub fn retry(&self) -> Job {
        Job {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// Asynchronous webhook send produced by a message step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDispatch {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub step_id: Uuid,
    pub customer_id: String,
    pub session: Uuid,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Anything that can be placed on the queue fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum QueuePayload {
    Step(Box<Job>),
    Webhook(WebhookDispatch),
}

impl QueuePayload {
    pub fn id(&self) -> Uuid {
        match self {
            QueuePayload::Step(job) => job.id,
            QueuePayload::Webhook(dispatch) => dispatch.id,
        }
    }

    /// Target queue, or `None` for a job at a reserved step type.
    pub fn queue(&self) -> Option<QueueName> {
        match self {
            QueuePayload::Step(job) => job.step.kind.queue(),
            QueuePayload::Webhook(_) => Some(QueueName::WebhookDispatch),
        }
    }
}

/// Rendered content handed to a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Provider acknowledgement of a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Delivery and lifecycle event recorded through the telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: Uuid,
    pub event_type: TelemetryEventType,
    pub journey_id: Uuid,
    pub customer_id: String,
    pub step_id: Option<Uuid>,
    pub session: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_session(mut self, session: Uuid) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    JourneyEntered,
    StepCompleted,
    MessageSent,
    MessageMockSent,
    MessageAborted,
    MessageHeld,
    MessageRequeued,
    DeliveryFault,
    JourneyExited,
}
