//! Step dispatcher: the advancement state machine.
//!
//! One job moves one customer by at most one hop. The dispatcher takes the
//! location lock for the job, routes the step through an exhaustive match on
//! its kind, and settles the lock: handed off to the next job, released when
//! the customer comes to rest, or finalized on exit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use courier_core::clock::Clock;
use courier_core::contracts::{JobQueue, MessageSender, StepStore, TemplateStore};
use courier_core::event_bus::{make_event, EventSink};
use courier_core::types::{
    Channel, Job, JourneyLocation, LockState, MessageMetadata, QueuePayload, RenderedMessage,
    Step, StepKind, TelemetryEventType, Template, WebhookDispatch,
};
use courier_core::{CourierError, CourierResult, SendFault};
use courier_delivery::{Reservation, SendGate, SendVerdict, TemplateRenderer};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::evaluator::{first_match, next_window_instant, pick_variant};
use crate::location::{Acquisition, LocationLock, LocationTracker};
use crate::queue::JobHandler;
use crate::registry::JourneyRegistry;

/// Everything the dispatcher talks to, passed in explicitly.
pub struct EngineContext {
    pub steps: Arc<dyn StepStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub locations: LocationTracker,
    pub queue: Arc<dyn JobQueue>,
    pub sender: Arc<dyn MessageSender>,
    pub telemetry: Arc<dyn EventSink>,
    pub gate: SendGate,
    pub journeys: Arc<JourneyRegistry>,
    pub clock: Arc<dyn Clock>,
    pub renderer: TemplateRenderer,
    /// Diagnostic endpoint pinged on every mock send.
    pub mock_ping_url: Option<String>,
}

/// How one job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    /// Lock handed to the queued job for step `to`.
    Advanced { to: Uuid },
    /// Lock released; the customer rests at step `at`.
    Parked { at: Uuid },
    /// Same step re-attempted at `at`.
    Requeued { at: DateTime<Utc> },
    /// Send held by the distinct-customers cap.
    Held,
    Exited,
    /// The journey was stopped; the location was finalized.
    Halted,
    /// Another advancement of this customer is in progress; the job was dropped.
    Busy,
    /// The customer already moved past this job's step.
    Stale,
    /// The customer has no location in this journey.
    Missing,
    /// A webhook payload was handed to the sender.
    Dispatched,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Advanced { .. } => "advanced",
            Outcome::Parked { .. } => "parked",
            Outcome::Requeued { .. } => "requeued",
            Outcome::Held => "held",
            Outcome::Exited => "exited",
            Outcome::Halted => "halted",
            Outcome::Busy => "busy",
            Outcome::Stale => "stale",
            Outcome::Missing => "missing",
            Outcome::Dispatched => "dispatched",
        }
    }
}

/// What a step handler asks the dispatcher to do with the lock.
#[derive(Debug)]
enum Transition {
    Advance {
        destination: Option<Uuid>,
        branch: Option<usize>,
    },
    Requeue {
        at: DateTime<Utc>,
    },
    Park,
    Hold,
    Exit,
}

impl Transition {
    fn to(destination: Option<Uuid>) -> Self {
        Transition::Advance {
            destination,
            branch: None,
        }
    }
}

pub struct StepDispatcher {
    ctx: Arc<EngineContext>,
}

impl StepDispatcher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Runs one advancement attempt for `job`.
    pub async fn process(&self, job: Job) -> CourierResult<Outcome> {
        let now = self.ctx.clock.now();
        let journey_id = job.journey.id;

        let lock = match self
            .ctx
            .locations
            .acquire(&job.customer.id, journey_id, job.id, now)
            .await?
        {
            Acquisition::Locked(lock) => lock,
            Acquisition::Busy => {
                info!(
                    journey_id = %journey_id,
                    customer_id = %job.customer.id,
                    step_id = %job.step.id,
                    job_id = %job.id,
                    "Advancement already in progress, dropping job"
                );
                return Ok(Outcome::Busy);
            }
            Acquisition::Missing => {
                debug!(journey_id = %journey_id, customer_id = %job.customer.id, "No location for job");
                return Ok(Outcome::Missing);
            }
        };

        if self.ctx.journeys.is_stopped(journey_id) {
            lock.finalize().await?;
            info!(journey_id = %journey_id, customer_id = %job.customer.id, "Journey stopped, location finalized");
            self.record(&job, TelemetryEventType::JourneyExited, Some("journey stopped".into()));
            return Ok(Outcome::Halted);
        }

        let location = match lock.current().await {
            Ok(Some(location)) => location,
            Ok(None) => {
                lock.release().await?;
                return Ok(Outcome::Missing);
            }
            Err(e) => return Err(self.fail(&job, lock, e, now).await),
        };
        if location.current_step_id != job.step.id {
            debug!(
                journey_id = %journey_id,
                customer_id = %job.customer.id,
                job_step = %job.step.id,
                current_step = %location.current_step_id,
                "Job is behind the customer's location, dropping"
            );
            lock.release().await?;
            return Ok(Outcome::Stale);
        }

        let transition = match self.run_step(&job, &lock, &location, now).await {
            Ok(transition) => transition,
            Err(e) => return Err(self.fail(&job, lock, e, now).await),
        };
        self.settle(&job, lock, location, transition, now).await
    }

    async fn run_step(
        &self,
        job: &Job,
        lock: &LocationLock,
        location: &JourneyLocation,
        now: DateTime<Utc>,
    ) -> CourierResult<Transition> {
        match &job.step.kind {
            StepKind::Start(meta) => Ok(Transition::to(meta.destination)),
            StepKind::Message(meta) => self.message(job, lock, location, meta, now).await,
            StepKind::TimeDelay(meta) => {
                let wake = location.step_entered_at + secs(meta.delay_secs);
                if now >= wake {
                    Ok(Transition::to(meta.destination))
                } else {
                    Ok(Transition::Requeue { at: wake })
                }
            }
            StepKind::TimeWindow(meta) => match next_window_instant(meta, now) {
                Some(at) if at <= now => Ok(Transition::to(meta.destination)),
                Some(at) => Ok(Transition::Requeue { at }),
                None => {
                    warn!(step_id = %job.step.id, "Time window can never open, parking customer");
                    Ok(Transition::Park)
                }
            },
            StepKind::WaitUntilBranch(meta) => {
                if let Some((index, branch)) =
                    first_match(&meta.branches, &job.customer, job.event.as_ref())
                {
                    return Ok(Transition::Advance {
                        destination: branch.destination,
                        branch: Some(index),
                    });
                }
                match meta.timeout_secs {
                    Some(timeout) => {
                        let deadline = location.step_entered_at + secs(timeout);
                        if now >= deadline {
                            Ok(Transition::to(meta.timeout_destination))
                        } else {
                            Ok(Transition::Requeue { at: deadline })
                        }
                    }
                    None => Ok(Transition::Park),
                }
            }
            StepKind::Multisplit(meta) => {
                Ok(match first_match(&meta.branches, &job.customer, job.event.as_ref()) {
                    Some((index, branch)) => Transition::Advance {
                        destination: branch.destination,
                        branch: Some(index),
                    },
                    None => Transition::to(meta.default_destination),
                })
            }
            StepKind::Experiment(meta) => {
                let picked = {
                    let mut rng = rand::thread_rng();
                    pick_variant(&meta.variants, &mut rng).map(|(i, v)| (i, v.destination))
                };
                Ok(match picked {
                    Some((index, destination)) => Transition::Advance {
                        destination,
                        branch: Some(index),
                    },
                    None => Transition::to(None),
                })
            }
            StepKind::Loop(meta) => Ok(Transition::to(meta.destination)),
            StepKind::Exit(_) => Ok(Transition::Exit),
            StepKind::AbTest(_)
            | StepKind::RandomCohortBranch(_)
            | StepKind::Tracker(_)
            | StepKind::AttributeBranch(_) => Err(CourierError::NotImplemented(job.step.kind.label())),
        }
    }

    async fn message(
        &self,
        job: &Job,
        lock: &LocationLock,
        location: &JourneyLocation,
        meta: &MessageMetadata,
        now: DateTime<Utc>,
    ) -> CourierResult<Transition> {
        if location.message_sent {
            debug!(
                journey_id = %job.journey.id,
                customer_id = %job.customer.id,
                step_id = %job.step.id,
                "Message already sent for this step, advancing"
            );
            return Ok(Transition::to(meta.destination));
        }

        let template = self
            .ctx
            .templates
            .get_by_id(meta.template_id)
            .await?
            .ok_or(CourierError::MissingTemplate(meta.template_id))?;
        let journey = self
            .ctx
            .journeys
            .get(job.journey.id)
            .unwrap_or_else(|| job.journey.clone());

        let decision = self
            .ctx
            .gate
            .evaluate(&journey, &template, &job.customer.id, now)
            .await?;
        let verdict = decision.verdict;
        match verdict {
            SendVerdict::QuietRequeue { at } | SendVerdict::LimitRequeue { at } => {
                self.record(job, TelemetryEventType::MessageRequeued, Some(verdict.label().into()));
                Ok(Transition::Requeue { at })
            }
            SendVerdict::QuietAbort => {
                self.record(job, TelemetryEventType::MessageAborted, Some("quiet hours".into()));
                Ok(Transition::to(meta.destination))
            }
            SendVerdict::LimitHold => {
                self.record(job, TelemetryEventType::MessageHeld, Some(verdict.label().into()));
                Ok(Transition::Hold)
            }
            SendVerdict::MockSend => {
                self.ping_mock(job, &template).await;
                mark_sent(lock, job).await;
                self.record(job, TelemetryEventType::MessageMockSent, None);
                Ok(Transition::to(meta.destination))
            }
            SendVerdict::Send => {
                self.deliver(job, lock, &template, decision.reservation, meta)
                    .await
            }
        }
    }

    async fn deliver(
        &self,
        job: &Job,
        lock: &LocationLock,
        template: &Template,
        reservation: Reservation,
        meta: &MessageMetadata,
    ) -> CourierResult<Transition> {
        let limiter = self.ctx.gate.limiter();
        let rendered = self
            .ctx
            .renderer
            .render(template, &job.customer, job.event.as_ref());

        if let Some(webhook) = &template.webhook {
            let dispatch = WebhookDispatch {
                id: Uuid::new_v4(),
                journey_id: job.journey.id,
                step_id: job.step.id,
                customer_id: job.customer.id.clone(),
                session: job.session,
                url: webhook.url.clone(),
                method: webhook.method.clone(),
                headers: webhook.headers.clone(),
                body: rendered.body,
            };
            if let Err(e) = self
                .ctx
                .queue
                .enqueue(QueuePayload::Webhook(dispatch), None)
                .await
            {
                limiter.refund(job.journey.id, &reservation).await;
                return Err(e);
            }
            mark_sent(lock, job).await;
            self.record(job, TelemetryEventType::MessageSent, Some("webhook queued".into()));
            return Ok(Transition::to(meta.destination));
        }

        let Some(address) = job.customer.address_for(template.channel) else {
            limiter.refund(job.journey.id, &reservation).await;
            warn!(
                journey_id = %job.journey.id,
                customer_id = %job.customer.id,
                channel = template.channel.as_str(),
                "Customer has no address for channel, aborting send"
            );
            self.record(
                job,
                TelemetryEventType::MessageAborted,
                Some(format!("no {} address", template.channel.as_str())),
            );
            return Ok(Transition::to(meta.destination));
        };

        match self
            .ctx
            .sender
            .send(template.channel, &rendered, &address)
            .await
        {
            Ok(receipt) => {
                mark_sent(lock, job).await;
                self.record(job, TelemetryEventType::MessageSent, receipt.provider_message_id);
                Ok(Transition::to(meta.destination))
            }
            Err(SendFault::Quota(reason)) => {
                limiter.refund(job.journey.id, &reservation).await;
                warn!(journey_id = %job.journey.id, reason = %reason, "Messaging quota exhausted, aborting send");
                self.record(job, TelemetryEventType::MessageAborted, Some(format!("quota: {reason}")));
                Ok(Transition::to(meta.destination))
            }
            Err(SendFault::Rejected(reason)) => {
                limiter.refund(job.journey.id, &reservation).await;
                self.record(job, TelemetryEventType::DeliveryFault, Some(format!("rejected: {reason}")));
                Ok(Transition::to(meta.destination))
            }
            Err(SendFault::Transient(reason)) => {
                limiter.refund(job.journey.id, &reservation).await;
                self.record(job, TelemetryEventType::DeliveryFault, Some(format!("transient: {reason}")));
                Err(CourierError::Delivery(reason))
            }
        }
    }

    async fn ping_mock(&self, job: &Job, template: &Template) {
        let Some(url) = &self.ctx.mock_ping_url else {
            return;
        };
        let ping = RenderedMessage {
            subject: None,
            body: format!(
                "mock send journey={} step={} customer={} template={}",
                job.journey.id, job.step.id, job.customer.id, template.id
            ),
        };
        if let Err(e) = self.ctx.sender.send(Channel::Webhook, &ping, url).await {
            warn!(url = %url, error = %e, "Mock-send diagnostic ping failed");
        }
    }

    /// Applies a step's transition to the lock and queues whatever comes next.
    async fn settle(
        &self,
        job: &Job,
        lock: LocationLock,
        location: JourneyLocation,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> CourierResult<Outcome> {
        let (destination, branch) = match transition {
            Transition::Advance {
                destination,
                branch,
            } => (destination, branch),
            Transition::Requeue { at } => {
                lock.release().await?;
                self.ctx
                    .queue
                    .enqueue(QueuePayload::Step(Box::new(job.retry())), delay_until(at, now))
                    .await?;
                debug!(customer_id = %job.customer.id, step_id = %job.step.id, at = %at, "Step requeued");
                return Ok(Outcome::Requeued { at });
            }
            Transition::Park => {
                lock.release().await?;
                return Ok(Outcome::Parked { at: job.step.id });
            }
            Transition::Hold => {
                lock.release().await?;
                return Ok(Outcome::Held);
            }
            Transition::Exit => {
                lock.finalize().await?;
                self.record(job, TelemetryEventType::JourneyExited, None);
                return Ok(Outcome::Exited);
            }
        };

        let Some(destination) = destination else {
            warn!(
                journey_id = %job.journey.id,
                step_id = %job.step.id,
                step_type = job.step.kind.label(),
                "Step has no destination, parking customer"
            );
            lock.release().await?;
            self.record(job, TelemetryEventType::DeliveryFault, Some("no destination".into()));
            return Ok(Outcome::Parked { at: job.step.id });
        };

        let next = match self.ctx.steps.get_by_id(destination).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                error!(journey_id = %job.journey.id, step_id = %job.step.id, destination = %destination, "Destination step not found");
                lock.release().await?;
                self.record(job, TelemetryEventType::DeliveryFault, Some(format!("missing step {destination}")));
                return Err(CourierError::MissingStep(destination));
            }
            Err(e) => return Err(self.fail(job, lock, e, now).await),
        };
        if next.kind.queue().is_none() {
            error!(destination = %destination, step_type = next.kind.label(), "Destination step type is not implemented");
            lock.release().await?;
            self.record(job, TelemetryEventType::DeliveryFault, Some(format!("{} not implemented", next.kind.label())));
            return Err(CourierError::NotImplemented(next.kind.label()));
        }

        if let Err(e) = lock.move_to(next.id, now).await {
            return Err(self.fail(job, lock, e, now).await);
        }
        self.record(job, TelemetryEventType::StepCompleted, None);

        let mut moved = location;
        moved.current_step_id = next.id;
        moved.message_sent = false;
        moved.step_entered_at = now;

        if next.kind.is_timer() {
            lock.release().await?;
            moved.lock = LockState::Unlocked;
            moved.locked_at = None;
            let Some(wake) = wake_instant(&next, now) else {
                warn!(step_id = %next.id, "Timer step never fires, parking customer");
                return Ok(Outcome::Parked { at: next.id });
            };
            let next_id = next.id;
            let follow = job.follow_up(next, moved, branch);
            self.ctx
                .queue
                .enqueue(QueuePayload::Step(Box::new(follow)), delay_until(wake, now))
                .await?;
            return Ok(Outcome::Parked { at: next_id });
        }

        let next_id = next.id;
        let mut follow = job.follow_up(next, moved, branch);
        follow.location.lock = LockState::Reserved { token: follow.id };
        follow.location.locked_at = Some(now);
        let follow_id = follow.id;
        lock.hand_off(follow_id, now).await?;
        if let Err(e) = self
            .ctx
            .queue
            .enqueue(QueuePayload::Step(Box::new(follow)), None)
            .await
        {
            if let Err(unlock_err) = self
                .ctx
                .locations
                .store()
                .unlock(&job.customer.id, job.journey.id, follow_id)
                .await
            {
                error!(error = %unlock_err, "Failed to release reservation after enqueue failure");
            }
            return Err(e);
        }
        Ok(Outcome::Advanced { to: next_id })
    }

    /// Settles the lock after a failed attempt. Retryable errors keep the
    /// lock reserved for the same job id so the retry can reclaim it.
    async fn fail(
        &self,
        job: &Job,
        lock: LocationLock,
        err: CourierError,
        now: DateTime<Utc>,
    ) -> CourierError {
        let settled = if err.is_retryable() {
            lock.hand_off(job.id, now).await
        } else {
            lock.release().await
        };
        if let Err(e) = settled {
            error!(job_id = %job.id, error = %e, "Failed to settle location lock after job error");
        }
        if !err.is_retryable() {
            error!(
                journey_id = %job.journey.id,
                customer_id = %job.customer.id,
                step_id = %job.step.id,
                error = %err,
                "Job failed without retry"
            );
            self.record(job, TelemetryEventType::DeliveryFault, Some(err.to_string()));
        }
        err
    }

    /// Sends a queued webhook payload. Runs past the send commit point, so
    /// lifecycle flags are not consulted.
    pub async fn dispatch_webhook(&self, dispatch: &WebhookDispatch) -> CourierResult<Outcome> {
        debug!(
            url = %dispatch.url,
            method = %dispatch.method,
            headers = dispatch.headers.len(),
            "Dispatching webhook"
        );
        let content = RenderedMessage {
            subject: None,
            body: dispatch.body.clone(),
        };
        match self
            .ctx
            .sender
            .send(Channel::Webhook, &content, &dispatch.url)
            .await
        {
            Ok(_) => Ok(Outcome::Dispatched),
            Err(SendFault::Transient(reason)) => Err(CourierError::Delivery(reason)),
            Err(fault) => {
                warn!(url = %dispatch.url, error = %fault, "Webhook dispatch failed permanently");
                self.ctx.telemetry.emit(
                    make_event(
                        TelemetryEventType::DeliveryFault,
                        dispatch.journey_id,
                        dispatch.customer_id.as_str(),
                        Some(dispatch.step_id),
                    )
                    .with_session(dispatch.session)
                    .with_detail(fault.to_string()),
                );
                Ok(Outcome::Dispatched)
            }
        }
    }

    fn record(&self, job: &Job, event_type: TelemetryEventType, detail: Option<String>) {
        let mut event = make_event(
            event_type,
            job.journey.id,
            job.customer.id.as_str(),
            Some(job.step.id),
        )
        .with_session(job.session);
        event.detail = detail;
        self.ctx.telemetry.emit(event);
    }
}

#[async_trait]
impl JobHandler for StepDispatcher {
    async fn handle(&self, payload: QueuePayload) -> CourierResult<()> {
        let outcome = match payload {
            QueuePayload::Step(job) => self.process(*job).await?,
            QueuePayload::Webhook(dispatch) => self.dispatch_webhook(&dispatch).await?,
        };
        metrics::counter!("dispatcher.outcomes", "outcome" => outcome.label()).increment(1);
        Ok(())
    }

    async fn abandon(&self, payload: &QueuePayload, error: &CourierError) {
        match payload {
            QueuePayload::Step(job) => {
                if let Err(e) = self
                    .ctx
                    .locations
                    .store()
                    .unlock(&job.customer.id, job.journey.id, job.id)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to release lock of abandoned job");
                }
                self.record(job, TelemetryEventType::DeliveryFault, Some(format!("abandoned: {error}")));
            }
            QueuePayload::Webhook(dispatch) => {
                self.ctx.telemetry.emit(
                    make_event(
                        TelemetryEventType::DeliveryFault,
                        dispatch.journey_id,
                        dispatch.customer_id.as_str(),
                        Some(dispatch.step_id),
                    )
                    .with_session(dispatch.session)
                    .with_detail(format!("webhook abandoned: {error}")),
                );
            }
        }
    }
}

/// When a timer-class step should first be evaluated after the customer arrives.
fn wake_instant(step: &Step, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &step.kind {
        StepKind::TimeDelay(meta) => Some(now + secs(meta.delay_secs)),
        StepKind::TimeWindow(meta) => next_window_instant(meta, now),
        _ => Some(now),
    }
}

async fn mark_sent(lock: &LocationLock, job: &Job) {
    // The send already happened; failing here would only cause a duplicate on retry.
    if let Err(e) = lock.set_message_sent().await {
        warn!(customer_id = %job.customer.id, step_id = %job.step.id, error = %e, "Failed to record message_sent");
    }
}

/// Timer lengths are clamped to ten years.
const MAX_TIMER_SECS: u64 = 10 * 365 * 24 * 3600;

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_TIMER_SECS) as i64)
}

fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Option<std::time::Duration> {
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}
