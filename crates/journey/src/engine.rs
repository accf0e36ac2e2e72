use std::sync::Arc;

use courier_core::event_bus::make_event;
use courier_core::types::{
    Customer, Job, Journey, JourneyLocation, LockState, QueuePayload, StepKind,
    TelemetryEventType, TriggerEvent,
};
use courier_core::{CourierError, CourierResult};
use courier_delivery::rate_limit::RateUsage;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{EngineContext, StepDispatcher};
use crate::registry::JourneyRegistry;

/// Handle returned for every job placed on the queue by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ticket {
    pub job_id: Uuid,
    pub session: Uuid,
}

/// Entry points used by external collaborators: admission, re-entry and
/// journey lifecycle.
#[derive(Clone)]
pub struct JourneyEngine {
    ctx: Arc<EngineContext>,
    dispatcher: Arc<StepDispatcher>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("journeys", &self.ctx.journeys.list().len())
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            dispatcher: Arc::new(StepDispatcher::new(ctx.clone())),
            ctx,
        }
    }

    /// The dispatcher to hand to a worker pool.
    pub fn dispatcher(&self) -> Arc<StepDispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> &Arc<JourneyRegistry> {
        &self.ctx.journeys
    }

    /// Places a customer at the journey's start step and enqueues the Start job.
    ///
    /// The location is created already reserved for that job, so nothing else
    /// can move the customer before it runs.
    pub async fn admit(
        &self,
        customer: Customer,
        journey_id: Uuid,
        starting_step: Uuid,
        event: Option<TriggerEvent>,
    ) -> CourierResult<Ticket> {
        let journey = self.admissible(journey_id)?;
        let step = self
            .ctx
            .steps
            .get_by_id(starting_step)
            .await?
            .ok_or(CourierError::MissingStep(starting_step))?;
        if step.journey_id != journey_id || !matches!(step.kind, StepKind::Start(_)) {
            return Err(CourierError::AdmissionRefused {
                journey_id,
                reason: format!("step {starting_step} is not a start step of this journey"),
            });
        }

        let now = self.ctx.clock.now();
        let job_id = Uuid::new_v4();
        let mut location = JourneyLocation::new(&customer.id, journey_id, step.id, now);
        location.lock = LockState::Reserved { token: job_id };
        location.locked_at = Some(now);

        if !self.ctx.locations.admit(location.clone()).await? {
            return Err(CourierError::AlreadyInJourney {
                customer_id: customer.id,
                journey_id,
            });
        }

        let session = Uuid::new_v4();
        let customer_id = customer.id.clone();
        let job = Job {
            id: job_id,
            step,
            owner_id: journey.owner_id,
            journey,
            customer,
            location,
            session,
            event,
            branch: None,
        };
        if let Err(e) = self
            .ctx
            .queue
            .enqueue(QueuePayload::Step(Box::new(job)), None)
            .await
        {
            self.ctx
                .locations
                .store()
                .finalize(&customer_id, journey_id, job_id)
                .await?;
            return Err(e);
        }

        self.ctx.telemetry.emit(
            make_event(
                TelemetryEventType::JourneyEntered,
                journey_id,
                customer_id.as_str(),
                Some(starting_step),
            )
            .with_session(session),
        );
        info!(journey_id = %journey_id, customer_id = %customer_id, session = %session, "Customer admitted");
        Ok(Ticket { job_id, session })
    }

    /// Re-enters a customer resting at `step_id`, e.g. after a wait-until
    /// event or a lifted hold.
    pub async fn resume(
        &self,
        customer: Customer,
        journey_id: Uuid,
        step_id: Uuid,
        event: Option<TriggerEvent>,
    ) -> CourierResult<Ticket> {
        let journey = self
            .ctx
            .journeys
            .get(journey_id)
            .ok_or(CourierError::JourneyNotFound(journey_id))?;
        if journey.is_stopped {
            return Err(CourierError::AdmissionRefused {
                journey_id,
                reason: "journey is stopped".to_string(),
            });
        }

        let location = self
            .ctx
            .locations
            .get(&customer.id, journey_id)
            .await?
            .filter(|l| l.current_step_id == step_id)
            .ok_or_else(|| CourierError::NotAtStep {
                customer_id: customer.id.clone(),
                step_id,
            })?;
        let step = self
            .ctx
            .steps
            .get_by_id(step_id)
            .await?
            .ok_or(CourierError::MissingStep(step_id))?;

        let job = Job {
            id: Uuid::new_v4(),
            step,
            owner_id: journey.owner_id,
            journey,
            customer,
            location,
            session: Uuid::new_v4(),
            event,
            branch: None,
        };
        let ticket = Ticket {
            job_id: job.id,
            session: job.session,
        };
        info!(journey_id = %journey_id, customer_id = %job.customer.id, step_id = %step_id, "Customer resumed");
        self.ctx
            .queue
            .enqueue(QueuePayload::Step(Box::new(job)), None)
            .await?;
        Ok(ticket)
    }

    pub fn pause(&self, journey_id: Uuid) -> CourierResult<Journey> {
        self.ctx.journeys.pause(journey_id)
    }

    pub fn unpause(&self, journey_id: Uuid) -> CourierResult<Journey> {
        self.ctx.journeys.unpause(journey_id)
    }

    pub fn stop(&self, journey_id: Uuid) -> CourierResult<Journey> {
        self.ctx.journeys.stop(journey_id)
    }

    pub async fn location(
        &self,
        customer_id: &str,
        journey_id: Uuid,
    ) -> CourierResult<Option<JourneyLocation>> {
        self.ctx.locations.get(customer_id, journey_id).await
    }

    /// Current rate counters of a journey, read without modifying them.
    pub async fn usage(&self, journey_id: Uuid) -> CourierResult<RateUsage> {
        let journey = self
            .ctx
            .journeys
            .get(journey_id)
            .ok_or(CourierError::JourneyNotFound(journey_id))?;
        self.ctx
            .gate
            .limiter()
            .usage(&journey, self.ctx.clock.now())
            .await
    }

    fn admissible(&self, journey_id: Uuid) -> CourierResult<Journey> {
        let journey = self
            .ctx
            .journeys
            .get(journey_id)
            .ok_or(CourierError::JourneyNotFound(journey_id))?;
        let refusal = if journey.is_stopped {
            Some("journey is stopped")
        } else if journey.is_paused {
            Some("journey is paused")
        } else {
            None
        };
        match refusal {
            Some(reason) => Err(CourierError::AdmissionRefused {
                journey_id,
                reason: reason.to_string(),
            }),
            None => Ok(journey),
        }
    }
}
