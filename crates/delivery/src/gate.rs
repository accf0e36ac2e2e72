//! Send gate: decides whether a message step's side effect may execute now.
//!
//! Guards run in a fixed order, each only while the decision is still `Send`:
//! quiet hours, distinct-customers cap, per-minute cap, mock mode.

use chrono::{DateTime, Utc};
use courier_core::types::{Channel, Journey, Template};
use courier_core::CourierResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::quiet_hours::{self, QuietHoursVerdict};
use crate::rate_limit::{next_minute, LimitCheck, RateLimiter, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum SendVerdict {
    Send,
    QuietRequeue { at: DateTime<Utc> },
    QuietAbort,
    LimitRequeue { at: DateTime<Utc> },
    LimitHold,
    MockSend,
}

impl SendVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            SendVerdict::Send => "send",
            SendVerdict::QuietRequeue { .. } => "quiet_requeue",
            SendVerdict::QuietAbort => "quiet_abort",
            SendVerdict::LimitRequeue { .. } => "limit_requeue",
            SendVerdict::LimitHold => "limit_hold",
            SendVerdict::MockSend => "mock_send",
        }
    }

    /// `Send` and `MockSend` consume the reservation; every other verdict holds none.
    pub fn is_send(&self) -> bool {
        matches!(self, SendVerdict::Send | SendVerdict::MockSend)
    }
}

/// Gate outcome plus the counters it took on the way.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub verdict: SendVerdict,
    pub reservation: Reservation,
}

impl GateDecision {
    fn without_reservation(verdict: SendVerdict) -> Self {
        Self {
            verdict,
            reservation: Reservation::default(),
        }
    }
}

#[derive(Clone)]
pub struct SendGate {
    limiter: RateLimiter,
    mock_send: bool,
}

impl SendGate {
    pub fn new(limiter: RateLimiter, mock_send: bool) -> Self {
        Self { limiter, mock_send }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn evaluate(
        &self,
        journey: &Journey,
        template: &Template,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> CourierResult<GateDecision> {
        let decision = self.decide(journey, template, customer_id, now).await?;
        metrics::counter!("gate.decisions", "decision" => decision.verdict.label()).increment(1);
        debug!(
            journey_id = %journey.id,
            customer_id = %customer_id,
            decision = decision.verdict.label(),
            "Send gate resolved"
        );
        Ok(decision)
    }

    async fn decide(
        &self,
        journey: &Journey,
        template: &Template,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> CourierResult<GateDecision> {
        match quiet_hours::evaluate(&journey.settings.quiet_hours, now) {
            QuietHoursVerdict::Requeue { at } => {
                return Ok(GateDecision::without_reservation(
                    SendVerdict::QuietRequeue { at },
                ))
            }
            QuietHoursVerdict::Abort => {
                return Ok(GateDecision::without_reservation(SendVerdict::QuietAbort))
            }
            QuietHoursVerdict::Clear => {}
        }

        let mut reservation = Reservation::default();

        match self.limiter.admit_customer(journey, customer_id, now).await? {
            LimitCheck::Exceeded { current, max } => {
                debug!(journey_id = %journey.id, current, max, "Distinct customer cap reached");
                return Ok(GateDecision::without_reservation(SendVerdict::LimitHold));
            }
            LimitCheck::Allowed { reserved } => reservation.keys.extend(reserved),
        }

        match self.limiter.admit_send(journey, now).await {
            Ok(LimitCheck::Exceeded { current, max }) => {
                debug!(journey_id = %journey.id, current, max, "Per-minute send cap reached");
                self.limiter.refund(journey.id, &reservation).await;
                return Ok(GateDecision::without_reservation(
                    SendVerdict::LimitRequeue {
                        at: next_minute(now),
                    },
                ));
            }
            Ok(LimitCheck::Allowed { reserved }) => reservation.keys.extend(reserved),
            Err(e) => {
                self.limiter.refund(journey.id, &reservation).await;
                return Err(e);
            }
        }

        // A mock send keeps its reservation: it is counted like the send it stands in for.
        let has_side_channel = template.webhook.is_some() || template.channel == Channel::Webhook;
        let verdict = if self.mock_send && !has_side_channel {
            SendVerdict::MockSend
        } else {
            SendVerdict::Send
        };

        Ok(GateDecision {
            verdict,
            reservation,
        })
    }
}
