use thiserror::Error;
use uuid::Uuid;

pub type CourierResult<T> = Result<T, CourierError>;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step type '{0}' is not implemented")]
    NotImplemented(&'static str),

    #[error("Step {0} not found")]
    MissingStep(Uuid),

    #[error("Template {0} not found")]
    MissingTemplate(Uuid),

    #[error("Journey {0} not found")]
    JourneyNotFound(Uuid),

    #[error("Admission refused for journey {journey_id}: {reason}")]
    AdmissionRefused { journey_id: Uuid, reason: String },

    #[error("Customer {customer_id} is already in journey {journey_id}")]
    AlreadyInJourney { customer_id: String, journey_id: Uuid },

    #[error("Customer {customer_id} is not at step {step_id}")]
    NotAtStep { customer_id: String, step_id: Uuid },

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CourierError {
    /// Transient faults are handed to the queue's retry policy; the rest fail the job.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::Delivery(_) | CourierError::Store(_) | CourierError::Queue(_)
        )
    }
}

/// Failure reported by a message sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFault {
    /// Messaging quota exhausted; the send is aborted without retry.
    #[error("payment or quota required: {0}")]
    Quota(String),

    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Permanent provider rejection (invalid address, blocked content).
    #[error("rejected by provider: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CourierError::Delivery("timeout".into()).is_retryable());
        assert!(CourierError::Store("redis down".into()).is_retryable());
        assert!(!CourierError::NotImplemented("tracker").is_retryable());
        assert!(!CourierError::MissingStep(Uuid::nil()).is_retryable());
    }
}
