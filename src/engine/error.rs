use thiserror::Error;
use ulid::Ulid;

use crate::model::{Date, SubscriptionStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input. Nothing was written.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("no override for subscription {subscription_id} on {date}")]
    OverrideNotFound { subscription_id: Ulid, date: Date },
    #[error("already exists with different content: {0}")]
    AlreadyExists(Ulid),
    /// The subscription is stopped; stopped is terminal.
    #[error("subscription {0} is stopped")]
    Conflict(Ulid),
    #[error("cannot move subscription {id} from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    /// Stored data is inconsistent. Resolution of the affected record fails loudly
    /// instead of producing an empty day.
    #[error("integrity violation: subscription {subscription_id} points at customer {customer_id}, which does not exist or does not own it")]
    Integrity {
        subscription_id: Ulid,
        customer_id: Ulid,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
