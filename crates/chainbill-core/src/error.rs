use thiserror::Error;
use uuid::Uuid;

use crate::models::SubscriptionStatus;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("subscription cannot move from {from} to {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }
}
