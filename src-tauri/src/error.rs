use thiserror::Error;

use crate::crypto::CryptoError;
use crate::kv::StorageError;
use crate::record::ApplicationId;
use crate::status::ApplicationStatus;

/// Errors surfaced by the record store, the budget ledger and the admin console.
///
/// None of these are retried by the core; the caller decides how to present them.
#[derive(Debug, Error)]
pub enum BursaryError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("application {0} not found")]
    NotFound(ApplicationId),

    #[error("application {id} is a final submission; {field} cannot be edited")]
    ImmutableRecord {
        id: ApplicationId,
        field: &'static str,
    },

    #[error("application {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ApplicationId,
        from: ApplicationStatus,
        to: ApplicationStatus,
    },

    #[error("insufficient budget: requested {requested}, available {available}")]
    InsufficientBudget { requested: u64, available: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl BursaryError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        BursaryError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

pub type BursaryResult<T> = Result<T, BursaryError>;
