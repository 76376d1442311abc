//! Crate-level error taxonomy.
//!
//! Validation and not-found errors are returned synchronously to the
//! caller; dispatch and location failures are absorbed into episode
//! state and never surface as errors (see `dispatch` and `location`).

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EmergencyError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock poisoned")]
    LockPoisoned,
}
