//! Store Error Types

use thiserror::Error;

/// Errors raised by the record store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Transfer not found: {0}")]
    TransferNotFound(i64),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("Foreign key constraint violated: {constraint}")]
    ForeignKeyViolation { constraint: String },

    #[error("Check constraint violated: {constraint}")]
    CheckViolation { constraint: String },

    #[error("Numeric value out of range: {0}")]
    Overflow(String),

    #[error("Timed out waiting for row lock on account {account_id}")]
    LockTimeout { account_id: i64 },

    #[error("Transaction aborted by lock conflict: {0}")]
    Deadlock(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Conflicts that a fresh attempt of the same unit of work may not hit again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Deadlock(_) | StoreError::LockTimeout { .. }
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            let constraint = db.constraint().unwrap_or_default().to_string();
            match db.code().as_deref() {
                // unique_violation
                Some("23505") => return StoreError::UniqueViolation { constraint },
                // foreign_key_violation
                Some("23503") => return StoreError::ForeignKeyViolation { constraint },
                // check_violation
                Some("23514") => return StoreError::CheckViolation { constraint },
                // numeric_value_out_of_range
                Some("22003") => return StoreError::Overflow(db.message().to_string()),
                // deadlock_detected, serialization_failure
                Some("40P01") | Some("40001") => {
                    return StoreError::Deadlock(db.message().to_string());
                }
                _ => {}
            }
        }
        StoreError::Database(e)
    }
}
