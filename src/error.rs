//! Ledger Error Types
//!
//! What callers of the transfer core can receive. A transfer either fully
//! happened or not at all; none of these imply partial effects.

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Input rejected before any store access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("Source and destination account are the same: {0}")]
    SameAccount(i64),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        amount: i64,
    },

    #[error("Currency mismatch: {from} -> {to}")]
    CurrencyMismatch { from: String, to: String },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Rollback failed ({rollback}) after: {source}")]
    RollbackFailed {
        source: Box<LedgerError>,
        rollback: StoreError,
    },

    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),
}

impl LedgerError {
    /// Error code for API responses and structured logs
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(ValidationError::InvalidAmount(_)) => "INVALID_AMOUNT",
            LedgerError::Validation(ValidationError::SameAccount(_)) => "SAME_ACCOUNT",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::Store(_) => "STORE_ERROR",
            LedgerError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            LedgerError::Timeout(_) => "TIMEOUT",
        }
    }

    /// True for lock conflicts where a fresh transfer may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_retryable())
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccountNotFound(id) => LedgerError::AccountNotFound(id),
            other => LedgerError::Store(other),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::from(StoreError::from(e))
    }
}
