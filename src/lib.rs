//! bank_ledger - transactional core of a double-entry ledger
//!
//! Moves funds between two accounts by debiting one, crediting the other and
//! recording both legs as immutable entries, all in one database transaction.
//!
//! # Modules
//!
//! - [`store`] - Record store: per-entity queries, PostgreSQL and in-memory backends
//! - [`tx`] - Transaction executor (commit-or-rollback on every exit path)
//! - [`transfer`] - Transfer coordinator with ascending-id lock ordering
//! - [`error`] - Error taxonomy returned to callers
//! - [`db`] - Connection pool lifecycle and schema bootstrap
//! - [`config`] / [`logging`] - Ambient setup for the binary

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod store;
pub mod transfer;
pub mod tx;

// Convenient re-exports at crate root
pub use error::{LedgerError, ValidationError};
pub use store::{Account, Entry, MemoryStore, PgStore, Queries, Store, StoreError, Transfer, User};
pub use transfer::{TransferCoordinator, TransferResult};
pub use tx::TxExecutor;
