//! Record Store
//!
//! Per-entity reads and writes for accounts, entries, transfers and users.
//! Nothing in here coordinates across rows; that is the job of
//! [`crate::tx::TxExecutor`] and [`crate::transfer::TransferCoordinator`].
//!
//! # Backends
//!
//! - [`PgStore`]: PostgreSQL through sqlx
//! - [`MemoryStore`]: in-process store with per-row exclusive locks, used by
//!   tests and the demo binary

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

pub use error::StoreError;
pub use memory::{MemoryStore, MemoryTx};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, UpdateUserParams, User,
};
pub use postgres::{PgQueries, PgStore};

use async_trait::async_trait;

/// Single-entity operations, bound either to a connection or to an
/// in-flight transaction.
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Locking read. The exclusive row lock is held until the enclosing
    /// transaction commits or rolls back.
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    async fn list_accounts(&mut self, arg: ListAccountsParams)
    -> Result<Vec<Account>, StoreError>;

    /// Atomic relative update, returns the post-update snapshot.
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError>;

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError>;

    // === Entries ===
    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    // === Transfers ===
    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Users ===
    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError>;
}

/// A store handle bound to one open transaction.
///
/// Dropping it without calling [`StoreTx::commit`] rolls the transaction back.
#[async_trait]
pub trait StoreTx: Queries {
    /// View this transaction as its query surface
    fn queries(&mut self) -> &mut dyn Queries;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Source of transactions
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}
