//! In-memory store
//!
//! Emulates the parts of PostgreSQL the transfer core relies on:
//!
//! - read committed: a transaction sees committed rows plus its own writes
//! - exclusive account row locks, held until commit or rollback
//! - sequences that are never rolled back
//! - foreign keys and unique constraints
//!
//! Lock waits are bounded by a timeout instead of a deadlock detector.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::error::StoreError;
use super::models::*;
use super::{Queries, Store, StoreTx};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Committed {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

struct Shared {
    state: Mutex<Committed>,
    row_locks: DashMap<i64, Arc<RowLock<()>>>,
    lock_timeout: Duration,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl Shared {
    fn committed(&self) -> MutexGuard<'_, Committed> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, id: i64) -> Arc<RowLock<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .value()
            .clone()
    }
}

/// In-process [`Store`] with per-row exclusive locks
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Committed::default()),
                row_locks: DashMap::new(),
                lock_timeout,
                account_seq: AtomicI64::new(1),
                entry_seq: AtomicI64::new(1),
                transfer_seq: AtomicI64::new(1),
                fail_commit: AtomicBool::new(false),
                fail_rollback: AtomicBool::new(false),
            }),
        }
    }

    /// Open a transaction with its own lock wait bound
    pub fn begin_with_lock_timeout(&self, lock_timeout: Duration) -> MemoryTx {
        MemoryTx {
            shared: self.shared.clone(),
            lock_timeout,
            held: HashMap::new(),
            users: BTreeMap::new(),
            created_users: BTreeSet::new(),
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
        }
    }

    /// Make every following commit fail (connection loss simulation)
    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Make every following rollback fail (connection loss simulation)
    pub fn set_fail_rollback(&self, fail: bool) {
        self.shared.fail_rollback.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(
            self.begin_with_lock_timeout(self.shared.lock_timeout),
        ))
    }
}

/// One open in-memory transaction.
///
/// Writes are staged locally and published on commit. Row locks are released
/// when the transaction is committed, rolled back or dropped.
pub struct MemoryTx {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    held: HashMap<i64, OwnedMutexGuard<()>>,
    users: BTreeMap<String, User>,
    created_users: BTreeSet<String>,
    /// `None` marks a deleted account
    accounts: BTreeMap<i64, Option<Account>>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

/// PostgreSQL's `'0001-01-01 00:00:00Z'` default for `password_changed_at`
fn zero_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl MemoryTx {
    async fn lock(&mut self, id: i64) -> Result<(), StoreError> {
        if self.held.contains_key(&id) {
            return Ok(());
        }
        let row = self.shared.row_lock(id);
        let guard = tokio::time::timeout(self.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout { account_id: id })?;
        self.held.insert(id, guard);
        Ok(())
    }

    fn account(&self, id: i64) -> Option<Account> {
        match self.accounts.get(&id) {
            Some(staged) => staged.clone(),
            None => self.shared.committed().accounts.get(&id).cloned(),
        }
    }

    fn user(&self, username: &str) -> Option<User> {
        self.users
            .get(username)
            .cloned()
            .or_else(|| self.shared.committed().users.get(username).cloned())
    }

    /// Committed rows overlaid with this transaction's staged rows
    fn visible_accounts(&self) -> BTreeMap<i64, Account> {
        let mut view = self.shared.committed().accounts.clone();
        for (id, staged) in &self.accounts {
            match staged {
                Some(account) => view.insert(*id, account.clone()),
                None => view.remove(id),
            };
        }
        view
    }

    fn visible_entries(&self) -> BTreeMap<i64, Entry> {
        let mut view = self.shared.committed().entries.clone();
        view.extend(self.entries.iter().map(|(id, e)| (*id, e.clone())));
        view
    }

    fn visible_transfers(&self) -> BTreeMap<i64, Transfer> {
        let mut view = self.shared.committed().transfers.clone();
        view.extend(self.transfers.iter().map(|(id, t)| (*id, t.clone())));
        view
    }

    fn visible_users(&self) -> BTreeMap<String, User> {
        let mut view = self.shared.committed().users.clone();
        view.extend(self.users.iter().map(|(k, u)| (k.clone(), u.clone())));
        view
    }

    fn stage_account(&mut self, account: Account) -> Account {
        self.accounts.insert(account.id, Some(account.clone()));
        account
    }

    /// Re-check constraints against rows other transactions committed
    /// meanwhile, then publish.
    fn publish(self) -> Result<(), StoreError> {
        let MemoryTx {
            shared,
            held,
            users,
            created_users,
            accounts,
            entries,
            transfers,
            ..
        } = self;

        {
            let mut state = shared.committed();

            for name in &created_users {
                if state.users.contains_key(name) {
                    return Err(StoreError::UniqueViolation {
                        constraint: "users_pkey".to_string(),
                    });
                }
            }
            for (name, user) in &users {
                if state
                    .users
                    .values()
                    .any(|u| u.username != *name && u.email == user.email)
                {
                    return Err(StoreError::UniqueViolation {
                        constraint: "users_email_key".to_string(),
                    });
                }
            }

            for account in accounts.values().flatten() {
                let clash = state.accounts.values().any(|other| {
                    other.id != account.id
                        && other.owner == account.owner
                        && other.currency == account.currency
                        && !accounts.contains_key(&other.id)
                });
                if clash {
                    return Err(StoreError::UniqueViolation {
                        constraint: "owner_currency_key".to_string(),
                    });
                }
            }

            state.users.extend(users);
            for (id, staged) in accounts {
                match staged {
                    Some(account) => state.accounts.insert(id, account),
                    None => state.accounts.remove(&id),
                };
            }
            state.entries.extend(entries);
            state.transfers.extend(transfers);
        }

        // row locks go only after the new rows are visible
        drop(held);
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        if self.user(&arg.owner).is_none() {
            return Err(StoreError::UserNotFound(arg.owner));
        }
        let duplicate = self
            .visible_accounts()
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(StoreError::UniqueViolation {
                constraint: "owner_currency_key".to_string(),
            });
        }

        let id = self.shared.account_seq.fetch_add(1, Ordering::SeqCst);
        self.lock(id).await?;
        Ok(self.stage_account(Account {
            id,
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        }))
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.account(id).ok_or(StoreError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        if self.account(id).is_none() {
            return Err(StoreError::AccountNotFound(id));
        }
        self.lock(id).await?;
        // re-read: the previous holder may have changed or deleted the row
        self.account(id).ok_or(StoreError::AccountNotFound(id))
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let rows = self
            .visible_accounts()
            .into_values()
            .filter(|a| a.owner == arg.owner)
            .collect();
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.lock(arg.id).await?;
        let mut account = self
            .account(arg.id)
            .ok_or(StoreError::AccountNotFound(arg.id))?;
        account.balance = account
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| StoreError::Overflow(format!("balance of account {}", arg.id)))?;
        Ok(self.stage_account(account))
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        self.lock(arg.id).await?;
        let mut account = self
            .account(arg.id)
            .ok_or(StoreError::AccountNotFound(arg.id))?;
        account.balance = arg.balance;
        Ok(self.stage_account(account))
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        self.lock(id).await?;
        if self.account(id).is_none() {
            return Err(StoreError::AccountNotFound(id));
        }
        if self.visible_entries().values().any(|e| e.account_id == id) {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "entries_account_id_fkey".to_string(),
            });
        }
        if self
            .visible_transfers()
            .values()
            .any(|t| t.from_account_id == id || t.to_account_id == id)
        {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "transfers_from_account_id_fkey".to_string(),
            });
        }
        self.accounts.insert(id, None);
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        if self.account(arg.account_id).is_none() {
            return Err(StoreError::AccountNotFound(arg.account_id));
        }
        let entry = Entry {
            id: self.shared.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.visible_entries()
            .remove(&id)
            .ok_or(StoreError::EntryNotFound(id))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let rows = self
            .visible_entries()
            .into_values()
            .filter(|e| e.account_id == arg.account_id)
            .collect();
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        for id in [arg.from_account_id, arg.to_account_id] {
            if self.account(id).is_none() {
                return Err(StoreError::AccountNotFound(id));
            }
        }
        if arg.amount <= 0 {
            return Err(StoreError::CheckViolation {
                constraint: "transfers_amount_positive".to_string(),
            });
        }
        let transfer = Transfer {
            id: self.shared.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.visible_transfers()
            .remove(&id)
            .ok_or(StoreError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let rows = self
            .visible_transfers()
            .into_values()
            .filter(|t| {
                t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
            })
            .collect();
        Ok(page(rows, arg.limit, arg.offset))
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let users = self.visible_users();
        if users.contains_key(&arg.username) {
            return Err(StoreError::UniqueViolation {
                constraint: "users_pkey".to_string(),
            });
        }
        if users.values().any(|u| u.email == arg.email) {
            return Err(StoreError::UniqueViolation {
                constraint: "users_email_key".to_string(),
            });
        }
        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            password_changed_at: zero_time(),
            created_at: Utc::now(),
            is_email_verified: false,
        };
        self.created_users.insert(user.username.clone());
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.user(username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        let mut user = self
            .user(&arg.username)
            .ok_or_else(|| StoreError::UserNotFound(arg.username.clone()))?;
        if let Some(email) = &arg.email
            && self
                .visible_users()
                .values()
                .any(|u| u.username != arg.username && u.email == *email)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "users_email_key".to_string(),
            });
        }
        if let Some(v) = arg.hashed_password {
            user.hashed_password = v;
        }
        if let Some(v) = arg.password_changed_at {
            user.password_changed_at = v;
        }
        if let Some(v) = arg.full_name {
            user.full_name = v;
        }
        if let Some(v) = arg.email {
            user.email = v;
        }
        if let Some(v) = arg.is_email_verified {
            user.is_email_verified = v;
        }
        self.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }
        (*self).publish()
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // staged writes and row locks are discarded with `self` either way
        if self.shared.fail_rollback.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("rollback failed".to_string()));
        }
        Ok(())
    }
}
