//! PostgreSQL backend
//!
//! The same SQL serves pooled connections and open transactions: both
//! dereference to a `PgConnection`.

use std::ops::DerefMut;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use super::error::StoreError;
use super::models::*;
use super::{Queries, Store, StoreTx};
use crate::db::Database;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, full_name, email, \
                            password_changed_at, created_at, is_email_verified";

/// Map a foreign-key violation to the missing record it points at.
///
/// `refs` pairs a constraint-name fragment with the error to report when the
/// violated constraint contains it.
fn fk_error(e: sqlx::Error, refs: Vec<(&'static str, StoreError)>) -> StoreError {
    match StoreError::from(e) {
        StoreError::ForeignKeyViolation { constraint } => refs
            .into_iter()
            .find(|(fragment, _)| constraint.contains(*fragment))
            .map(|(_, err)| err)
            .unwrap_or_else(|| StoreError::ForeignKeyViolation { constraint }),
        other => other,
    }
}

/// Queries over any PostgreSQL connection (pooled or transactional)
pub struct PgQueries<C> {
    conn: C,
}

impl<C> PgQueries<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<C> Queries for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let owner = arg.owner.clone();
        sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(&arg.currency)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| fk_error(e, vec![("owner", StoreError::UserNotFound(owner))]))
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        // NO KEY UPDATE: entry/transfer inserts take KEY SHARE on the same row
        // for their foreign keys and must not block on it.
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::AccountNotFound(id))
    }

    async fn list_accounts(
        &mut self,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.amount)
        .bind(arg.id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::AccountNotFound(arg.id))
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id)
        .bind(arg.balance)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::AccountNotFound(arg.id))
    }

    async fn delete_account(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| {
            fk_error(
                e,
                vec![("account_id", StoreError::AccountNotFound(arg.account_id))],
            )
        })
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::EntryNotFound(id))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(arg.account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| {
            fk_error(
                e,
                vec![
                    (
                        "from_account",
                        StoreError::AccountNotFound(arg.from_account_id),
                    ),
                    ("to_account", StoreError::AccountNotFound(arg.to_account_id)),
                ],
            )
        })
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or(StoreError::TransferNotFound(id))
    }

    async fn list_transfers(
        &mut self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let rows = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4"
        ))
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.username)
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(row)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
        ))
        .bind(username)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET \
                hashed_password = COALESCE($1, hashed_password), \
                password_changed_at = COALESCE($2, password_changed_at), \
                full_name = COALESCE($3, full_name), \
                email = COALESCE($4, email), \
                is_email_verified = COALESCE($5, is_email_verified) \
             WHERE username = $6 RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.hashed_password)
        .bind(arg.password_changed_at)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .bind(arg.is_email_verified)
        .bind(&arg.username)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(arg.username.clone()))
    }
}

#[async_trait]
impl StoreTx for PgQueries<Transaction<'static, Postgres>> {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.rollback().await?;
        Ok(())
    }
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Autocommit query handle on a pooled connection
    pub async fn conn(&self) -> Result<PgQueries<PoolConnection<Postgres>>, StoreError> {
        Ok(PgQueries::new(self.pool.acquire().await?))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgQueries::new(tx)))
    }
}
