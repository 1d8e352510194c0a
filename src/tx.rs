//! Transaction Executor
//!
//! Runs a unit of work against a store handle bound to one transaction and
//! guarantees commit-or-rollback on every exit path:
//!
//! ```text
//! begin ──▶ unit of work ──Ok──▶ commit
//!                 │
//!                 ├─Err──────▶ rollback ──▶ original error
//!                 │                 └─fail─▶ RollbackFailed { both }
//!                 └─timeout──▶ rollback ──▶ Timeout
//! ```
//!
//! Dropping the future returned by [`TxExecutor::exec_tx`] drops the open
//! transaction, which rolls it back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::store::{Queries, Store};

pub struct TxExecutor {
    store: Arc<dyn Store>,
    tx_timeout: Duration,
}

impl TxExecutor {
    pub fn new(store: Arc<dyn Store>, tx_timeout: Duration) -> Self {
        Self { store, tx_timeout }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tx_timeout(&self) -> Duration {
        self.tx_timeout
    }

    /// Run `f` as one atomic unit of work.
    ///
    /// ```ignore
    /// let entry = executor
    ///     .exec_tx(|q| Box::pin(async move {
    ///         Ok(q.create_entry(CreateEntryParams { account_id, amount }).await?)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn exec_tx<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut dyn Queries) -> BoxFuture<'q, Result<T, LedgerError>> + Send,
    {
        let mut tx = self.store.begin().await?;
        debug!("Transaction started");

        let outcome = match tokio::time::timeout(self.tx_timeout, f(tx.queries())).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.tx_timeout)),
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %err, "Transaction rolled back");
                    Err(err)
                }
                Err(rollback) => {
                    warn!(error = %err, rollback_error = %rollback, "Rollback failed");
                    Err(LedgerError::RollbackFailed {
                        source: Box::new(err),
                        rollback,
                    })
                }
            },
        }
    }
}
