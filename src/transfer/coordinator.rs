//! Transfer Coordinator
//!
//! Validates the request, then runs the debit/credit/audit protocol as a
//! single unit of work on the [`TxExecutor`].

use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::{BalanceLeg, TransferResult};
use crate::error::{LedgerError, ValidationError};
use crate::store::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Queries,
};
use crate::tx::TxExecutor;

/// Transfer Coordinator - atomic account-to-account fund movement
pub struct TransferCoordinator {
    executor: TxExecutor,
}

impl TransferCoordinator {
    pub fn new(executor: TxExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &TxExecutor {
        &self.executor
    }

    /// Move `amount` from `from_account_id` to `to_account_id`.
    ///
    /// Either the transfer row, both entries and both balance updates are
    /// committed together, or nothing is. Never retries on its own.
    pub async fn transfer(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<TransferResult, LedgerError> {
        validate(from_account_id, to_account_id, amount)?;

        let result = self
            .executor
            .exec_tx(move |q| {
                Box::pin(async move { transfer_tx(q, from_account_id, to_account_id, amount).await })
            })
            .await;

        match &result {
            Ok(r) => info!(
                transfer_id = r.transfer.id,
                from = from_account_id,
                to = to_account_id,
                amount,
                from_balance = r.from_account.balance,
                to_balance = r.to_account.balance,
                "Transfer committed"
            ),
            Err(e) => warn!(
                from = from_account_id,
                to = to_account_id,
                amount,
                code = e.code(),
                error = %e,
                "Transfer rejected"
            ),
        }
        result
    }

    /// [`transfer`](Self::transfer), re-run from scratch on lock conflicts
    /// (deadlock victim, lock wait timeout) up to `max_attempts` times in
    /// total. Every attempt is a fresh transfer; business errors are returned
    /// immediately.
    pub async fn transfer_with_retry(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
        max_attempts: u32,
    ) -> Result<TransferResult, LedgerError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transfer(from_account_id, to_account_id, amount).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Retrying transfer after lock conflict");
                    attempt += 1;
                    // back off a little more on each attempt
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

fn validate(from_account_id: i64, to_account_id: i64, amount: i64) -> Result<(), ValidationError> {
    if amount <= 0 {
        return Err(ValidationError::InvalidAmount(amount));
    }
    if from_account_id == to_account_id {
        return Err(ValidationError::SameAccount(from_account_id));
    }
    Ok(())
}

/// The unit of work. Runs entirely inside one transaction.
async fn transfer_tx(
    q: &mut dyn Queries,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
) -> Result<TransferResult, LedgerError> {
    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id,
            to_account_id,
            amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: from_account_id,
            amount: -amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: to_account_id,
            amount,
        })
        .await?;

    let (from_account, to_account) = add_money(
        q,
        BalanceLeg::new(from_account_id, -amount),
        BalanceLeg::new(to_account_id, amount),
    )
    .await?;

    if from_account.currency != to_account.currency {
        return Err(LedgerError::CurrencyMismatch {
            from: from_account.currency,
            to: to_account.currency,
        });
    }

    if from_account.balance < 0 {
        return Err(LedgerError::InsufficientFunds {
            account_id: from_account_id,
            balance: from_account.balance + amount,
            amount,
        });
    }

    Ok(TransferResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply two balance legs, locking rows in ascending account id order.
///
/// Returns the post-update snapshots in argument order.
pub async fn add_money(
    q: &mut dyn Queries,
    first: BalanceLeg,
    second: BalanceLeg,
) -> Result<(Account, Account), LedgerError> {
    if first.account_id <= second.account_id {
        let a = apply_leg(q, first).await?;
        let b = apply_leg(q, second).await?;
        Ok((a, b))
    } else {
        let b = apply_leg(q, second).await?;
        let a = apply_leg(q, first).await?;
        Ok((a, b))
    }
}

async fn apply_leg(q: &mut dyn Queries, leg: BalanceLeg) -> Result<Account, LedgerError> {
    q.get_account_for_update(leg.account_id).await?;
    let account = q
        .add_account_balance(AddAccountBalanceParams {
            id: leg.account_id,
            amount: leg.delta,
        })
        .await?;
    debug!(
        account_id = leg.account_id,
        delta = leg.delta,
        balance = account.balance,
        "Balance updated"
    );
    Ok(account)
}
