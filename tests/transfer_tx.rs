//! Transfer transaction tests
//!
//! Each scenario is written once against `Arc<dyn Store>` and run on the
//! in-memory store and, with `--ignored`, on PostgreSQL.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use bank_ledger::store::Store;
use bank_ledger::{LedgerError, TransferCoordinator, ValidationError};

use common::{coordinator, create_account, entries_of, get_account, transfers_of};

// ============================================================================
// Scenarios
// ============================================================================

/// A=100, B=50; 30 moves, then 1000 is refused and nothing changes.
async fn transfer_then_overdraft(store: Arc<dyn Store>) {
    let coordinator = coordinator(store);
    let executor = coordinator.executor();
    let a = create_account(executor, 100, "USD").await;
    let b = create_account(executor, 50, "USD").await;

    let result = coordinator.transfer(a.id, b.id, 30).await.unwrap();

    assert_eq!(result.transfer.from_account_id, a.id);
    assert_eq!(result.transfer.to_account_id, b.id);
    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.from_entry.account_id, a.id);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.account_id, b.id);
    assert_eq!(result.to_entry.amount, 30);
    assert!(result.entries_balance());
    assert_eq!(result.from_account.id, a.id);
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.id, b.id);
    assert_eq!(result.to_account.balance, 80);

    let transfers = transfers_of(executor, a.id).await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0], result.transfer);
    assert_eq!(entries_of(executor, a.id).await, vec![result.from_entry.clone()]);
    assert_eq!(entries_of(executor, b.id).await, vec![result.to_entry.clone()]);

    let err = coordinator.transfer(a.id, b.id, 1000).await.unwrap_err();
    match err {
        LedgerError::InsufficientFunds {
            account_id,
            balance,
            amount,
        } => {
            assert_eq!(account_id, a.id);
            assert_eq!(balance, 70);
            assert_eq!(amount, 1000);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }

    assert_eq!(get_account(executor, a.id).await.balance, 70);
    assert_eq!(get_account(executor, b.id).await.balance, 80);
    assert_eq!(transfers_of(executor, a.id).await.len(), 1);
    assert_eq!(entries_of(executor, a.id).await.len(), 1);
    assert_eq!(entries_of(executor, b.id).await.len(), 1);
}

/// n concurrent transfers in one direction: every one applies exactly once.
async fn concurrent_same_direction(store: Arc<dyn Store>) {
    let coordinator = coordinator(store);
    let executor = coordinator.executor();
    let a = create_account(executor, 1000, "USD").await;
    let b = create_account(executor, 1000, "USD").await;

    let (from, to) = (a.id, b.id);
    let n = 5;
    let amount = 10;
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.transfer(from, to, amount).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.entries_balance());

        // each transfer observes the balances right after itself
        let diff_from = a.balance - result.from_account.balance;
        let diff_to = result.to_account.balance - b.balance;
        assert_eq!(diff_from, diff_to);
        assert!(diff_from > 0);
        assert_eq!(diff_from % amount, 0);

        let k = diff_from / amount;
        assert!((1..=n).contains(&k));
        assert!(seen.insert(k), "two transfers saw the same balance");
    }

    assert_eq!(
        get_account(executor, a.id).await.balance,
        a.balance - n * amount
    );
    assert_eq!(
        get_account(executor, b.id).await.balance,
        b.balance + n * amount
    );
}

/// Opposite-direction transfers between the same pair, interleaved. With
/// ascending-id locking none of them may end in a deadlock abort.
async fn opposite_directions_do_not_deadlock(store: Arc<dyn Store>) {
    let coordinator = coordinator(store);
    let executor = coordinator.executor();
    let a = create_account(executor, 1000, "USD").await;
    let b = create_account(executor, 1000, "USD").await;

    let iterations = 50;
    let amount = 10;
    let mut handles = Vec::with_capacity(iterations * 2);
    for _ in 0..iterations {
        for (from, to) in [(a.id, b.id), (b.id, a.id)] {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.transfer_with_retry(from, to, amount, 3).await
            }));
        }
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "transfer failed: {:?}", result.err());
    }

    // every A->B was matched by a B->A
    assert_eq!(get_account(executor, a.id).await.balance, a.balance);
    assert_eq!(get_account(executor, b.id).await.balance, b.balance);
    assert_eq!(transfers_of(executor, a.id).await.len(), iterations * 2);

    let entries = entries_of(executor, a.id).await;
    assert_eq!(entries.len(), iterations * 2);
    assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 0);
}

/// Failures at any step leave no row behind.
async fn failures_leave_no_trace(store: Arc<dyn Store>) {
    let coordinator = coordinator(store);
    let executor = coordinator.executor();
    let a = create_account(executor, 20, "USD").await;
    let b = create_account(executor, 0, "USD").await;
    let euro = create_account(executor, 500, "EUR").await;
    let missing = i64::MAX;

    let err = coordinator.transfer(a.id, b.id, 21).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    let err = coordinator.transfer(a.id, missing, 5).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(id) if id == missing));

    let err = coordinator.transfer(missing, a.id, 5).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(id) if id == missing));

    let err = coordinator.transfer(euro.id, a.id, 5).await.unwrap_err();
    assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));

    let err = coordinator.transfer(a.id, a.id, 5).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::SameAccount(_))
    ));

    let err = coordinator.transfer(a.id, b.id, -5).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::InvalidAmount(-5))
    ));

    for (account, balance) in [(&a, 20), (&b, 0), (&euro, 500)] {
        assert_eq!(get_account(executor, account.id).await.balance, balance);
        assert!(transfers_of(executor, account.id).await.is_empty());
        assert!(entries_of(executor, account.id).await.is_empty());
    }

    // draining to exactly zero is allowed
    let result = coordinator.transfer(a.id, b.id, 20).await.unwrap();
    assert_eq!(result.from_account.balance, 0);
    assert_eq!(result.to_account.balance, 20);
}

/// Mixed concurrent traffic over a ring of accounts: money is conserved,
/// nobody goes negative, and entries explain every balance.
async fn ring_traffic_conserves_money(store: Arc<dyn Store>) {
    let coordinator: Arc<TransferCoordinator> = coordinator(store);
    let executor = coordinator.executor();

    let initial = [50_i64, 0, 120, 30];
    let mut accounts = Vec::new();
    for balance in initial {
        accounts.push(create_account(executor, balance, "USD").await);
    }
    let ids: Vec<i64> = accounts.iter().map(|a| a.id).collect();

    let mut handles = Vec::new();
    for i in 0..40_usize {
        let from = ids[i % ids.len()];
        let to = ids[(i * 3 + 1) % ids.len()];
        if from == to {
            continue;
        }
        let amount = 5 + (i as i64 % 4) * 10;
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.transfer_with_retry(from, to, amount, 3).await
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert!(result.from_account.balance >= 0);
                assert!(result.entries_balance());
            }
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let mut total = 0;
    for (account, start) in accounts.iter().zip(initial) {
        let now = get_account(executor, account.id).await;
        assert!(now.balance >= 0);
        let entry_sum: i64 = entries_of(executor, account.id)
            .await
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(start + entry_sum, now.balance);
        total += now.balance;
    }
    assert_eq!(total, initial.iter().sum::<i64>());
}

// ============================================================================
// In-memory store
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_then_overdraft() {
    transfer_then_overdraft(common::memory_store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_direction() {
    concurrent_same_direction(common::memory_store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_directions_do_not_deadlock() {
    opposite_directions_do_not_deadlock(common::memory_store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_leave_no_trace() {
    failures_leave_no_trace(common::memory_store()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_traffic_conserves_money() {
    ring_traffic_conserves_money(common::memory_store()).await;
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_transfer_then_overdraft() {
    transfer_then_overdraft(common::pg_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_concurrent_same_direction() {
    concurrent_same_direction(common::pg_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_opposite_directions_do_not_deadlock() {
    opposite_directions_do_not_deadlock(common::pg_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_failures_leave_no_trace() {
    failures_leave_no_trace(common::pg_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_ring_traffic_conserves_money() {
    ring_traffic_conserves_money(common::pg_store().await).await;
}
