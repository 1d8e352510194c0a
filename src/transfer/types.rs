//! Transfer result and balance leg types

use serde::{Deserialize, Serialize};

use crate::store::{Account, Entry, Transfer};

/// Everything one successful transfer produced, in caller order
/// (source first) regardless of the order rows were locked in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

impl TransferResult {
    /// Both legs of a transfer cancel out
    pub fn entries_balance(&self) -> bool {
        self.from_entry.amount + self.to_entry.amount == 0
    }
}

/// Signed balance change for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceLeg {
    pub account_id: i64,
    pub delta: i64,
}

impl BalanceLeg {
    pub fn new(account_id: i64, delta: i64) -> Self {
        Self { account_id, delta }
    }
}
