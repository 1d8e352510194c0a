//! Transfer Coordinator
//!
//! Moves a positive amount between two accounts inside one transaction:
//!
//! ```text
//! create_transfer ─▶ debit entry ─▶ credit entry ─▶ add_money (ascending id)
//!                                                       │
//!                              source balance < 0 ◀─────┘ ─▶ InsufficientFunds, rollback
//! ```
//!
//! # Deadlock avoidance
//!
//! Every path that locks more than one account goes through [`add_money`],
//! which locks rows in ascending account id order. Two transfers between the
//! same pair of accounts in opposite directions therefore queue on the same
//! row instead of each holding the row the other one needs.

pub mod coordinator;
pub mod types;

pub use coordinator::{TransferCoordinator, add_money};
pub use types::{BalanceLeg, TransferResult};
