// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # LucePay Transfers
//!
//! This library moves money between two wallet balances with exactly-once
//! semantics under concurrent access, and leaves a verifiable trail behind:
//! every transfer writes one transaction, a debit and a credit ledger entry,
//! and one audit log, or nothing at all.
//!
//! ## Core Components
//!
//! - [`TransferService`]: Request entry point returning a uniform [`TransferResult`]
//! - [`TransferEngine`]: Locked, atomic transfer against a [`Store`]
//! - [`IdempotencyCoordinator`]: Client-token deduplication
//! - [`MemoryStore`]: In-process store with row locks and a unique token index
//! - [`Reconciler`]: Sweep comparing balances against ledger sums
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use lucepay_tx::{Currency, MemoryStore, NewAccount, Store, TransferEngine, UserId};
//!
//! let store = Arc::new(MemoryStore::new());
//! let alice = store
//!     .create_account(NewAccount::new(UserId(1), Currency::new("USD")).with_opening_balance(100))
//!     .unwrap();
//! let bob = store
//!     .create_account(NewAccount::new(UserId(2), Currency::new("USD")))
//!     .unwrap();
//!
//! let engine = TransferEngine::new(Arc::clone(&store));
//! let receipt = engine.transfer(&alice, &bob, 40, "order-17").unwrap();
//! assert!(!receipt.is_replay());
//!
//! let balances: Vec<i64> = store
//!     .find_accounts(&[alice.id, bob.id])
//!     .unwrap()
//!     .iter()
//!     .map(|account| account.balance)
//!     .collect();
//! assert_eq!(balances, vec![60, 40]);
//! ```
//!
//! ## Thread Safety
//!
//! Transfers on disjoint account pairs run in parallel. Overlapping pairs
//! serialize on row locks, always taken in ascending account id order.

pub mod account;
pub mod audit;
pub mod base;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transaction;

pub use account::{Account, NewAccount};
pub use audit::AuditLog;
pub use base::{AccountId, AuditLogId, Currency, LedgerEntryId, TransactionId, UserId};
pub use config::{EngineConfig, LogConfig};
pub use engine::{Disposition, TransferEngine, TransferReceipt};
pub use error::{StoreError, TransferError, ValidationError};
pub use idempotency::IdempotencyCoordinator;
pub use ledger::{Consistency, Direction, EntryType, LedgerEntry, Mismatch, verify_ledger_consistency};
pub use logging::init_logging;
pub use metrics::{AtomicMetrics, Metrics, NoopMetrics};
pub use reconcile::{Reconciler, ReconciliationReport};
pub use scheduler::{
    InlineScheduler, Job, JobError, RetryPolicy, Scheduler, SchedulerError, WorkerScheduler,
};
pub use service::{TransferRequest, TransferResult, TransferService};
pub use store::{MemoryStore, Store, UnitOfWork};
pub use transaction::{Transaction, TransactionStatus};
