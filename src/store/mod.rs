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

//! Storage ports.
//!
//! The logical layout is four tables: accounts, transactions, ledger_entries
//! and audit_logs. [`Store`] covers committed reads and onboarding;
//! [`UnitOfWork`] is one all-or-nothing transaction against the store with
//! explicit "lock for update" semantics on account rows.
//!
//! # Unit of work contract
//!
//! - Writes staged in a unit are invisible to everyone else until
//!   [`UnitOfWork::commit`].
//! - Dropping a unit without committing rolls it back and releases its locks.
//! - Account row locks are exclusive and held until commit or rollback.
//! - Inserting a transaction whose `client_token` is already taken fails with
//!   [`StoreError::UniqueViolation`] on [`CLIENT_TOKEN_CONSTRAINT`]. An insert
//!   racing a not-yet-committed claim on the same token waits for that claim to
//!   resolve first.

pub mod memory;

use crate::account::{Account, NewAccount};
use crate::audit::{AuditLog, NewAuditLog};
use crate::base::{AccountId, TransactionId};
use crate::error::StoreError;
use crate::ledger::{LedgerEntry, NewLedgerEntry};
use crate::transaction::{NewTransaction, Transaction};

pub use memory::MemoryStore;

/// Unique constraint on `transactions.client_token`.
pub const CLIENT_TOKEN_CONSTRAINT: &str = "transactions_client_token_key";

/// Balance and ledger sum of one account, read as of the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub account: AccountId,
    pub balance: i64,
    /// `None` when the deltas overflow.
    pub ledger_sum: Option<i64>,
    pub entries: usize,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub accounts: usize,
    pub transactions: usize,
    pub ledger_entries: usize,
    pub audit_logs: usize,
}

pub trait Store: Send + Sync {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    /// Starts a new unit of work.
    fn begin(&self) -> Result<Self::Unit<'_>, StoreError>;

    /// Onboards a wallet. A positive opening balance is booked as a credit entry.
    fn create_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    /// Loads the committed state of the given accounts, waiting out row locks
    /// held by open units. Missing ids are skipped.
    fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    fn account_ids(&self) -> Result<Vec<AccountId>, StoreError>;

    fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Committed transaction carrying `client_token`, if any.
    fn find_transaction_by_token(
        &self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Ledger entries of an account in insertion order.
    fn ledger_entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>, StoreError>;

    fn audit_logs(
        &self,
        auditable_type: &str,
        auditable_id: u64,
    ) -> Result<Vec<AuditLog>, StoreError>;

    /// Balance and ledger sum read under the account's row lock.
    fn ledger_snapshot(&self, account: AccountId) -> Result<LedgerSnapshot, StoreError>;

    fn table_counts(&self) -> Result<TableCounts, StoreError>;
}

pub trait UnitOfWork {
    /// Locks an account row for update and returns its current state.
    ///
    /// Blocks while another unit holds the lock. Locking an account twice in
    /// the same unit returns the held row.
    fn lock_account(&mut self, id: AccountId) -> Result<Account, StoreError>;

    /// Committed transaction carrying `client_token`, if any.
    fn find_transaction_by_token(
        &mut self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    fn insert_transaction(&mut self, transaction: NewTransaction)
    -> Result<Transaction, StoreError>;

    fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    /// Stages the new state of a locked account.
    fn update_account(&mut self, account: &Account) -> Result<(), StoreError>;

    fn insert_audit_log(&mut self, log: NewAuditLog) -> Result<AuditLog, StoreError>;

    /// Ledger sum of an account including entries staged in this unit,
    /// `None` if it overflows.
    fn ledger_sum(&mut self, account: AccountId) -> Result<Option<i64>, StoreError>;

    /// Makes every staged write visible at once and releases the locks.
    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;
}
