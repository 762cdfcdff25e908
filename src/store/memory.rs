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

//! In-memory store.
//!
//! Tables live in [`DashMap`]s. Each account row sits behind its own
//! [`parking_lot::Mutex`]; a [`MemoryUnit`] holds the owned guards of the rows
//! it locked until it commits or is dropped, which gives the same blocking
//! `SELECT ... FOR UPDATE` behaviour a relational store would.
//!
//! Client tokens are tracked in a [`TokenIndex`]: a claim is `Pending` while
//! its unit is open and `Committed` afterwards. Inserting over a committed
//! claim is a unique violation; inserting over a pending one waits on a
//! condition variable until the first claimant commits or rolls back.
//!
//! Commits publish under the write side of a store-wide commit gate and the
//! committed-read methods take its read side, so a reader sees all rows of a
//! commit or none of them.

use crate::account::{Account, NewAccount};
use crate::audit::{AuditLog, NewAuditLog};
use crate::base::{AccountId, AuditLogId, LedgerEntryId, TransactionId};
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::ledger::{LedgerEntry, NewLedgerEntry, sum_deltas};
use crate::store::{
    CLIENT_TOKEN_CONSTRAINT, LedgerSnapshot, Store, TableCounts, UnitOfWork,
};
use crate::transaction::{NewTransaction, Transaction};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Primary key of `accounts`.
pub const ACCOUNT_KEY_CONSTRAINT: &str = "accounts_pkey";

/// Check constraint on `accounts.balance`.
pub const BALANCE_CONSTRAINT: &str = "accounts_balance_non_negative";

type AccountRow = Arc<Mutex<Account>>;
type RowGuard = ArcMutexGuard<RawMutex, Account>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Pending,
    Committed(TransactionId),
}

/// Unique index on `transactions.client_token`.
#[derive(Debug, Default)]
struct TokenIndex {
    claims: Mutex<HashMap<String, Claim>>,
    resolved: Condvar,
}

impl TokenIndex {
    fn committed(&self, client_token: &str) -> Option<TransactionId> {
        match self.claims.lock().get(client_token) {
            Some(Claim::Committed(id)) => Some(*id),
            _ => None,
        }
    }

    fn claim(&self, client_token: &str, timeout: Option<Duration>) -> Result<(), StoreError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut claims = self.claims.lock();
        loop {
            let state = claims.get(client_token).copied();
            match state {
                None => {
                    claims.insert(client_token.to_string(), Claim::Pending);
                    return Ok(());
                }
                Some(Claim::Committed(_)) => {
                    return Err(StoreError::UniqueViolation {
                        constraint: CLIENT_TOKEN_CONSTRAINT,
                        key: client_token.to_string(),
                    });
                }
                Some(Claim::Pending) => match deadline {
                    None => self.resolved.wait(&mut claims),
                    Some(deadline) => {
                        if self.resolved.wait_until(&mut claims, deadline).timed_out() {
                            return Err(StoreError::ClaimTimeout(client_token.to_string()));
                        }
                    }
                },
            }
        }
    }

    fn commit(&self, client_token: &str, id: TransactionId) {
        self.claims
            .lock()
            .insert(client_token.to_string(), Claim::Committed(id));
        self.resolved.notify_all();
    }

    fn release(&self, client_token: &str) {
        {
            let mut claims = self.claims.lock();
            if claims.get(client_token) == Some(&Claim::Pending) {
                claims.remove(client_token);
            }
        }
        self.resolved.notify_all();
    }
}

/// Id sequences. Values consumed by a rolled back unit are not reused.
#[derive(Debug, Default)]
struct Sequences {
    accounts: AtomicU64,
    transactions: AtomicU64,
    ledger_entries: AtomicU64,
    audit_logs: AtomicU64,
}

impl Sequences {
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Thread-safe in-memory implementation of [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, AccountRow>,
    transactions: DashMap<TransactionId, Transaction>,
    tokens: TokenIndex,
    ledger: DashMap<AccountId, Vec<LedgerEntry>>,
    audit_logs: RwLock<Vec<AuditLog>>,
    /// Held for write while a commit publishes, for read by committed reads.
    commit_gate: RwLock<()>,
    sequences: Sequences,
    /// Lock-wait limit for account rows and token claims. `None` waits forever.
    lock_timeout: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            lock_timeout: Some(lock_timeout),
            ..Self::default()
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }

    /// Onboards an account under a caller-chosen id, e.g. when loading a
    /// snapshot. Later generated ids continue after the highest imported one.
    pub fn import_account(&self, id: AccountId, new: NewAccount) -> Result<Account, StoreError> {
        self.sequences.accounts.fetch_max(id.0, Ordering::Relaxed);
        self.insert_account(id, new)
    }

    fn insert_account(&self, id: AccountId, new: NewAccount) -> Result<Account, StoreError> {
        if new.opening_balance < 0 {
            return Err(StoreError::CheckViolation {
                constraint: BALANCE_CONSTRAINT,
                detail: format!("opening balance {}", new.opening_balance),
            });
        }

        let now = Utc::now();
        let account = Account {
            id,
            user_id: new.user_id,
            balance: new.opening_balance,
            currency: new.currency,
            locked_at: None,
            created_at: now,
        };

        let _gate = self.commit_gate.write();
        match self.accounts.entry(id) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation {
                    constraint: ACCOUNT_KEY_CONSTRAINT,
                    key: id.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                if account.balance > 0 {
                    let entry = NewLedgerEntry::opening(id, account.balance, now).into_entry(
                        LedgerEntryId(Sequences::next(&self.sequences.ledger_entries)),
                    );
                    self.ledger.entry(id).or_default().push(entry);
                }
                slot.insert(Arc::new(Mutex::new(account.clone())));
            }
        }

        tracing::debug!(
            account_id = %account.id,
            user_id = %account.user_id,
            currency = %account.currency,
            opening_balance = account.balance,
            "Account created"
        );
        Ok(account)
    }

    fn row(&self, id: AccountId) -> Result<AccountRow, StoreError> {
        self.accounts
            .get(&id)
            .map(|row| Arc::clone(row.value()))
            .ok_or(StoreError::AccountNotFound(id))
    }

    fn lock_row(&self, id: AccountId) -> Result<RowGuard, StoreError> {
        let row = self.row(id)?;
        match self.lock_timeout {
            None => Ok(row.lock_arc()),
            Some(timeout) => row
                .try_lock_arc_for(timeout)
                .ok_or(StoreError::LockTimeout(id)),
        }
    }

    fn committed_transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.get(&id).map(|tx| tx.value().clone())
    }

    fn committed_sum(&self, account: AccountId) -> (Option<i64>, usize) {
        self.ledger
            .get(&account)
            .map(|entries| (sum_deltas(entries.iter()), entries.len()))
            .unwrap_or((Some(0), 0))
    }
}

impl Store for MemoryStore {
    type Unit<'a> = MemoryUnit<'a>;

    fn begin(&self) -> Result<MemoryUnit<'_>, StoreError> {
        Ok(MemoryUnit::new(self))
    }

    fn create_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        let id = AccountId(Sequences::next(&self.sequences.accounts));
        self.insert_account(id, new)
    }

    fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let mut accounts = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lock_row(*id) {
                Ok(row) => accounts.push(Account::clone(&row)),
                Err(StoreError::AccountNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(accounts)
    }

    fn account_ids(&self) -> Result<Vec<AccountId>, StoreError> {
        let mut ids: Vec<AccountId> = self.accounts.iter().map(|row| *row.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(self.committed_transaction(id))
    }

    fn find_transaction_by_token(
        &self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(self
            .tokens
            .committed(client_token)
            .and_then(|id| self.committed_transaction(id)))
    }

    fn ledger_entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(self
            .ledger
            .get(&account)
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }

    fn audit_logs(
        &self,
        auditable_type: &str,
        auditable_id: u64,
    ) -> Result<Vec<AuditLog>, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(self
            .audit_logs
            .read()
            .iter()
            .filter(|log| log.auditable_type == auditable_type && log.auditable_id == auditable_id)
            .cloned()
            .collect())
    }

    fn ledger_snapshot(&self, account: AccountId) -> Result<LedgerSnapshot, StoreError> {
        // Entries for an account are only appended while its row is locked.
        let row = self.lock_row(account)?;
        let (ledger_sum, entries) = self.committed_sum(account);
        Ok(LedgerSnapshot {
            account,
            balance: row.balance,
            ledger_sum,
            entries,
        })
    }

    fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let _gate = self.commit_gate.read();
        Ok(TableCounts {
            accounts: self.accounts.len(),
            transactions: self.transactions.len(),
            ledger_entries: self.ledger.iter().map(|entries| entries.len()).sum(),
            audit_logs: self.audit_logs.read().len(),
        })
    }
}

/// One open unit of work on a [`MemoryStore`].
///
/// Writes are staged locally and applied in [`UnitOfWork::commit`] while the
/// row locks are still held. Dropping the unit discards them.
pub struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    locks: Vec<RowGuard>,
    claimed_tokens: Vec<String>,
    transactions: Vec<Transaction>,
    entries: Vec<LedgerEntry>,
    audit_logs: Vec<AuditLog>,
    updates: HashMap<AccountId, Account>,
    committed: bool,
}

impl<'a> MemoryUnit<'a> {
    fn new(store: &'a MemoryStore) -> Self {
        Self {
            store,
            locks: Vec::with_capacity(2),
            claimed_tokens: Vec::new(),
            transactions: Vec::new(),
            entries: Vec::new(),
            audit_logs: Vec::new(),
            updates: HashMap::new(),
            committed: false,
        }
    }

    fn held(&self, id: AccountId) -> Option<&RowGuard> {
        self.locks.iter().find(|guard| guard.id == id)
    }

    fn ensure_locked(&self, id: AccountId) -> Result<(), StoreError> {
        match self.held(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotLocked(id)),
        }
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn lock_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        if let Some(guard) = self.held(id) {
            let current = self
                .updates
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Account::clone(guard));
            return Ok(current);
        }

        let guard = self.store.lock_row(id)?;
        tracing::debug!(account_id = %id, "Account row locked");
        let account = Account::clone(&guard);
        self.locks.push(guard);
        Ok(account)
    }

    fn find_transaction_by_token(
        &mut self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        if let Some(staged) = self
            .transactions
            .iter()
            .find(|tx| tx.client_token == client_token)
        {
            return Ok(Some(staged.clone()));
        }
        self.store.find_transaction_by_token(client_token)
    }

    fn insert_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        if self
            .transactions
            .iter()
            .any(|tx| tx.client_token == transaction.client_token)
        {
            return Err(StoreError::UniqueViolation {
                constraint: CLIENT_TOKEN_CONSTRAINT,
                key: transaction.client_token,
            });
        }

        self.store
            .tokens
            .claim(&transaction.client_token, self.store.lock_timeout)?;
        self.claimed_tokens.push(transaction.client_token.clone());

        let id = TransactionId(Sequences::next(&self.store.sequences.transactions));
        let transaction = transaction.into_transaction(id);
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.ensure_locked(entry.account)?;
        let id = LedgerEntryId(Sequences::next(&self.store.sequences.ledger_entries));
        let entry = entry.into_entry(id);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn update_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.ensure_locked(account.id)?;
        if account.balance < 0 {
            return Err(StoreError::CheckViolation {
                constraint: BALANCE_CONSTRAINT,
                detail: format!("account {} balance {}", account.id, account.balance),
            });
        }
        self.updates.insert(account.id, account.clone());
        Ok(())
    }

    fn insert_audit_log(&mut self, log: NewAuditLog) -> Result<AuditLog, StoreError> {
        let id = AuditLogId(Sequences::next(&self.store.sequences.audit_logs));
        let log = log.into_log(id);
        self.audit_logs.push(log.clone());
        Ok(log)
    }

    fn ledger_sum(&mut self, account: AccountId) -> Result<Option<i64>, StoreError> {
        let (committed, _) = self.store.committed_sum(account);
        let staged = sum_deltas(self.entries.iter().filter(|entry| entry.account == account));
        Ok(committed
            .zip(staged)
            .and_then(|(committed, staged)| committed.checked_add(staged)))
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let store = self.store;
        let claims: Vec<(String, TransactionId)> = self
            .transactions
            .iter()
            .map(|tx| (tx.client_token.clone(), tx.id))
            .collect();

        // Row guards are still held, so nothing below waits on another unit.
        let _gate = store.commit_gate.write();
        for tx in self.transactions.drain(..) {
            store.transactions.insert(tx.id, tx);
        }
        for entry in self.entries.drain(..) {
            store.ledger.entry(entry.account).or_default().push(entry);
        }
        if !self.audit_logs.is_empty() {
            store.audit_logs.write().append(&mut self.audit_logs);
        }
        for guard in self.locks.iter_mut() {
            if let Some(updated) = self.updates.remove(&guard.id) {
                **guard = updated;
            }
        }
        for (client_token, id) in claims {
            store.tokens.commit(&client_token, id);
        }

        self.claimed_tokens.clear();
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryUnit<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for client_token in self.claimed_tokens.drain(..) {
            self.store.tokens.release(&client_token);
        }
        if !self.locks.is_empty() {
            tracing::trace!(locked_rows = self.locks.len(), "Unit of work rolled back");
        }
    }
}
