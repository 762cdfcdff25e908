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

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use lucepay_tx::audit::NewAuditLog;
use lucepay_tx::ledger::NewLedgerEntry;
use lucepay_tx::store::memory::MemoryUnit;
use lucepay_tx::store::{LedgerSnapshot, TableCounts};
use lucepay_tx::transaction::NewTransaction;
use lucepay_tx::{
    Account, AccountId, AtomicMetrics, AuditLog, Currency, LedgerEntry, MemoryStore, NewAccount,
    Store, StoreError, Transaction, TransactionId, TransferService, UnitOfWork, UserId,
};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn usd() -> Currency {
    Currency::new("USD")
}

pub fn open_account<S: Store>(store: &S, user: u64, currency: &str, balance: i64) -> Account {
    store
        .create_account(
            NewAccount::new(UserId(user), Currency::new(currency)).with_opening_balance(balance),
        )
        .unwrap()
}

/// A fresh store with two USD accounts.
pub fn two_accounts(source: i64, destination: i64) -> (Arc<MemoryStore>, Account, Account) {
    let store = Arc::new(MemoryStore::new());
    let a = open_account(store.as_ref(), 1, "USD", source);
    let b = open_account(store.as_ref(), 2, "USD", destination);
    (store, a, b)
}

pub fn service_with_metrics<S: Store>(
    store: Arc<S>,
) -> (TransferService<S>, Arc<AtomicMetrics>) {
    let metrics = Arc::new(AtomicMetrics::new());
    let service = TransferService::new(store, metrics.clone());
    (service, metrics)
}

pub fn balance<S: Store>(store: &S, id: AccountId) -> i64 {
    store.find_accounts(&[id]).unwrap()[0].balance
}

pub fn total_balance<S: Store>(store: &S) -> i64 {
    let ids = store.account_ids().unwrap();
    store.find_accounts(&ids).unwrap().iter().map(|a| a.balance).sum()
}

/// Overwrites a balance without booking a ledger entry.
pub fn corrupt_balance<S: Store>(store: &S, id: AccountId, balance: i64) {
    let mut unit = store.begin().unwrap();
    let mut account = unit.lock_account(id).unwrap();
    account.balance = balance;
    unit.update_account(&account).unwrap();
    unit.commit().unwrap();
}

/// Books an extra credit without touching the balance.
pub fn book_stray_credit<S: Store>(store: &S, id: AccountId, amount: i64) {
    let mut unit = store.begin().unwrap();
    unit.lock_account(id).unwrap();
    unit.insert_ledger_entry(NewLedgerEntry::opening(id, amount, Utc::now()))
        .unwrap();
    unit.commit().unwrap();
}

pub fn assert_ledger_consistent<S: Store>(store: &S) {
    for id in store.account_ids().unwrap() {
        let snapshot = store.ledger_snapshot(id).unwrap();
        assert_eq!(
            Some(snapshot.balance), snapshot.ledger_sum,
            "account {id} balance disagrees with its ledger"
        );
    }
}

/// Where a [`FailingStore`] unit of work breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Transaction,
    LedgerEntry,
    AuditLog,
    Commit,
}

/// Wraps a [`MemoryStore`] and injects an outage at one write while armed.
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_on: FailPoint,
    armed: AtomicBool,
}

impl FailingStore {
    pub fn new(fail_on: FailPoint) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_on,
            armed: AtomicBool::new(true),
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    fn failing(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.fail_on == point && self.armed.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("injected failure at {point:?}")))
        } else {
            Ok(())
        }
    }
}

pub struct FailingUnit<'a> {
    inner: MemoryUnit<'a>,
    store: &'a FailingStore,
}

impl Store for FailingStore {
    type Unit<'a> = FailingUnit<'a>;

    fn begin(&self) -> Result<FailingUnit<'_>, StoreError> {
        Ok(FailingUnit {
            inner: self.inner.begin()?,
            store: self,
        })
    }

    fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.inner.create_account(account)
    }

    fn find_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        self.inner.find_accounts(ids)
    }

    fn account_ids(&self) -> Result<Vec<AccountId>, StoreError> {
        self.inner.account_ids()
    }

    fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        self.inner.find_transaction(id)
    }

    fn find_transaction_by_token(
        &self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        self.inner.find_transaction_by_token(client_token)
    }

    fn ledger_entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.ledger_entries(account)
    }

    fn audit_logs(
        &self,
        auditable_type: &str,
        auditable_id: u64,
    ) -> Result<Vec<AuditLog>, StoreError> {
        self.inner.audit_logs(auditable_type, auditable_id)
    }

    fn ledger_snapshot(&self, account: AccountId) -> Result<LedgerSnapshot, StoreError> {
        self.inner.ledger_snapshot(account)
    }

    fn table_counts(&self) -> Result<TableCounts, StoreError> {
        self.inner.table_counts()
    }
}

impl UnitOfWork for FailingUnit<'_> {
    fn lock_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.lock_account(id)
    }

    fn find_transaction_by_token(
        &mut self,
        client_token: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        self.inner.find_transaction_by_token(client_token)
    }

    fn insert_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        self.store.failing(FailPoint::Transaction)?;
        self.inner.insert_transaction(transaction)
    }

    fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.store.failing(FailPoint::LedgerEntry)?;
        self.inner.insert_ledger_entry(entry)
    }

    fn update_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.inner.update_account(account)
    }

    fn insert_audit_log(&mut self, log: NewAuditLog) -> Result<AuditLog, StoreError> {
        self.store.failing(FailPoint::AuditLog)?;
        self.inner.insert_audit_log(log)
    }

    fn ledger_sum(&mut self, account: AccountId) -> Result<Option<i64>, StoreError> {
        self.inner.ledger_sum(account)
    }

    fn commit(self) -> Result<(), StoreError> {
        self.store.failing(FailPoint::Commit)?;
        self.inner.commit()
    }
}
