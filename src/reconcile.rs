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

//! Periodic ledger sweep.
//!
//! Walks every account and compares its stored balance with the sum of its
//! ledger entries. Mismatches are logged and returned, never repaired.

use crate::error::StoreError;
use crate::ledger::{Mismatch, report_mismatch, verify_ledger_consistency};
use crate::scheduler::{Job, JobError, RetryPolicy};
use crate::store::Store;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub accounts_checked: usize,
    pub inconsistencies: Vec<Mismatch>,
}

impl ReconciliationReport {
    pub fn inconsistent_count(&self) -> usize {
        self.inconsistencies.len()
    }

    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

pub struct Reconciler<S> {
    store: Arc<S>,
    last_report: Mutex<Option<ReconciliationReport>>,
}

impl<S: Store + 'static> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            last_report: Mutex::new(None),
        }
    }

    /// Checks every account once.
    ///
    /// Each account is read under its row lock, so a transfer is either fully
    /// visible or not at all. Accounts removed mid-sweep are skipped.
    pub fn sweep(&self) -> Result<ReconciliationReport, StoreError> {
        let mut report = ReconciliationReport::default();

        for id in self.store.account_ids()? {
            let snapshot = match self.store.ledger_snapshot(id) {
                Ok(snapshot) => snapshot,
                Err(StoreError::AccountNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            report.accounts_checked += 1;

            if let Some(mismatch) =
                verify_ledger_consistency(id, snapshot.balance, snapshot.ledger_sum).mismatch()
            {
                report_mismatch(mismatch, "reconciliation");
                report.inconsistencies.push(*mismatch);
            }
        }

        if report.is_clean() {
            tracing::info!(
                accounts_checked = report.accounts_checked,
                "Reconciliation sweep clean"
            );
        } else {
            tracing::warn!(
                accounts_checked = report.accounts_checked,
                inconsistent = report.inconsistent_count(),
                "Reconciliation sweep found inconsistencies"
            );
        }

        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    /// Report of the most recent successful sweep.
    pub fn last_report(&self) -> Option<ReconciliationReport> {
        self.last_report.lock().clone()
    }

    /// Wraps [`Self::sweep`] as a schedulable job.
    pub fn job(self: &Arc<Self>, retry: RetryPolicy) -> Job {
        let reconciler = Arc::clone(self);
        Job::new("reconciliation", retry, move || {
            reconciler
                .sweep()
                .map(|_| ())
                .map_err(|e| JobError(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::NewAccount;
    use crate::base::{AccountId, Currency, UserId};
    use crate::engine::TransferEngine;
    use crate::scheduler::{InlineScheduler, Scheduler};
    use crate::store::{MemoryStore, UnitOfWork};
    use std::time::Duration;

    fn store_with_transfer() -> (Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let a = store
            .create_account(NewAccount::new(UserId(1), Currency::new("USD")).with_opening_balance(500))
            .unwrap();
        let b = store
            .create_account(NewAccount::new(UserId(2), Currency::new("USD")))
            .unwrap();
        TransferEngine::new(Arc::clone(&store))
            .transfer(&a, &b, 200, "tok-1")
            .unwrap();
        (store, b.id)
    }

    #[test]
    fn clean_ledger_reports_nothing() {
        let (store, _) = store_with_transfer();
        let report = Reconciler::new(store).sweep().unwrap();
        assert_eq!(report.accounts_checked, 2);
        assert!(report.is_clean());
    }

    #[test]
    fn reports_corrupted_balance() {
        let (store, b) = store_with_transfer();
        let mut unit = store.begin().unwrap();
        let mut account = unit.lock_account(b).unwrap();
        account.balance = 250;
        unit.update_account(&account).unwrap();
        unit.commit().unwrap();

        let report = Reconciler::new(store).sweep().unwrap();
        assert_eq!(report.inconsistent_count(), 1);
        assert_eq!(
            report.inconsistencies[0],
            Mismatch {
                account: b,
                ledger_sum: Some(200),
                balance: 250,
                difference: Some(50),
            }
        );
    }

    #[test]
    fn job_records_last_report() {
        let (store, _) = store_with_transfer();
        let reconciler = Arc::new(Reconciler::new(store));
        assert_eq!(reconciler.last_report(), None);

        let job = reconciler.job(RetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
        });
        InlineScheduler.schedule(Arc::new(job)).unwrap();

        let report = reconciler.last_report().unwrap();
        assert_eq!(report.accounts_checked, 2);
    }
}
