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

//! Transfer engine.
//!
//! The [`TransferEngine`] moves a positive amount between two accounts of the
//! same currency inside a single unit of work:
//!
//! 1. Lock both account rows, lowest [`AccountId`] first.
//! 2. Recheck the client token (a concurrent request may have committed).
//! 3. Re-validate funds on the locked rows.
//! 4. Insert the transaction; a token conflict resolves to the winner.
//! 5. Book a debit on the source and a credit on the destination.
//! 6. Persist both balances.
//! 7. Write the audit log.
//! 8. Evaluate ledger consistency for both accounts.
//! 9. Commit.
//!
//! Any error before the commit drops the unit, which rolls everything back.
//!
//! # Thread Safety
//!
//! Transfers on disjoint account pairs run fully in parallel. Transfers that
//! share an account serialize on its row lock; the fixed lock order means two
//! opposite transfers `A -> B` and `B -> A` can never wait on each other.

use crate::account::Account;
use crate::audit::NewAuditLog;
use crate::base::AccountId;
use crate::error::{StoreResultExt, TransferError};
use crate::idempotency::IdempotencyCoordinator;
use crate::ledger::{Consistency, Direction, EntryMetadata, NewLedgerEntry, verify_ledger_consistency};
use crate::store::{Store, UnitOfWork};
use crate::transaction::{NewTransaction, Transaction};
use chrono::Utc;
use std::sync::Arc;

/// How the returned transaction came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// This call created it.
    Created,
    /// Another request with the same client token created it.
    Replayed,
}

/// Result of a successful [`TransferEngine::transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transaction: Transaction,
    pub disposition: Disposition,
    /// Source then destination. Empty for replays, which write nothing.
    pub consistency: Vec<Consistency>,
}

impl TransferReceipt {
    fn replayed(transaction: Transaction) -> Self {
        Self {
            transaction,
            disposition: Disposition::Replayed,
            consistency: Vec::new(),
        }
    }

    pub fn is_replay(&self) -> bool {
        self.disposition == Disposition::Replayed
    }
}

/// Orders two account ids for lock acquisition.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

pub struct TransferEngine<S> {
    store: Arc<S>,
    idempotency: IdempotencyCoordinator<S>,
}

impl<S: Store> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            idempotency: IdempotencyCoordinator::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn idempotency(&self) -> &IdempotencyCoordinator<S> {
        &self.idempotency
    }

    /// Moves `amount` from `source` to `destination`.
    ///
    /// `source` and `destination` are the caller's view of the accounts; they
    /// drive the cheap pre-lock checks only. The authoritative checks run on
    /// the locked rows.
    ///
    /// # Errors
    ///
    /// - [`TransferError::InvalidAmount`] - `amount` is not positive.
    /// - [`TransferError::SameAccount`] - source and destination are the same row.
    /// - [`TransferError::InsufficientFunds`] - source balance does not cover `amount`.
    /// - [`TransferError::CurrencyMismatch`] - accounts hold different currencies.
    /// - [`TransferError::AccountNotFound`] - an account disappeared before locking.
    /// - [`TransferError::Storage`] - infrastructure failure, nothing was written.
    pub fn transfer(
        &self,
        source: &Account,
        destination: &Account,
        amount: i64,
        client_token: &str,
    ) -> Result<TransferReceipt, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if source.id == destination.id {
            return Err(TransferError::SameAccount);
        }
        if !source.can_cover(amount) {
            return Err(TransferError::InsufficientFunds);
        }
        if source.currency != destination.currency {
            return Err(TransferError::CurrencyMismatch);
        }

        let mut unit = self.store.begin().context("starting unit of work")?;

        let (first, second) = lock_order(source.id, destination.id);
        let first = unit.lock_account(first).context("locking account")?;
        let second = unit.lock_account(second).context("locking account")?;
        let (mut source, mut destination) = if first.id == source.id {
            (first, second)
        } else {
            (second, first)
        };

        if let Some(existing) = self.idempotency.recheck(&mut unit, client_token)? {
            return Ok(TransferReceipt::replayed(existing));
        }

        if !source.can_cover(amount) {
            return Err(TransferError::InsufficientFunds);
        }
        if source.currency != destination.currency {
            return Err(TransferError::CurrencyMismatch);
        }

        let now = Utc::now();
        let transaction = match unit.insert_transaction(NewTransaction {
            from_account: source.id,
            to_account: destination.id,
            amount,
            client_token: client_token.to_string(),
            created_at: now,
        }) {
            Ok(transaction) => transaction,
            Err(error) => {
                // Release the row locks before waiting on anything else.
                drop(unit);
                let winner = self.idempotency.resolve_conflict(client_token, error)?;
                return Ok(TransferReceipt::replayed(winner));
            }
        };

        let source_before = source.clone();
        let destination_before = destination.clone();
        let source_balance = source.withdraw(amount, now)?;
        let destination_balance = destination.deposit(amount)?;

        let debit = unit
            .insert_ledger_entry(NewLedgerEntry::debit(
                transaction.id,
                source.id,
                amount,
                source_balance,
                EntryMetadata {
                    direction: Direction::Outgoing,
                    counterparty_account_id: Some(destination.id),
                    counterparty_currency: Some(destination.currency.clone()),
                    client_token: Some(client_token.to_string()),
                    transaction_id: Some(transaction.id),
                    amount,
                    timestamp: now,
                },
            ))
            .context("writing debit entry")?;
        let credit = unit
            .insert_ledger_entry(NewLedgerEntry::credit(
                transaction.id,
                destination.id,
                amount,
                destination_balance,
                EntryMetadata {
                    direction: Direction::Incoming,
                    counterparty_account_id: Some(source.id),
                    counterparty_currency: Some(source.currency.clone()),
                    client_token: Some(client_token.to_string()),
                    transaction_id: Some(transaction.id),
                    amount,
                    timestamp: now,
                },
            ))
            .context("writing credit entry")?;

        unit.update_account(&source)
            .context("updating source balance")?;
        unit.update_account(&destination)
            .context("updating destination balance")?;

        unit.insert_audit_log(NewAuditLog::transfer(
            &transaction,
            &source_before,
            &destination_before,
            source_balance,
            destination_balance,
            [debit.id, credit.id],
        ))
        .context("writing audit log")?;

        let consistency = vec![
            verify_ledger_consistency(
                source.id,
                source.balance,
                unit.ledger_sum(source.id).context("summing source ledger")?,
            ),
            verify_ledger_consistency(
                destination.id,
                destination.balance,
                unit.ledger_sum(destination.id)
                    .context("summing destination ledger")?,
            ),
        ];

        unit.commit().context("committing transfer")?;

        tracing::info!(
            transaction_id = %transaction.id,
            from_account_id = %source.id,
            to_account_id = %destination.id,
            amount,
            client_token,
            "Transfer completed"
        );

        Ok(TransferReceipt {
            transaction,
            disposition: Disposition::Created,
            consistency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::NewAccount;
    use crate::audit::AUDITABLE_TRANSACTION;
    use crate::base::{Currency, UserId};
    use crate::ledger::EntryType;
    use crate::store::MemoryStore;

    fn setup(source: i64, destination: i64) -> (TransferEngine<MemoryStore>, Account, Account) {
        let store = Arc::new(MemoryStore::new());
        let s = store
            .create_account(
                NewAccount::new(UserId(1), Currency::new("USD")).with_opening_balance(source),
            )
            .unwrap();
        let d = store
            .create_account(
                NewAccount::new(UserId(2), Currency::new("USD")).with_opening_balance(destination),
            )
            .unwrap();
        (TransferEngine::new(store), s, d)
    }

    #[test]
    fn lock_order_is_ascending() {
        assert_eq!(lock_order(AccountId(5), AccountId(2)), (AccountId(2), AccountId(5)));
        assert_eq!(lock_order(AccountId(2), AccountId(5)), (AccountId(2), AccountId(5)));
    }

    #[test]
    fn transfer_books_entries_and_audit() {
        let (engine, s, d) = setup(1_000, 500);
        let receipt = engine.transfer(&s, &d, 300, "tok-1").unwrap();
        let store = engine.store();

        assert_eq!(receipt.disposition, Disposition::Created);
        assert!(receipt.consistency.iter().all(Consistency::is_consistent));

        let accounts = store.find_accounts(&[s.id, d.id]).unwrap();
        assert_eq!(accounts[0].balance, 700);
        assert_eq!(accounts[1].balance, 800);

        let debit = store.ledger_entries(s.id).unwrap().pop().unwrap();
        assert_eq!(debit.delta, -300);
        assert_eq!(debit.balance_after, 700);
        assert_eq!(debit.entry_type, EntryType::Debit);
        assert_eq!(debit.transaction, Some(receipt.transaction.id));
        assert_eq!(debit.metadata.counterparty_account_id, Some(d.id));

        let credit = store.ledger_entries(d.id).unwrap().pop().unwrap();
        assert_eq!(credit.delta, 300);
        assert_eq!(credit.balance_after, 800);
        assert_eq!(credit.metadata.direction, Direction::Incoming);

        let logs = store
            .audit_logs(AUDITABLE_TRANSACTION, receipt.transaction.id.0)
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].data["debit_entry_id"], debit.id.0);
        assert_eq!(logs[0].data["credit_entry_id"], credit.id.0);
    }

    #[test]
    fn replay_returns_original() {
        let (engine, s, d) = setup(1_000, 0);
        let first = engine.transfer(&s, &d, 100, "same").unwrap();
        let second = engine.transfer(&s, &d, 100, "same").unwrap();

        assert!(second.is_replay());
        assert_eq!(first.transaction, second.transaction);
        assert_eq!(engine.store().table_counts().unwrap().transactions, 1);
    }

    #[test]
    fn stale_snapshot_is_rechecked_after_locking() {
        let (engine, s, d) = setup(500, 0);
        engine.transfer(&s, &d, 400, "drain").unwrap();

        // `s` still claims a balance of 500.
        let result = engine.transfer(&s, &d, 400, "stale");
        assert_eq!(result, Err(TransferError::InsufficientFunds));
        assert_eq!(engine.store().table_counts().unwrap().transactions, 1);
    }

    #[test]
    fn rejects_before_locking() {
        let (engine, s, d) = setup(100, 0);
        assert_eq!(engine.transfer(&s, &d, 0, "t"), Err(TransferError::InvalidAmount));
        assert_eq!(engine.transfer(&s, &s, 10, "t"), Err(TransferError::SameAccount));
        assert_eq!(
            engine.transfer(&s, &d, 101, "t"),
            Err(TransferError::InsufficientFunds)
        );

        let mut euro = d.clone();
        euro.currency = Currency::new("EUR");
        assert_eq!(
            engine.transfer(&s, &euro, 10, "t"),
            Err(TransferError::CurrencyMismatch)
        );
    }

    #[test]
    fn missing_account_is_reported() {
        let (engine, s, d) = setup(100, 0);
        let mut ghost = d.clone();
        ghost.id = AccountId(404);
        assert_eq!(
            engine.transfer(&s, &ghost, 10, "ghost"),
            Err(TransferError::AccountNotFound(AccountId(404)))
        );
    }
}
