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

//! Double-entry ledger records and the ledger-consistency predicate.
//!
//! Every transfer books exactly two [`LedgerEntry`] rows: a debit on the
//! source account and a credit on the destination. The sum of an account's
//! deltas must always equal its stored balance; [`verify_ledger_consistency`]
//! checks that property without side effects. A ledger whose deltas overflow
//! `i64` has no sum and is always inconsistent.
//!
//! # Example
//!
//! ```
//! use lucepay_tx::{AccountId, Consistency, verify_ledger_consistency};
//!
//! assert!(verify_ledger_consistency(AccountId(1), 700, Some(700)).is_consistent());
//!
//! let Consistency::Inconsistent(mismatch) = verify_ledger_consistency(AccountId(1), 700, Some(650)) else {
//!     panic!("expected a mismatch");
//! };
//! assert_eq!(mismatch.difference, Some(50));
//!
//! let overflowed = verify_ledger_consistency(AccountId(1), 700, None);
//! assert!(overflowed.mismatch().is_some_and(|m| m.overflowed()));
//! ```

use crate::base::{AccountId, Currency, LedgerEntryId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Credit,
    Debit,
}

/// Which side of a movement an entry records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Funds leaving the account.
    Outgoing,
    /// Funds arriving on the account.
    Incoming,
    /// Opening balance booked at onboarding.
    Opening,
}

/// Structured context stored with every entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMetadata {
    pub direction: Direction,
    pub counterparty_account_id: Option<AccountId>,
    pub counterparty_currency: Option<Currency>,
    pub client_token: Option<String>,
    pub transaction_id: Option<TransactionId>,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    /// `None` only for opening-balance entries.
    pub transaction: Option<TransactionId>,
    pub account: AccountId,
    /// Negative for debits, positive for credits.
    pub delta: i64,
    /// Account balance immediately after this entry.
    pub balance_after: i64,
    pub entry_type: EntryType,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
}

/// Insert payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub transaction: Option<TransactionId>,
    pub account: AccountId,
    pub delta: i64,
    pub balance_after: i64,
    pub entry_type: EntryType,
    pub metadata: EntryMetadata,
}

impl NewLedgerEntry {
    /// Debit booked on the source side of a transfer.
    pub fn debit(
        transaction: TransactionId,
        account: AccountId,
        amount: i64,
        balance_after: i64,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            transaction: Some(transaction),
            account,
            delta: -amount,
            balance_after,
            entry_type: EntryType::Debit,
            metadata,
        }
    }

    /// Credit booked on the destination side of a transfer.
    pub fn credit(
        transaction: TransactionId,
        account: AccountId,
        amount: i64,
        balance_after: i64,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            transaction: Some(transaction),
            account,
            delta: amount,
            balance_after,
            entry_type: EntryType::Credit,
            metadata,
        }
    }

    pub fn opening(account: AccountId, amount: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            transaction: None,
            account,
            delta: amount,
            balance_after: amount,
            entry_type: EntryType::Credit,
            metadata: EntryMetadata {
                direction: Direction::Opening,
                counterparty_account_id: None,
                counterparty_currency: None,
                client_token: None,
                transaction_id: None,
                amount,
                timestamp,
            },
        }
    }

    pub fn into_entry(self, id: LedgerEntryId) -> LedgerEntry {
        LedgerEntry {
            id,
            transaction: self.transaction,
            account: self.account,
            delta: self.delta,
            balance_after: self.balance_after,
            entry_type: self.entry_type,
            created_at: self.metadata.timestamp,
            metadata: self.metadata,
        }
    }
}

/// Sum of deltas, `None` if it overflows `i64`.
pub fn sum_deltas<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Option<i64> {
    entries
        .into_iter()
        .try_fold(0i64, |sum, entry| sum.checked_add(entry.delta))
}

/// A balance that disagrees with its ledger.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Mismatch {
    pub account: AccountId,
    /// `None` when the deltas overflow.
    pub ledger_sum: Option<i64>,
    pub balance: i64,
    /// `balance - ledger_sum`, `None` when it cannot be represented.
    pub difference: Option<i64>,
}

impl Mismatch {
    pub fn overflowed(&self) -> bool {
        self.ledger_sum.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Consistent,
    Inconsistent(Mismatch),
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }

    pub fn mismatch(&self) -> Option<&Mismatch> {
        match self {
            Self::Consistent => None,
            Self::Inconsistent(mismatch) => Some(mismatch),
        }
    }
}

/// Compares a stored balance with the sum of the account's ledger deltas.
pub fn verify_ledger_consistency(
    account: AccountId,
    balance: i64,
    ledger_sum: Option<i64>,
) -> Consistency {
    if ledger_sum == Some(balance) {
        Consistency::Consistent
    } else {
        Consistency::Inconsistent(Mismatch {
            account,
            ledger_sum,
            balance,
            difference: ledger_sum.and_then(|sum| balance.checked_sub(sum)),
        })
    }
}

/// Emits the warning event for a detected mismatch.
pub(crate) fn report_mismatch(mismatch: &Mismatch, origin: &'static str) {
    tracing::warn!(
        account_id = %mismatch.account,
        ledger_sum = mismatch.ledger_sum,
        balance = mismatch.balance,
        difference = mismatch.difference,
        overflowed = mismatch.overflowed(),
        origin,
        "Ledger inconsistency detected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(direction: Direction, amount: i64) -> EntryMetadata {
        EntryMetadata {
            direction,
            counterparty_account_id: Some(AccountId(2)),
            counterparty_currency: Some(Currency::new("USD")),
            client_token: Some("tok-1".into()),
            transaction_id: Some(TransactionId(1)),
            amount,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn debit_has_negative_delta() {
        let entry = NewLedgerEntry::debit(
            TransactionId(1),
            AccountId(1),
            300,
            700,
            metadata(Direction::Outgoing, 300),
        );
        assert_eq!(entry.delta, -300);
        assert_eq!(entry.entry_type, EntryType::Debit);
        assert_eq!(entry.balance_after, 700);
    }

    #[test]
    fn credit_has_positive_delta() {
        let entry = NewLedgerEntry::credit(
            TransactionId(1),
            AccountId(2),
            300,
            800,
            metadata(Direction::Incoming, 300),
        );
        assert_eq!(entry.delta, 300);
        assert_eq!(entry.entry_type, EntryType::Credit);
    }

    #[test]
    fn opening_entry_has_no_transaction() {
        let entry = NewLedgerEntry::opening(AccountId(3), 1_000, Utc::now())
            .into_entry(LedgerEntryId(1));
        assert_eq!(entry.transaction, None);
        assert_eq!(entry.balance_after, 1_000);
        assert_eq!(entry.metadata.direction, Direction::Opening);
    }

    #[test]
    fn sums_deltas() {
        let now = Utc::now();
        let entries = vec![
            NewLedgerEntry::opening(AccountId(1), 1_000, now).into_entry(LedgerEntryId(1)),
            NewLedgerEntry::debit(
                TransactionId(1),
                AccountId(1),
                300,
                700,
                metadata(Direction::Outgoing, 300),
            )
            .into_entry(LedgerEntryId(2)),
        ];
        assert_eq!(sum_deltas(&entries), Some(700));
        assert_eq!(sum_deltas(Vec::<LedgerEntry>::new().iter()), Some(0));
    }

    #[test]
    fn overflowing_sum_is_none() {
        let now = Utc::now();
        let entries = vec![
            NewLedgerEntry::opening(AccountId(1), i64::MAX, now).into_entry(LedgerEntryId(1)),
            NewLedgerEntry::opening(AccountId(1), 1, now).into_entry(LedgerEntryId(2)),
        ];
        assert_eq!(sum_deltas(&entries), None);
    }

    #[test]
    fn overflowed_ledger_is_its_own_mismatch() {
        let result = verify_ledger_consistency(AccountId(3), i64::MAX, None);
        let mismatch = result.mismatch().copied().unwrap();
        assert!(mismatch.overflowed());
        assert_eq!(mismatch.ledger_sum, None);
        assert_eq!(mismatch.difference, None);
        assert_eq!(mismatch.balance, i64::MAX);
    }

    #[test]
    fn equal_sum_is_consistent() {
        assert_eq!(
            verify_ledger_consistency(AccountId(1), 0, Some(0)),
            Consistency::Consistent
        );
    }

    #[test]
    fn mismatch_carries_difference() {
        let result = verify_ledger_consistency(AccountId(4), 500, Some(800));
        let mismatch = result.mismatch().copied().unwrap();
        assert!(!result.is_consistent());
        assert!(!mismatch.overflowed());
        assert_eq!(mismatch.account, AccountId(4));
        assert_eq!(mismatch.difference, Some(-300));
    }

    #[test]
    fn metadata_serializes_direction_lowercase() {
        let json = serde_json::to_value(metadata(Direction::Outgoing, 10)).unwrap();
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["counterparty_currency"], "USD");
        assert_eq!(json["transaction_id"], 1);
    }
}
