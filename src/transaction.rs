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

//! Transfer records.
//!
//! A [`Transaction`] only ever exists in its terminal [`TransactionStatus::Completed`]
//! state: it is written inside the same unit of work as its ledger entries and
//! audit log, so a failed transfer leaves no record at all.

use crate::base::{AccountId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: i64,
    pub status: TransactionStatus,
    /// Idempotency key, unique across all transactions.
    pub client_token: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: i64,
    pub client_token: String,
    pub created_at: DateTime<Utc>,
}

impl NewTransaction {
    pub fn into_transaction(self, id: TransactionId) -> Transaction {
        Transaction {
            id,
            from_account: self.from_account,
            to_account: self.to_account,
            amount: self.amount,
            status: TransactionStatus::Completed,
            client_token: self.client_token,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transactions_are_completed() {
        let tx = NewTransaction {
            from_account: AccountId(1),
            to_account: AccountId(2),
            amount: 300,
            client_token: "tok-1".into(),
            created_at: Utc::now(),
        }
        .into_transaction(TransactionId(5));

        assert_eq!(tx.id, TransactionId(5));
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.status.as_str(), "completed");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransactionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
