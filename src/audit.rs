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

//! Append-only compliance records.

use crate::account::Account;
use crate::base::{AuditLogId, LedgerEntryId};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const AUDITABLE_TRANSACTION: &str = "Transaction";
pub const ACTION_TRANSFER: &str = "transfer";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub auditable_type: String,
    pub auditable_id: u64,
    pub action: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Insert payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditLog {
    pub auditable_type: String,
    pub auditable_id: u64,
    pub action: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl NewAuditLog {
    /// Snapshot of a completed transfer.
    ///
    /// `source` and `destination` are the locked rows as they were before the
    /// transfer; the after-balances come from the booked ledger entries.
    pub fn transfer(
        transaction: &Transaction,
        source: &Account,
        destination: &Account,
        source_balance_after: i64,
        destination_balance_after: i64,
        entries: [LedgerEntryId; 2],
    ) -> Self {
        let [debit_entry_id, credit_entry_id] = entries;
        Self {
            auditable_type: AUDITABLE_TRANSACTION.to_string(),
            auditable_id: transaction.id.0,
            action: ACTION_TRANSFER.to_string(),
            data: json!({
                "from_account_id": source.id,
                "to_account_id": destination.id,
                "amount": transaction.amount,
                "currency": source.currency,
                "client_token": transaction.client_token,
                "transaction_id": transaction.id,
                "status": transaction.status,
                "from_balance_before": source.balance,
                "from_balance_after": source_balance_after,
                "to_balance_before": destination.balance,
                "to_balance_after": destination_balance_after,
                "debit_entry_id": debit_entry_id,
                "credit_entry_id": credit_entry_id,
            }),
            created_at: transaction.created_at,
        }
    }

    pub fn into_log(self, id: AuditLogId) -> AuditLog {
        AuditLog {
            id,
            auditable_type: self.auditable_type,
            auditable_id: self.auditable_id,
            action: self.action,
            data: self.data,
            created_at: self.created_at,
        }
    }
}
