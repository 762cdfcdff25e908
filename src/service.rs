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

//! Transfer request orchestration.
//!
//! [`TransferService`] is the only entry point callers need. It validates the
//! request shape, short-circuits known client tokens, loads both accounts,
//! runs the [`TransferEngine`] and folds every outcome into a
//! [`TransferResult`]. No engine or storage error type crosses this boundary.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lucepay_tx::{
//!     AtomicMetrics, Currency, MemoryStore, NewAccount, Store, TransferService, UserId,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let usd = Currency::new("USD");
//! let s = store
//!     .create_account(NewAccount::new(UserId(1), usd.clone()).with_opening_balance(1_000))
//!     .unwrap();
//! let d = store.create_account(NewAccount::new(UserId(2), usd)).unwrap();
//!
//! let service = TransferService::new(store, Arc::new(AtomicMetrics::new()));
//! let result = service.transfer(s.id, d.id, 300, "tok-1");
//! assert!(result.is_success());
//!
//! let again = service.transfer(s.id, d.id, 300, "tok-1");
//! assert_eq!(again.transaction_id(), result.transaction_id());
//! ```

use crate::base::{AccountId, TransactionId};
use crate::engine::{Disposition, TransferEngine, TransferReceipt};
use crate::error::{TransferError, ValidationError};
use crate::ledger::report_mismatch;
use crate::metrics::{Metrics, TRANSFERS_CREATED, TRANSFERS_FAILED, TRANSFERS_IDEMPOTENT_HIT};
use crate::store::Store;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw transfer request. Every field is optional so that missing input can be
/// reported with a specific message instead of a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransferRequest {
    pub from_account_id: Option<AccountId>,
    pub to_account_id: Option<AccountId>,
    pub amount: Option<i64>,
    pub client_token: Option<String>,
}

/// A request that passed shape validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValidTransfer<'a> {
    from: AccountId,
    to: AccountId,
    amount: i64,
    client_token: &'a str,
}

impl TransferRequest {
    pub fn new(
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
        client_token: impl Into<String>,
    ) -> Self {
        Self {
            from_account_id: Some(from_account_id),
            to_account_id: Some(to_account_id),
            amount: Some(amount),
            client_token: Some(client_token.into()),
        }
    }

    fn validate(&self) -> Result<ValidTransfer<'_>, ValidationError> {
        let from = self
            .from_account_id
            .ok_or(ValidationError::MissingFromAccount)?;
        let to = self.to_account_id.ok_or(ValidationError::MissingToAccount)?;
        let amount = self
            .amount
            .filter(|amount| *amount > 0)
            .ok_or(ValidationError::NonPositiveAmount)?;
        let client_token = self
            .client_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ValidationError::MissingClientToken)?;
        if from == to {
            return Err(ValidationError::SameAccount);
        }
        Ok(ValidTransfer {
            from,
            to,
            amount,
            client_token,
        })
    }
}

/// Uniform outcome: a transaction id or an error message, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Success {
        transaction_id: TransactionId,
        /// The id belongs to an earlier request with the same client token.
        replayed: bool,
    },
    Failure {
        error: String,
        /// Infrastructure failures (lock timeouts, outages) may succeed on retry.
        retryable: bool,
    },
}

impl TransferResult {
    fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::Success { transaction_id, .. } => Some(*transaction_id),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, Self::Success { replayed: true, .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                retryable: true,
                ..
            }
        )
    }
}

impl Serialize for TransferResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TransferResult", 3)?;
        state.serialize_field("success", &self.is_success())?;
        state.serialize_field("transaction_id", &self.transaction_id())?;
        state.serialize_field("error", &self.error())?;
        state.end()
    }
}

impl From<ValidationError> for TransferResult {
    fn from(error: ValidationError) -> Self {
        Self::failure(error.to_string())
    }
}

impl From<&TransferError> for TransferResult {
    fn from(error: &TransferError) -> Self {
        match error {
            TransferError::InvalidAmount
            | TransferError::InsufficientFunds
            | TransferError::CurrencyMismatch
            | TransferError::SameAccount => Self::failure(error.to_string()),
            TransferError::AccountNotFound(id) => Self::failure(format!("Account not found: {id}")),
            TransferError::Overflow(_) | TransferError::Storage { .. } => Self::Failure {
                error: format!("Transfer failed: {error}"),
                retryable: error.is_retryable(),
            },
        }
    }
}

pub struct TransferService<S> {
    engine: TransferEngine<S>,
    metrics: Arc<dyn Metrics>,
}

impl<S: Store> TransferService<S> {
    pub fn new(store: Arc<S>, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            engine: TransferEngine::new(store),
            metrics,
        }
    }

    pub fn engine(&self) -> &TransferEngine<S> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<S> {
        self.engine.store()
    }

    pub fn transfer(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
        client_token: &str,
    ) -> TransferResult {
        self.execute(&TransferRequest::new(
            from_account_id,
            to_account_id,
            amount,
            client_token,
        ))
    }

    /// Validates and executes a transfer request.
    pub fn execute(&self, request: &TransferRequest) -> TransferResult {
        let transfer = match request.validate() {
            Ok(transfer) => transfer,
            Err(error) => {
                tracing::debug!(?request, %error, "Transfer request rejected");
                self.metrics.increment(TRANSFERS_FAILED);
                return error.into();
            }
        };

        match self.run(transfer) {
            Ok(receipt) => self.succeeded(receipt),
            Err(result) => {
                self.metrics.increment(TRANSFERS_FAILED);
                result
            }
        }
    }

    fn run(&self, transfer: ValidTransfer<'_>) -> Result<TransferReceipt, TransferResult> {
        let ValidTransfer {
            from,
            to,
            amount,
            client_token,
        } = transfer;

        let existing = self
            .engine
            .idempotency()
            .preflight(client_token)
            .map_err(|error| self.failed(&transfer, &error))?;
        if let Some(transaction) = existing {
            return Ok(TransferReceipt {
                transaction,
                disposition: Disposition::Replayed,
                consistency: Vec::new(),
            });
        }

        let accounts = self
            .store()
            .find_accounts(&[from, to])
            .map_err(|error| self.failed(&transfer, &TransferError::from(error)))?;
        let source = accounts.iter().find(|account| account.id == from);
        let destination = accounts.iter().find(|account| account.id == to);
        let (Some(source), Some(destination)) = (source, destination) else {
            let missing: Vec<String> = [(from, source), (to, destination)]
                .into_iter()
                .filter(|(_, account)| account.is_none())
                .map(|(id, _)| id.to_string())
                .collect();
            tracing::info!(from_account_id = %from, to_account_id = %to, "Transfer account missing");
            return Err(TransferResult::failure(format!(
                "Account not found: {}",
                missing.join(", ")
            )));
        };

        self.engine
            .transfer(source, destination, amount, client_token)
            .map_err(|error| self.failed(&transfer, &error))
    }

    fn succeeded(&self, receipt: TransferReceipt) -> TransferResult {
        for mismatch in receipt.consistency.iter().filter_map(|c| c.mismatch()) {
            report_mismatch(mismatch, "transfer");
        }

        let replayed = receipt.is_replay();
        if replayed {
            self.metrics.increment(TRANSFERS_IDEMPOTENT_HIT);
            tracing::info!(
                transaction_id = %receipt.transaction.id,
                client_token = %receipt.transaction.client_token,
                "Idempotent transfer replay"
            );
        } else {
            self.metrics.increment(TRANSFERS_CREATED);
        }

        TransferResult::Success {
            transaction_id: receipt.transaction.id,
            replayed,
        }
    }

    fn failed(&self, transfer: &ValidTransfer<'_>, error: &TransferError) -> TransferResult {
        match error {
            TransferError::Storage { .. } | TransferError::Overflow(_) => tracing::error!(
                from_account_id = %transfer.from,
                to_account_id = %transfer.to,
                amount = transfer.amount,
                client_token = transfer.client_token,
                retryable = error.is_retryable(),
                error = %error,
                "Transfer failed"
            ),
            _ => tracing::warn!(
                from_account_id = %transfer.from,
                to_account_id = %transfer.to,
                amount = transfer.amount,
                client_token = transfer.client_token,
                error = %error,
                "Transfer rejected"
            ),
        }
        error.into()
    }
}
