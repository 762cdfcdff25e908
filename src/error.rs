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

//! Error types for storage, transfer execution and request validation.

use crate::base::AccountId;
use thiserror::Error;

/// Storage layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected an insert.
    #[error("duplicate key value violates unique constraint \"{constraint}\": {key}")]
    UniqueViolation {
        constraint: &'static str,
        key: String,
    },

    /// A check constraint rejected a row.
    #[error("new row violates check constraint \"{constraint}\": {detail}")]
    CheckViolation {
        constraint: &'static str,
        detail: String,
    },

    /// Referenced account row does not exist
    #[error("account {0} does not exist")]
    AccountNotFound(AccountId),

    /// Gave up waiting for the row lock of an account
    #[error("lock wait timeout on account {0}")]
    LockTimeout(AccountId),

    /// Gave up waiting for a concurrent claim on the same client token
    #[error("lock wait timeout on client token {0}")]
    ClaimTimeout(String),

    /// Write attempted on an account the unit of work has not locked
    #[error("account {0} is not locked by this unit of work")]
    NotLocked(AccountId),

    /// Backend is unreachable or refused the operation
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Lock-wait timeouts and outages are worth retrying; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(_) | Self::ClaimTimeout(_) | Self::Unavailable(_)
        )
    }
}

/// Transfer engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Amount is zero or negative
    #[error("amount must be positive")]
    InvalidAmount,

    /// Source balance does not cover the amount
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// Source and destination hold different currencies
    #[error("Currency mismatch between accounts")]
    CurrencyMismatch,

    /// Source and destination are the same account
    #[error("Cannot transfer to the same account")]
    SameAccount,

    /// One of the accounts vanished between load and lock
    #[error("account {0} does not exist")]
    AccountNotFound(AccountId),

    /// Balance arithmetic left the `i64` range
    #[error("balance overflow on account {0}")]
    Overflow(AccountId),

    /// Infrastructure failure, wrapped with what the engine was doing.
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            source => Self::Storage {
                context: "storage operation failed",
                source,
            },
        }
    }
}

/// Attaches engine context to storage results.
pub(crate) trait StoreResultExt<T> {
    fn context(self, context: &'static str) -> Result<T, TransferError>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn context(self, context: &'static str) -> Result<T, TransferError> {
        self.map_err(|source| match source {
            StoreError::AccountNotFound(id) => TransferError::AccountNotFound(id),
            source => TransferError::Storage { context, source },
        })
    }
}

/// Request shape errors, detected before any storage access.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("from_account_id is required")]
    MissingFromAccount,

    #[error("to_account_id is required")]
    MissingToAccount,

    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("client_token is required")]
    MissingClientToken,

    #[error("Cannot transfer to the same account")]
    SameAccount,
}
