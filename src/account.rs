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

//! Wallet accounts.
//!
//! An [`Account`] holds a non-negative balance in minor currency units. The
//! record itself carries no locking; exclusive access is obtained through
//! [`UnitOfWork::lock_account`](crate::store::UnitOfWork::lock_account).
//!
//! # Example
//!
//! ```
//! use lucepay_tx::{Currency, NewAccount, UserId};
//!
//! let new = NewAccount::new(UserId(1), Currency::new("usd")).with_opening_balance(1_000);
//! assert_eq!(new.currency.as_str(), "USD");
//! assert_eq!(new.opening_balance, 1_000);
//! ```

use crate::base::{AccountId, Currency, UserId};
use crate::error::TransferError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wallet account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    /// Balance in minor currency units. Never negative in steady state.
    pub balance: i64,
    pub currency: Currency,
    /// Set when a debit would have taken the balance below zero.
    ///
    /// Written defensively, never read: no policy blocks a flagged account.
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn can_cover(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= 0,
            "Invariant violated: balance of account {} went negative: {}",
            self.id,
            self.balance
        );
    }

    /// Decreases the balance and returns the new value.
    ///
    /// A debit that would overdraw flags `locked_at` and fails without moving funds.
    pub fn withdraw(&mut self, amount: i64, at: DateTime<Utc>) -> Result<i64, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        let balance = self
            .balance
            .checked_sub(amount)
            .ok_or(TransferError::Overflow(self.id))?;
        if balance < 0 {
            self.locked_at = Some(at);
            return Err(TransferError::InsufficientFunds);
        }
        self.balance = balance;
        self.assert_invariants();
        Ok(balance)
    }

    /// Increases the balance and returns the new value.
    pub fn deposit(&mut self, amount: i64) -> Result<i64, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(TransferError::Overflow(self.id))?;
        self.assert_invariants();
        Ok(self.balance)
    }
}

/// Onboarding request for a new wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub user_id: UserId,
    pub currency: Currency,
    /// Booked as an opening credit entry so the ledger matches from the start.
    #[serde(default)]
    pub opening_balance: i64,
}

impl NewAccount {
    pub fn new(user_id: UserId, currency: Currency) -> Self {
        Self {
            user_id,
            currency,
            opening_balance: 0,
        }
    }

    pub fn with_opening_balance(mut self, opening_balance: i64) -> Self {
        self.opening_balance = opening_balance;
        self
    }
}
