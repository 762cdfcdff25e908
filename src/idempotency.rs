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

//! Client-token deduplication.
//!
//! A token is checked three times on its way to becoming a transaction:
//!
//! 1. [`IdempotencyCoordinator::preflight`], outside any lock. Catches plain retries.
//! 2. [`IdempotencyCoordinator::recheck`], inside the unit of work once the
//!    account rows are locked. Catches a request that committed between the
//!    pre-flight read and lock acquisition.
//! 3. [`IdempotencyCoordinator::resolve_conflict`], after the store's unique
//!    constraint rejected the insert. Catches true simultaneous inserts, e.g.
//!    the same token reused on a different account pair.
//!
//! In every case the caller ends up with the transaction that won.

use crate::error::{StoreError, StoreResultExt, TransferError};
use crate::store::{Store, UnitOfWork};
use crate::transaction::Transaction;
use std::sync::Arc;

pub struct IdempotencyCoordinator<S> {
    store: Arc<S>,
}

impl<S> Clone for IdempotencyCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> IdempotencyCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Cheap lookup before any lock is taken.
    pub fn preflight(&self, client_token: &str) -> Result<Option<Transaction>, TransferError> {
        let existing = self
            .store
            .find_transaction_by_token(client_token)
            .context("looking up client token")?;
        if let Some(tx) = &existing {
            tracing::debug!(
                client_token,
                transaction_id = %tx.id,
                "Client token already used (pre-flight)"
            );
        }
        Ok(existing)
    }

    /// Lookup inside an open unit of work, after the account locks are held.
    pub fn recheck<U: UnitOfWork>(
        &self,
        unit: &mut U,
        client_token: &str,
    ) -> Result<Option<Transaction>, TransferError> {
        let existing = unit
            .find_transaction_by_token(client_token)
            .context("rechecking client token")?;
        if let Some(tx) = &existing {
            tracing::info!(
                client_token,
                transaction_id = %tx.id,
                "Concurrent request won the race for client token"
            );
        }
        Ok(existing)
    }

    /// Turns a unique violation on the token into the winning transaction.
    ///
    /// Any other error is passed through unchanged.
    pub fn resolve_conflict(
        &self,
        client_token: &str,
        error: StoreError,
    ) -> Result<Transaction, TransferError> {
        if !matches!(error, StoreError::UniqueViolation { .. }) {
            return Err(error).context("creating transaction");
        }

        match self
            .store
            .find_transaction_by_token(client_token)
            .context("resolving client token conflict")?
        {
            Some(winner) => {
                tracing::info!(
                    client_token,
                    transaction_id = %winner.id,
                    "Duplicate insert rejected by unique constraint, returning winner"
                );
                Ok(winner)
            }
            // Only reachable if the store reports a violation for a token it cannot show.
            None => Err(error).context("client token conflict without a visible winner"),
        }
    }
}
