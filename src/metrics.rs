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

//! Outcome counters.
//!
//! The transfer service reports to whatever [`Metrics`] sink it was built
//! with; nothing here is global.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const TRANSFERS_CREATED: &str = "transfers.created";
pub const TRANSFERS_FAILED: &str = "transfers.failed";
pub const TRANSFERS_IDEMPOTENT_HIT: &str = "transfers.idempotent_hit";

pub trait Metrics: Send + Sync {
    fn increment(&self, counter: &'static str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _counter: &'static str) {}
}

/// In-process counters, safe to share between threads.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: DashMap<&'static str, AtomicU64>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: &str) -> u64 {
        self.counters
            .get(counter)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut counters: Vec<_> = self
            .counters
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort_unstable_by_key(|(name, _)| *name);
        counters
    }
}

impl Metrics for AtomicMetrics {
    fn increment(&self, counter: &'static str) {
        if let Some(value) = self.counters.get(counter) {
            value.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(counter)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }
}
