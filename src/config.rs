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

//! Engine configuration.

use crate::base::Currency;
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `lucepay_tx=debug`.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock-wait limit on account rows and client-token claims. Unset waits forever.
    pub lock_timeout_ms: Option<u64>,
    /// Currency of newly onboarded accounts.
    pub default_currency: Currency,
    /// Period of the reconciliation sweep. Unset disables the periodic job.
    pub reconcile_interval_secs: Option<u64>,
    pub job_max_attempts: u32,
    pub job_backoff_ms: u64,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: None,
            default_currency: Currency::new("USD"),
            reconcile_interval_secs: None,
            job_max_attempts: 3,
            job_backoff_ms: 500,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn job_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.job_max_attempts.max(1),
            backoff: Duration::from_millis(self.job_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout(), None);
        assert_eq!(config.default_currency.as_str(), "USD");
        assert_eq!(config.reconcile_interval(), None);
        assert_eq!(config.job_retry_policy().max_attempts, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"lock_timeout_ms": 250, "default_currency": "eur"}"#)
                .unwrap();
        assert_eq!(config.lock_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.default_currency.as_str(), "EUR");
        assert_eq!(config.job_backoff_ms, 500);
        assert!(!config.log.json);
    }

    #[test]
    fn zero_interval_disables_reconciliation() {
        let config = EngineConfig {
            reconcile_interval_secs: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.reconcile_interval(), None);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let config = EngineConfig {
            job_max_attempts: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.job_retry_policy().max_attempts, 1);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"reconcile_interval_secs": 60, "log": {{"level": "debug", "json": true}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.reconcile_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn malformed_file_is_invalid_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = EngineConfig::from_json_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
