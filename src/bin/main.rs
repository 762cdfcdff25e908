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

use clap::Parser;
use crossbeam::queue::SegQueue;
use csv::{ReaderBuilder, Trim, Writer};
use lucepay_tx::{
    AccountId, AtomicMetrics, Currency, EngineConfig, MemoryStore, NewAccount, Reconciler, Store,
    StoreError, TransactionId, TransferRequest, TransferResult, TransferService, UserId,
    WorkerScheduler, init_logging,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Wallet transfer runner
///
/// Loads accounts, executes a batch of transfers concurrently and prints one
/// result row per transfer followed by the final balances.
#[derive(Parser, Debug)]
#[command(name = "lucepay-tx")]
#[command(about = "Executes wallet transfers from CSV files", long_about = None)]
struct Args {
    /// Accounts CSV
    ///
    /// Expected format: id,user_id,currency,balance
    #[arg(long, value_name = "FILE")]
    accounts: PathBuf,

    /// Transfers CSV
    ///
    /// Expected format: from_account_id,to_account_id,amount,client_token
    #[arg(value_name = "FILE")]
    transfers: PathBuf,

    /// Number of worker threads executing transfers
    #[arg(long, env = "LUCEPAY_WORKERS", default_value_t = 4)]
    workers: usize,

    /// JSON engine configuration
    #[arg(long, env = "LUCEPAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run the reconciliation sweep periodically while transfers execute
    #[arg(long, env = "LUCEPAY_RECONCILE_INTERVAL_SECS")]
    reconcile_interval_secs: Option<u64>,

    /// Give up waiting for an account lock after this many milliseconds
    #[arg(long, env = "LUCEPAY_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, env = "LUCEPAY_LOG_JSON")]
    log_json: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match EngineConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    if args.lock_timeout_ms.is_some() {
        config.lock_timeout_ms = args.lock_timeout_ms;
    }
    if args.reconcile_interval_secs.is_some() {
        config.reconcile_interval_secs = args.reconcile_interval_secs;
    }
    config.log.json |= args.log_json;

    if let Err(e) = init_logging(&config.log) {
        eprintln!("Error initializing logging: {}", e);
    }

    match run(&args, &config) {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns whether the final reconciliation sweep came out clean.
fn run(args: &Args, config: &EngineConfig) -> Result<bool, CliError> {
    let store = Arc::new(MemoryStore::from_config(config));
    load_accounts(&store, &config.default_currency, open(&args.accounts)?)?;
    let requests = read_transfers(open(&args.transfers)?)?;

    let metrics = Arc::new(AtomicMetrics::new());
    let service = TransferService::new(Arc::clone(&store), metrics.clone());
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store)));

    let scheduler = match config.reconcile_interval() {
        Some(interval) => {
            let scheduler = WorkerScheduler::start()?;
            let job = Arc::new(reconciler.job(config.job_retry_policy()));
            if let Err(e) = scheduler.schedule_every(interval, job) {
                tracing::warn!(error = %e, "Periodic reconciliation not scheduled");
            }
            Some(scheduler)
        }
        None => None,
    };

    let results = execute_transfers(&service, &requests, args.workers);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_results(&requests, &results, &mut out)?;
    writeln!(out)?;
    write_accounts(store.as_ref(), &mut out)?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown();
    }

    for (counter, value) in metrics.snapshot() {
        tracing::info!(counter, value, "Transfer metric");
    }

    let report = reconciler.sweep()?;
    Ok(report.is_clean())
}

fn open(path: &Path) -> Result<BufReader<File>, CliError> {
    Ok(BufReader::new(File::open(path)?))
}

/// Raw accounts CSV record.
///
/// Fields: `id, user_id, currency, balance`
#[derive(Debug, Deserialize)]
struct AccountRecord {
    id: u64,
    user_id: u64,
    #[serde(deserialize_with = "csv::invalid_option")]
    currency: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    balance: Option<i64>,
}

/// Onboards every account in the CSV. Returns how many were created.
///
/// A blank currency falls back to `default_currency`, a blank balance to zero.
/// Malformed rows, duplicate ids and negative balances are skipped.
fn load_accounts<R: Read>(
    store: &MemoryStore,
    default_currency: &Currency,
    reader: R,
) -> Result<usize, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut created = 0;
    for result in rdr.deserialize::<AccountRecord>() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed account row");
                continue;
            }
        };

        let currency = record
            .currency
            .filter(|code| !code.is_empty())
            .map(Currency::new)
            .unwrap_or_else(|| default_currency.clone());
        let account = NewAccount::new(UserId(record.user_id), currency)
            .with_opening_balance(record.balance.unwrap_or(0));

        match store.import_account(AccountId(record.id), account) {
            Ok(_) => created += 1,
            Err(e) => tracing::warn!(account_id = record.id, error = %e, "Skipping account"),
        }
    }

    Ok(created)
}

/// Raw transfers CSV record. Unparseable values become `None` so that they
/// are reported through the service's validation messages.
#[derive(Debug, Deserialize)]
struct TransferRecord {
    #[serde(deserialize_with = "csv::invalid_option")]
    from_account_id: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    to_account_id: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    amount: Option<i64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    client_token: Option<String>,
}

impl From<TransferRecord> for TransferRequest {
    fn from(record: TransferRecord) -> Self {
        Self {
            from_account_id: record.from_account_id.map(AccountId),
            to_account_id: record.to_account_id.map(AccountId),
            amount: record.amount,
            client_token: record.client_token,
        }
    }
}

fn read_transfers<R: Read>(reader: R) -> Result<Vec<TransferRequest>, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut requests = Vec::new();
    for result in rdr.deserialize::<TransferRecord>() {
        match result {
            Ok(record) => requests.push(record.into()),
            Err(e) => tracing::warn!(error = %e, "Skipping malformed transfer row"),
        }
    }
    Ok(requests)
}

/// Runs every request on `workers` threads. Results come back in request order.
fn execute_transfers<S: Store>(
    service: &TransferService<S>,
    requests: &[TransferRequest],
    workers: usize,
) -> Vec<TransferResult> {
    let queue = SegQueue::new();
    for entry in requests.iter().enumerate() {
        queue.push(entry);
    }
    let queue = &queue;

    let mut indexed: Vec<(usize, TransferResult)> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                s.spawn(move || {
                    let mut done = Vec::new();
                    while let Some((index, request)) = queue.pop() {
                        done.push((index, service.execute(request)));
                    }
                    done
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });

    indexed.sort_unstable_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}

#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    from_account_id: Option<AccountId>,
    to_account_id: Option<AccountId>,
    amount: Option<i64>,
    client_token: Option<&'a str>,
    success: bool,
    transaction_id: Option<TransactionId>,
    replayed: bool,
    error: Option<&'a str>,
}

/// Writes one row per request.
///
/// Columns: `from_account_id, to_account_id, amount, client_token, success,
/// transaction_id, replayed, error`
fn write_results<W: Write>(
    requests: &[TransferRequest],
    results: &[TransferResult],
    writer: W,
) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for (request, result) in requests.iter().zip(results) {
        wtr.serialize(ResultRow {
            from_account_id: request.from_account_id,
            to_account_id: request.to_account_id,
            amount: request.amount,
            client_token: request.client_token.as_deref(),
            success: result.is_success(),
            transaction_id: result.transaction_id(),
            replayed: result.is_replayed(),
            error: result.error(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    id: AccountId,
    user_id: UserId,
    currency: &'a str,
    balance: i64,
}

/// Columns: `id, user_id, currency, balance`
fn write_accounts<S: Store, W: Write>(store: &S, writer: W) -> Result<(), CliError> {
    let mut wtr = Writer::from_writer(writer);
    for account in store.find_accounts(&store.account_ids()?)? {
        wtr.serialize(BalanceRow {
            id: account.id,
            user_id: account.user_id,
            currency: account.currency.as_str(),
            balance: account.balance,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucepay_tx::NoopMetrics;
    use std::io::Cursor;

    const ACCOUNTS: &str = "id,user_id,currency,balance\n\
                            1,10,usd,1000\n\
                            2,20,USD,0\n\
                            3,30,EUR,500\n";

    fn setup() -> (Arc<MemoryStore>, TransferService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        load_accounts(&store, &Currency::new("USD"), Cursor::new(ACCOUNTS)).unwrap();
        let service = TransferService::new(Arc::clone(&store), Arc::new(NoopMetrics));
        (store, service)
    }

    fn balance(store: &MemoryStore, id: u64) -> i64 {
        store.find_accounts(&[AccountId(id)]).unwrap()[0].balance
    }

    #[test]
    fn loads_accounts_with_given_ids() {
        let (store, _) = setup();
        assert_eq!(
            store.account_ids().unwrap(),
            vec![AccountId(1), AccountId(2), AccountId(3)]
        );
        assert_eq!(balance(&store, 1), 1000);
        let account = &store.find_accounts(&[AccountId(1)]).unwrap()[0];
        assert_eq!(account.currency.as_str(), "USD");
    }

    #[test]
    fn blank_currency_uses_default_and_bad_rows_are_skipped() {
        let store = MemoryStore::new();
        let csv = "id,user_id,currency,balance\n\
                   1,10,,50\n\
                   x,y,USD,1\n\
                   1,11,USD,5\n\
                   2,12,USD,-5\n";
        let created = load_accounts(&store, &Currency::new("GBP"), Cursor::new(csv)).unwrap();
        assert_eq!(created, 1);
        let account = &store.find_accounts(&[AccountId(1)]).unwrap()[0];
        assert_eq!(account.currency.as_str(), "GBP");
        assert_eq!(account.balance, 50);
    }

    #[test]
    fn unparseable_fields_become_validation_failures() {
        let csv = "from_account_id,to_account_id,amount,client_token\n\
                   1,2,abc,tok-1\n\
                   ,2,10,tok-2\n\
                   1,2,10,\n";
        let requests = read_transfers(Cursor::new(csv)).unwrap();
        assert_eq!(requests.len(), 3);

        let (_, service) = setup();
        let errors: Vec<_> = execute_transfers(&service, &requests, 2)
            .iter()
            .map(|result| result.error().map(str::to_string))
            .collect();
        assert_eq!(
            errors,
            vec![
                Some("amount must be positive".to_string()),
                Some("from_account_id is required".to_string()),
                Some("client_token is required".to_string()),
            ]
        );
    }

    #[test]
    fn concurrent_batch_applies_each_token_once() {
        let csv = "from_account_id,to_account_id,amount,client_token\n\
                   1,2,100,a\n\
                   1,2,100,a\n\
                   2,1,50,b\n\
                   1,3,10,c\n\
                   1,2,5000,d\n\
                   1,2,100,a\n";
        let requests = read_transfers(Cursor::new(csv)).unwrap();
        let (store, service) = setup();

        let results = execute_transfers(&service, &requests, 4);
        assert_eq!(results.len(), 6);
        assert_eq!(results[0].transaction_id(), results[1].transaction_id());
        assert_eq!(results[0].transaction_id(), results[5].transaction_id());
        assert_eq!(
            results[3].error(),
            Some("Currency mismatch between accounts")
        );
        assert_eq!(results[4].error(), Some("Insufficient funds"));

        // "b" may run before "a" lands and fail on funds; either way money is conserved.
        let total: i64 = (1..=3).map(|id| balance(&store, id)).sum();
        assert_eq!(total, 1500);
        assert_eq!(balance(&store, 3), 500);
    }

    #[test]
    fn writes_result_rows_and_balances() {
        let (store, service) = setup();
        let requests = vec![TransferRequest::new(AccountId(1), AccountId(2), 250, "t-1")];
        let results = execute_transfers(&service, &requests, 1);

        let mut output = Vec::new();
        write_results(&requests, &results, &mut output).unwrap();
        write_accounts(store.as_ref(), &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with(
            "from_account_id,to_account_id,amount,client_token,success,transaction_id,replayed,error\n\
             1,2,250,t-1,true,1,false,\n"
        ));
        assert!(text.contains("id,user_id,currency,balance\n1,10,USD,750\n2,20,USD,250\n3,30,EUR,500\n"));
    }
}
