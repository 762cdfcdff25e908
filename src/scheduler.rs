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

//! Background job capability.
//!
//! The engine only needs "run this unit of work, at least once, with bounded
//! retries". [`Scheduler`] is that port; [`WorkerScheduler`] is a small
//! single-worker implementation for hosts that do not bring their own, and
//! [`InlineScheduler`] runs jobs on the calling thread.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a job attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct JobError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    ShutDown,

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Wait before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

type Task = Box<dyn Fn() -> Result<(), JobError> + Send + Sync>;

/// A named, re-runnable unit of work.
pub struct Job {
    name: &'static str,
    retry: RetryPolicy,
    task: Task,
}

/// What happened to one run of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub attempts: u32,
    pub result: Result<(), JobError>,
}

impl Job {
    pub fn new<F>(name: &'static str, retry: RetryPolicy, task: F) -> Self
    where
        F: Fn() -> Result<(), JobError> + Send + Sync + 'static,
    {
        Self {
            name,
            retry,
            task: Box::new(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs the task until it succeeds or the retry budget is spent.
    pub fn run(&self) -> JobOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match (self.task)() {
                Ok(()) => {
                    tracing::debug!(job = self.name, attempts, "Job succeeded");
                    return JobOutcome {
                        attempts,
                        result: Ok(()),
                    };
                }
                Err(error) if attempts < self.retry.max_attempts => {
                    tracing::warn!(job = self.name, attempts, %error, "Job attempt failed, retrying");
                    thread::sleep(self.retry.backoff * attempts);
                }
                Err(error) => {
                    tracing::error!(job = self.name, attempts, %error, "Job failed, giving up");
                    return JobOutcome {
                        attempts,
                        result: Err(error),
                    };
                }
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Arc<Job>) -> Result<(), SchedulerError>;
}

/// Runs every job immediately on the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, job: Arc<Job>) -> Result<(), SchedulerError> {
        job.run();
        Ok(())
    }
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// One worker thread draining a job queue, plus optional periodic tickers.
pub struct WorkerScheduler {
    sender: Option<Sender<Arc<Job>>>,
    worker: Option<JoinHandle<()>>,
    tickers: Mutex<Vec<Ticker>>,
}

impl WorkerScheduler {
    pub fn start() -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Arc<Job>>();
        let worker = thread::Builder::new()
            .name("lucepay-jobs".to_string())
            .spawn(move || {
                for job in receiver {
                    job.run();
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            tickers: Mutex::new(Vec::new()),
        })
    }

    /// Enqueues `job` once per `interval` until shutdown.
    pub fn schedule_every(&self, interval: Duration, job: Arc<Job>) -> Result<(), SchedulerError> {
        let sender = self.sender.clone().ok_or(SchedulerError::ShutDown)?;
        let (stop, stopped) = channel::bounded::<()>(0);
        let ticks = channel::tick(interval);
        let name = job.name();

        let handle = thread::Builder::new()
            .name(format!("lucepay-tick-{name}"))
            .spawn(move || {
                loop {
                    channel::select! {
                        recv(ticks) -> _ => {
                            if sender.send(Arc::clone(&job)).is_err() {
                                break;
                            }
                        }
                        recv(stopped) -> _ => break,
                    }
                }
            })
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        tracing::info!(job = name, interval_ms = interval.as_millis() as u64, "Periodic job registered");
        self.tickers.lock().push(Ticker { stop, handle });
        Ok(())
    }

    /// Stops the tickers, runs what is already queued, and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for ticker in self.tickers.lock().drain(..) {
            drop(ticker.stop);
            let _ = ticker.handle.join();
        }
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Scheduler for WorkerScheduler {
    fn schedule(&self, job: Arc<Job>) -> Result<(), SchedulerError> {
        self.sender
            .as_ref()
            .ok_or(SchedulerError::ShutDown)?
            .send(job)
            .map_err(|_| SchedulerError::ShutDown)
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
