//! Command fan-out.
//!
//! Runs one operation per target as independent tasks, waits for all of
//! them, and hands back every outcome.  A failing target never cancels its
//! siblings.

use std::fmt;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

use futures_util::future::join_all;
use log::error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ComposerError, Result};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Outcome of the operation for one target.
#[derive(Debug)]
pub struct TaskResult<T, R> {
    pub target: T,
    pub result: Result<R>,
}

/// All outcomes of one dispatch, in target order.
#[derive(Debug)]
pub struct Outcome<T, R = ()> {
    pub results: Vec<TaskResult<T, R>>,
}

impl<T, R> Outcome<T, R> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&T, &ComposerError)> {
        self.results
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|e| (&r.target, e)))
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// Targets to hand to a retry.
    pub fn failed_targets(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.failures().map(|(t, _)| t.clone()).collect()
    }

    /// Successful values with their targets.
    pub fn into_values(self) -> Vec<(T, R)> {
        self.results
            .into_iter()
            .filter_map(|r| r.result.ok().map(|v| (r.target, v)))
            .collect()
    }

    /// Logs every failure as `<what> failed`.
    pub fn log_failures(&self, what: &str)
    where
        T: fmt::Display,
    {
        for (target, e) in self.failures() {
            error!("{} failed target={} error={}", what, target, e);
        }
    }
}

/// Fan-out executor.  `heartbeat` prints a dot to stderr per period while
/// a dispatch is in flight.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    heartbeat: Option<Duration>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT)
    }
}

impl Dispatcher {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat: Some(heartbeat),
        }
    }

    /// No progress output.
    pub fn quiet() -> Self {
        Self { heartbeat: None }
    }

    /// Runs `op` once per target and returns one result per target.
    pub async fn dispatch<T, R, F, Fut>(&self, targets: Vec<T>, op: F) -> Outcome<T, R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let heartbeat = self.heartbeat.map(Heartbeat::start);

        let handles: Vec<JoinHandle<Result<R>>> = targets
            .iter()
            .cloned()
            .map(|target| tokio::spawn(op(target)))
            .collect();
        let joined = join_all(handles).await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        let results = targets
            .into_iter()
            .zip(joined)
            .map(|(target, joined)| TaskResult {
                target,
                result: joined
                    .map_err(|e| ComposerError::Task(e.to_string()))
                    .and_then(|r| r),
            })
            .collect();
        Outcome { results }
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        eprintln!(".");
                        break;
                    }
                    _ = ticker.tick() => {
                        eprint!(".");
                        let _ = std::io::stderr().flush();
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    /// Stops the ticker; consuming `self` makes this a one-shot signal.
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
