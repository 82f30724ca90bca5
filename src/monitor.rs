//! Post-launch status monitor.
//!
//! Polls the state of every launched container for a bounded time.  When
//! it stops, either on timeout or on cancellation, it pulls the trailing
//! logs of every node that is not running so early crashes are visible on
//! the console.  It never acts on what it sees.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{ComposerError, Result};
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerRecord, LogOptions};

const ANSI_ESCAPE: &str = r"\x1B\[([0-9]{1,3}((;[0-9]{1,3})*)?)?[m|K]";

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Bytes of log output kept per excerpt.
    pub tail_bytes: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            tail_bytes: 1000,
        }
    }
}

/// A node container to watch.
#[derive(Clone)]
pub struct MonitorTarget {
    pub host: Arc<dyn ContainerRuntime>,
    pub name: String,
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogExcerpt {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MonitorReport {
    /// Last observed record per container name.
    pub states: BTreeMap<String, ContainerRecord>,
    pub excerpts: Vec<LogExcerpt>,
}

/// Handle to a running monitor task.
pub struct StatusMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<MonitorReport>,
}

impl StatusMonitor {
    pub fn start(targets: Vec<MonitorTarget>, options: MonitorOptions) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(targets, options, cancel.clone()));
        Self { cancel, handle }
    }

    /// Waits for the monitor to stop on its own.  Dropping the returned
    /// future leaves the monitor running, so it can race a stop signal.
    pub async fn wait(&mut self) -> Result<MonitorReport> {
        (&mut self.handle)
            .await
            .map_err(|e| ComposerError::Task(format!("status monitor: {}", e)))
    }

    /// Stops polling early and returns what was seen so far.
    pub async fn stop(mut self) -> Result<MonitorReport> {
        self.cancel.cancel();
        self.wait().await
    }
}

async fn run(
    targets: Vec<MonitorTarget>,
    options: MonitorOptions,
    cancel: CancellationToken,
) -> MonitorReport {
    let dispatcher = Dispatcher::quiet();
    let mut states: BTreeMap<String, ContainerRecord> = BTreeMap::new();

    let deadline = sleep_until(Instant::now() + options.timeout);
    tokio::pin!(deadline);
    let mut ticker = interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("status monitor cancelled");
                break;
            }
            _ = &mut deadline => {
                debug!("status monitor timed out");
                break;
            }
            _ = ticker.tick() => {}
        }

        let pending: Vec<MonitorTarget> = targets
            .iter()
            .filter(|t| !states.get(&t.name).is_some_and(ContainerRecord::is_exited))
            .cloned()
            .collect();
        if pending.is_empty() {
            continue;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = &mut deadline => break,
            outcome = poll(&dispatcher, pending) => {
                for (_, record) in outcome.into_values() {
                    info!("< {}", record);
                    states.insert(record.name.clone(), record);
                }
            }
        }
    }

    let failed: Vec<MonitorTarget> = targets
        .into_iter()
        .filter(|t| !states.get(&t.name).is_some_and(ContainerRecord::is_running))
        .collect();
    let excerpts = excerpts(&dispatcher, failed, options.tail_bytes).await;

    MonitorReport { states, excerpts }
}

async fn poll(dispatcher: &Dispatcher, targets: Vec<MonitorTarget>) -> Outcome<MonitorTarget, ContainerRecord> {
    let outcome = dispatcher
        .dispatch(targets, |t: MonitorTarget| async move {
            t.host.find_container(&t.name).await
        })
        .await;
    for (target, e) in outcome.failures() {
        if e.is_not_found() {
            debug!("{} not found yet", target);
        } else {
            warn!("failed to get state of {}: {}", target, e);
        }
    }
    outcome
}

async fn excerpts(dispatcher: &Dispatcher, targets: Vec<MonitorTarget>, tail_bytes: usize) -> Vec<LogExcerpt> {
    let outcome = dispatcher
        .dispatch(targets, move |t: MonitorTarget| async move {
            let logs = t.host.logs(&t.name, &LogOptions::default(), true).await?;
            let text = strip_ansi(&String::from_utf8_lossy(&logs));
            Ok(tail_window(&text, tail_bytes))
        })
        .await;
    outcome.log_failures("fetch logs");
    outcome
        .into_values()
        .into_iter()
        .map(|(t, text)| LogExcerpt { name: t.name, text })
        .collect()
}

fn ansi_escape() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ANSI_ESCAPE).ok()).as_ref()
}

/// Removes terminal color sequences.
pub fn strip_ansi(text: &str) -> String {
    match ansi_escape() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Last `n` bytes of `text`.
pub fn tail_window(text: &str, n: usize) -> String {
    let bytes = text.as_bytes();
    let start = bytes.len().saturating_sub(n);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::types::STATE_RUNNING;

    fn targets(mock: &Arc<MockRuntime>, names: &[&str]) -> Vec<MonitorTarget> {
        names
            .iter()
            .map(|name| MonitorTarget {
                host: mock.clone(),
                name: name.to_string(),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_fleet_yields_no_excerpts() {
        let mock = Arc::new(MockRuntime::new("tcp://a:2376"));
        for name in ["scn.0000", "scn.0001", "scn.0002"] {
            mock.add_container(name, STATE_RUNNING);
            mock.set_logs(name, b"all good\n");
        }

        let started = Instant::now();
        let mut monitor = StatusMonitor::start(
            targets(&mock, &["scn.0000", "scn.0001", "scn.0002"]),
            MonitorOptions::default(),
        );
        let report = monitor.wait().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(report.excerpts.is_empty());
        assert_eq!(report.states.len(), 3);
        assert!(report.states.values().all(ContainerRecord::is_running));
        assert_eq!(mock.count("logs:scn.0000"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exited_container_is_sticky_and_reported_once() {
        let mock = Arc::new(MockRuntime::new("tcp://a:2376"));
        mock.add_container("scn.0000", STATE_RUNNING);
        mock.add_container("scn.0001", STATE_RUNNING);
        mock.set_logs("scn.0001", b"starting\n\x1b[31mpanic\x1b[0m: boom\n");

        let crasher = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            crasher.set_state("scn.0001", "exited");
        });

        let mut monitor = StatusMonitor::start(
            targets(&mock, &["scn.0000", "scn.0001"]),
            MonitorOptions::default(),
        );
        let report = monitor.wait().await.unwrap();

        // Both polled at 0s, 1s and 2s (seen exited), then only scn.0000 at
        // 3s and 4s.
        assert_eq!(mock.count("list_containers:"), 8);
        assert!(report.states["scn.0001"].is_exited());

        assert_eq!(report.excerpts.len(), 1);
        assert_eq!(report.excerpts[0].name, "scn.0001");
        assert_eq!(report.excerpts[0].text, "starting\npanic: boom\n");
    }

    #[tokio::test(start_paused = true)]
    async fn never_running_nodes_are_reported() {
        let mock = Arc::new(MockRuntime::new("tcp://a:2376"));
        mock.add_container("scn.0000", "created");
        mock.set_logs("scn.0000", b"bad config\n");

        let mut monitor = StatusMonitor::start(
            targets(&mock, &["scn.0000", "scn.0001"]),
            MonitorOptions::default(),
        );
        let report = monitor.wait().await.unwrap();

        // scn.0001 was never seen and has no logs to fetch.
        assert_eq!(
            report.excerpts,
            vec![LogExcerpt {
                name: "scn.0000".into(),
                text: "bad config\n".into(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_timeout() {
        let mock = Arc::new(MockRuntime::new("tcp://a:2376"));
        mock.add_container("scn.0000", STATE_RUNNING);

        let options = MonitorOptions {
            timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let started = Instant::now();
        let mut monitor = StatusMonitor::start(targets(&mock, &["scn.0000"]), options);
        tokio::select! {
            _ = monitor.wait() => panic!("monitor stopped on its own"),
            _ = tokio::time::sleep(Duration::from_millis(2500)) => {}
        }
        let report = monitor.stop().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(mock.count("list_containers:"), 3);
        assert!(report.excerpts.is_empty());
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        assert_eq!(
            strip_ansi("\x1b[1;32mINFO\x1b[0m ready \x1b[K"),
            "INFO ready "
        );
    }

    #[test]
    fn tail_window_keeps_last_bytes() {
        assert_eq!(tail_window("abcdef", 3), "def");
        assert_eq!(tail_window("abc", 1000), "abc");
    }
}
