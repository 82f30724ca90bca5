//! Command handlers.
//!
//! Each handler loads the config, connects to every host and drives one
//! fleet operation.  Errors returned before any remote work starts are setup
//! errors; a [`PartialFailure`] means the operation ran but some targets
//! failed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use tokio::signal;

use crate::config::Config;
use crate::dispatch::{Dispatcher, Outcome};
use crate::fleet::{FleetContainer, Fleet, DOCKERFILE, DOCKERFILE_FROM_SOURCE};
use crate::launch::{LaunchSettings, DEFAULT_NETWORK_ID};
use crate::monitor::{tail_window, MonitorOptions, StatusMonitor};
use crate::probe::{probe_all, HttpProbe, DEFAULT_PROBE_TIMEOUT};
use crate::registry::Registry;
use crate::types::{ContainerRecord, LogOptions};

pub const DEFAULT_IMAGE: &str = "boscoin/sebak-network-composer:latest";

/// Bytes of each log file printed by `logs --verbose`.
const VERBOSE_LOG_BYTES: usize = 10000;

/// Some targets of an aggregate operation failed.
#[derive(Debug, thiserror::Error)]
#[error("{what}: {failed} of {total} {noun} failed ({})", .targets.join(", "))]
pub struct PartialFailure {
    pub what: String,
    pub noun: String,
    pub failed: usize,
    pub total: usize,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Level {
    Crit,
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    pub fn filter(self) -> log::LevelFilter {
        match self {
            Level::Crit | Level::Error => log::LevelFilter::Error,
            Level::Warn => log::LevelFilter::Warn,
            Level::Info => log::LevelFilter::Info,
            Level::Debug => log::LevelFilter::Debug,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Crit => "crit",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
        };
        f.write_str(name)
    }
}

async fn connect(path: &Path) -> Result<(Config, Fleet)> {
    let config = Config::load(path)?;
    let registry = Registry::connect(&config).await?;
    info!("connected to {} hosts", registry.len());
    Ok((config, Fleet::new(registry, Dispatcher::default())))
}

/// Prints the summary line and turns failures into a [`PartialFailure`].
fn summarize<T, R>(outcome: &Outcome<T, R>, what: &str, noun: &str) -> Result<()>
where
    T: Clone + fmt::Display,
{
    if outcome.is_success() {
        if outcome.is_empty() {
            println!("{}: no {}", what, noun);
        } else {
            println!("{}: {} {} done", what, outcome.len(), noun);
        }
        return Ok(());
    }
    let failure = PartialFailure {
        what: what.to_string(),
        noun: noun.to_string(),
        failed: outcome.failure_count(),
        total: outcome.len(),
        targets: outcome
            .failed_targets()
            .iter()
            .map(ToString::to_string)
            .collect(),
    };
    println!("{}", failure);
    Err(failure.into())
}

/// Banner above a log excerpt, with the last state seen for the node.
fn excerpt_header(name: &str, last: Option<&ContainerRecord>) -> String {
    let state = match last {
        Some(record) => format!("{} {}", record.state, record.status),
        None => "never seen".to_string(),
    };
    format!("= {} ({}) {}", name, state, "=".repeat(50))
}

fn print_containers(containers: &[FleetContainer]) {
    let names: Vec<&str> = containers.iter().map(|c| c.record.name.as_str()).collect();
    println!("containers: {}", names.join(", "));
}

pub async fn build(config: &Path, image: &str, source: bool, force: bool) -> Result<()> {
    let (config, fleet) = connect(config).await?;
    if config.docker_path.as_os_str().is_empty() {
        bail!("`docker-path` is not configured");
    }

    if force {
        fleet.remove_image(image).await;
    }

    let dockerfile = if source { DOCKERFILE_FROM_SOURCE } else { DOCKERFILE };
    info!(
        "building {} from {} ({})",
        image,
        config.docker_path.display(),
        dockerfile
    );
    let outcome = fleet.build(&config.docker_path, dockerfile, image).await?;
    summarize(&outcome, "build", "hosts")
}

pub struct RunArgs {
    pub nodes: usize,
    pub image: String,
    pub force: bool,
    pub sebak_log_level: Level,
}

pub async fn run(config: &Path, args: RunArgs) -> Result<()> {
    let (config, fleet) = connect(config).await?;
    debug!(
        "composing network: nodes={} image={} sebak-log-level={}",
        args.nodes, args.image, args.sebak_log_level
    );

    if args.force {
        fleet.remove_existing().await;
    }

    let ips = fleet.discover_ips().await;
    if let Some((host, e)) = ips.failures().next() {
        bail!("failed to get internal IP of {}: {}", host, e);
    }

    let topology = fleet.compose(args.nodes)?;
    if topology.is_empty() {
        bail!("nothing to launch");
    }
    let settings = LaunchSettings {
        image_id: String::new(),
        genesis: config.genesis.clone(),
        common_seed: config.common_seed(),
        log_level: args.sebak_log_level.to_string(),
        network_id: DEFAULT_NETWORK_ID.to_string(),
    };
    let launched = fleet.launch(&topology, &args.image, &settings).await?;

    let mut monitor =
        StatusMonitor::start(fleet.monitor_targets(&topology), MonitorOptions::default());
    let report = tokio::select! {
        report = monitor.wait() => report?,
        _ = signal::ctrl_c() => {
            info!("interrupted, stopping status monitor");
            monitor.stop().await?
        }
    };

    for excerpt in &report.excerpts {
        println!("{}", excerpt_header(&excerpt.name, report.states.get(&excerpt.name)));
        println!("...\n{}", excerpt.text);
    }

    for node in topology.ordered() {
        debug!("launch node alias={} endpoint={}", node.alias, node.endpoint);
    }
    summarize(&launched, "run", "nodes")
}

pub async fn stop(config: &Path) -> Result<()> {
    let (_, fleet) = connect(config).await?;
    let containers = fleet.discover().await?;
    print_containers(&containers);
    let outcome = fleet.stop(containers).await;
    summarize(&outcome, "stop", "containers")
}

pub async fn remove(config: &Path) -> Result<()> {
    let (_, fleet) = connect(config).await?;
    let containers = fleet.discover().await?;
    print_containers(&containers);
    let outcome = fleet.remove(containers).await;
    summarize(&outcome, "remove", "containers")
}

pub async fn list(config: &Path) -> Result<()> {
    let (_, fleet) = connect(config).await?;
    let containers = fleet.discover().await?;
    print_containers(&containers);
    for c in &containers {
        println!("{}", "=".repeat(80));
        println!("{}", c.host.endpoint());
        println!("{}", serde_json::to_string_pretty(&c.record)?);
    }
    Ok(())
}

pub struct LogsArgs {
    pub output: Option<PathBuf>,
    pub since: Option<String>,
    pub tail: String,
    pub verbose: bool,
}

pub async fn logs(config: &Path, args: LogsArgs) -> Result<()> {
    let output = match args.output {
        Some(dir) => dir,
        None => default_output_directory()?,
    };
    let options = LogOptions {
        since: match &args.since {
            Some(since) => parse_since(since, chrono::Utc::now().timestamp())?,
            None => 0,
        },
        tail: args.tail,
    };

    let (_, fleet) = connect(config).await?;
    tokio::fs::create_dir_all(&output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;
    let containers = fleet.discover().await?;
    print_containers(&containers);

    let outcome = fleet.collect_logs(containers, &output, &options).await;
    if args.verbose {
        for result in &outcome.results {
            let Ok(path) = &result.result else { continue };
            let body = tokio::fs::read(path).await?;
            println!("= {} ================", path.display());
            println!("{}", tail_window(&String::from_utf8_lossy(&body), VERBOSE_LOG_BYTES));
        }
    }
    info!("logs written to {}", output.display());
    summarize(&outcome, "logs", "containers")
}

pub async fn copy(config: &Path, source: &str, output: &Path) -> Result<()> {
    if source.is_empty() {
        bail!("<source> must be given");
    }
    let (_, fleet) = connect(config).await?;
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;

    let containers = fleet.discover().await?;
    print_containers(&containers);
    let outcome = fleet.collect_files(containers, source, output).await;
    summarize(&outcome, "copy", "containers")
}

pub async fn node_info(config: &Path, image: &str, verbose: bool) -> Result<()> {
    let (_, fleet) = connect(config).await?;
    debug!("node info for image {}", image);

    let containers = fleet.discover().await?;
    let endpoints = fleet.node_endpoints(containers).await?;
    if endpoints.is_empty() {
        bail!("containers not found");
    }

    let probe = Arc::new(HttpProbe::new(DEFAULT_PROBE_TIMEOUT)?);
    let outcome = probe_all(probe, endpoints, fleet.dispatcher()).await;
    if verbose {
        for result in &outcome.results {
            if let Ok(body) = &result.result {
                println!("{} == {}", result.target, body);
            }
        }
    }
    summarize(&outcome, "node-info", "nodes")
}

/// `--since` as a unix timestamp: either given directly or as a duration
/// before `now`.
pub fn parse_since(value: &str, now: i64) -> Result<i64> {
    if let Ok(ts) = value.parse::<i64>() {
        return Ok(ts);
    }
    let ago: Duration = humantime::parse_duration(value)
        .with_context(|| format!("invalid `--since`: {}", value))?;
    Ok(now - ago.as_secs() as i64)
}

fn default_output_directory() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()))
}
