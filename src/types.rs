//! Data structures shared between the fleet orchestrator and the container
//! runtimes.
//!
//! These are deliberately independent of the Docker API types so that the
//! orchestrator can be exercised against an in-memory runtime.  Records are
//! snapshots: they are re-fetched for every command and never cached.

use serde::Serialize;
use std::fmt;

/// Every fleet container name starts with this prefix.
pub const CONTAINER_NAME_PREFIX: &str = "scn.";

/// Number of alias characters kept in a container name.
pub const ALIAS_NAME_LEN: usize = 4;

pub const STATE_RUNNING: &str = "running";
pub const STATE_EXITED: &str = "exited";

/// Container name for a node alias.  The discovery filter matches on
/// [`CONTAINER_NAME_PREFIX`], so both must stay in sync.
pub fn container_name(alias: &str) -> String {
    let short: String = alias.chars().take(ALIAS_NAME_LEN).collect();
    format!("{}{}", CONTAINER_NAME_PREFIX, short)
}

/// Alias part of a fleet container name.
pub fn alias_from_name(name: &str) -> &str {
    name.strip_prefix(CONTAINER_NAME_PREFIX).unwrap_or(name)
}

/// A container as last reported by a remote runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Name without the leading `/` Docker adds.
    pub name: String,
    /// Endpoint of the host the container lives on.
    pub host: String,
    pub image: String,
    /// Machine readable state (`created`, `running`, `exited`, ...).
    pub state: String,
    /// Human readable status (`Up 3 seconds`, ...).
    pub status: String,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }

    pub fn is_exited(&self) -> bool {
        self.state == STATE_EXITED
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(4)]
    }
}

impl fmt::Display for ContainerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.name,
            self.short_id(),
            self.state,
            self.status
        )
    }
}

/// Bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
}

/// Everything a runtime needs to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<BindMount>,
    /// Ports exposed as `<port>/tcp` and bound on `0.0.0.0` of the host.
    pub ports: Vec<u16>,
    pub host_network: bool,
}

impl ContainerSpec {
    /// Value of `key` in the environment list, if present.
    #[cfg(test)]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_lookup(&self.env, key)
    }
}

pub fn env_lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|e| {
        e.split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

/// Options for fetching container logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Unix timestamp; `0` means from the beginning.
    pub since: i64,
    /// Number of trailing lines or `all`.
    pub tail: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            since: 0,
            tail: "all".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_round_trips_through_discovery_filter() {
        for alias in ["0000", "0312", "9999"] {
            let name = container_name(alias);
            assert!(name.starts_with(CONTAINER_NAME_PREFIX));
            assert_eq!(alias_from_name(&name), alias);
            assert_eq!(container_name(alias), name);
        }
    }

    #[test]
    fn container_name_truncates_long_aliases() {
        assert_eq!(container_name("abcdefgh"), "scn.abcd");
    }

    #[test]
    fn env_lookup_splits_on_first_equals() {
        let env = vec!["A=1".to_string(), "URL=https://x?address=y".to_string()];
        assert_eq!(env_lookup(&env, "URL"), Some("https://x?address=y"));
        assert_eq!(env_lookup(&env, "B"), None);
    }
}
