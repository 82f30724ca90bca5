//! Fleet lifecycle.
//!
//! Every fleet-wide operation has the same shape: pick targets (hosts,
//! nodes, or the fleet containers found on the hosts), fan the operation out
//! over them, and report the aggregate outcome.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::Url;

use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{ComposerError, Result};
use crate::launch::{node_spec, LaunchSettings, ENV_PUBLISH};
use crate::monitor::MonitorTarget;
use crate::registry::{Host, Registry};
use crate::topology::{self, HostSlot, Topology};
use crate::types::{
    alias_from_name, container_name, env_lookup, ContainerRecord, ContainerSpec, LogOptions,
};

pub const DOCKERFILE: &str = "Dockerfile";
pub const DOCKERFILE_FROM_SOURCE: &str = "Dockerfile.from-source";

/// A fleet container found on one of the hosts.
#[derive(Clone)]
pub struct FleetContainer {
    pub host: Arc<Host>,
    pub record: ContainerRecord,
}

impl FleetContainer {
    pub fn alias(&self) -> &str {
        alias_from_name(&self.record.name)
    }
}

impl fmt::Display for FleetContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record.name)
    }
}

#[derive(Clone)]
pub struct HostTarget(pub Arc<Host>);

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.endpoint())
    }
}

/// One node container to create and start.
#[derive(Clone)]
pub struct LaunchTarget {
    pub host: Arc<Host>,
    pub name: String,
    pub alias: String,
    pub endpoint: String,
    spec: ContainerSpec,
}

impl fmt::Display for LaunchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub struct Fleet {
    registry: Registry,
    dispatcher: Dispatcher,
}

impl Fleet {
    pub fn new(registry: Registry, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn host_targets(&self) -> Vec<HostTarget> {
        self.registry.hosts().iter().cloned().map(HostTarget).collect()
    }

    /// Fleet containers on every host, sorted by name.  Any host failing to
    /// answer makes the whole discovery fail.
    pub async fn discover(&self) -> Result<Vec<FleetContainer>> {
        let outcome = self
            .dispatcher
            .dispatch(self.host_targets(), |HostTarget(host)| async move {
                let records = host.client().find_containers_by_prefix().await?;
                Ok(records
                    .into_iter()
                    .map(|record| FleetContainer {
                        host: host.clone(),
                        record,
                    })
                    .collect::<Vec<_>>())
            })
            .await;

        if let Some((host, e)) = outcome.failures().next() {
            outcome.log_failures("get containers");
            return Err(ComposerError::Task(format!(
                "failed to get containers from {}: {}",
                host, e
            )));
        }

        let mut containers: Vec<FleetContainer> = outcome
            .into_values()
            .into_iter()
            .flat_map(|(_, found)| found)
            .collect();
        containers.sort_by(|a, b| a.record.name.cmp(&b.record.name));
        Ok(containers)
    }

    /// Force removes every fleet container on every host and returns the
    /// number removed per host.
    pub async fn remove_existing(&self) -> Outcome<HostTarget, usize> {
        let outcome = self
            .dispatcher
            .dispatch(self.host_targets(), |HostTarget(host)| async move {
                let client = host.client();
                let mut removed = 0;
                for c in client.find_containers_by_prefix().await? {
                    client.remove_container(&c.id).await?;
                    debug!("container removed: {} on {}", c.name, host.endpoint());
                    removed += 1;
                }
                Ok(removed)
            })
            .await;
        outcome.log_failures("remove existing containers");
        outcome
    }

    /// Removes `tag` from every host.  Hosts without the image are skipped.
    pub async fn remove_image(&self, tag: &str) -> Outcome<HostTarget> {
        let tag = tag.to_string();
        let outcome = self
            .dispatcher
            .dispatch(self.host_targets(), move |HostTarget(host)| {
                let tag = tag.clone();
                async move {
                    let client = host.client();
                    let id = client
                        .find_image(&tag)
                        .await?
                        .ok_or_else(|| ComposerError::NotFound(format!("image '{}'", tag)))?;
                    client.remove_image(&id).await
                }
            })
            .await;
        for (host, e) in outcome.failures() {
            if e.is_not_found() {
                warn!("image not found on {}: {}", host, e);
            } else {
                warn!("failed to remove image on {}: {}", host, e);
            }
        }
        outcome
    }

    /// Builds `tag` on every host from the directory `context`.
    pub async fn build(&self, context: &Path, dockerfile: &str, tag: &str) -> Result<Outcome<HostTarget>> {
        let archive = pack_context(context).await?;
        debug!("build context {}: {} bytes", context.display(), archive.len());

        let dockerfile = dockerfile.to_string();
        let tag = tag.to_string();
        let outcome = self
            .dispatcher
            .dispatch(self.host_targets(), move |HostTarget(host)| {
                let archive = archive.clone();
                let dockerfile = dockerfile.clone();
                let tag = tag.clone();
                async move { host.client().build_image(archive, &dockerfile, &tag).await }
            })
            .await;
        outcome.log_failures("build image");
        Ok(outcome)
    }

    /// Discovers the internal address of every host.
    pub async fn discover_ips(&self) -> Outcome<HostTarget, String> {
        let outcome = self
            .dispatcher
            .dispatch(self.host_targets(), |HostTarget(host)| async move {
                host.discover_ip().await
            })
            .await;
        outcome.log_failures("get internal IP");
        outcome
    }

    /// Places `node_count` nodes on the hosts.  Host addresses must have
    /// been discovered.
    pub fn compose(&self, node_count: usize) -> Result<Topology> {
        let slots = self
            .registry
            .hosts()
            .iter()
            .map(|h| {
                let ip = h.ip().ok_or_else(|| {
                    ComposerError::Topology(format!("ip of {} is not discovered", h.endpoint()))
                })?;
                Ok(HostSlot {
                    ip,
                    seeds: &h.seeds,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        topology::compose(node_count, &slots)
    }

    /// Resolves `image` on each host that runs at least one node.
    async fn resolve_images(&self, topology: &Topology, image: &str) -> Result<HashMap<String, String>> {
        let involved: Vec<HostTarget> = self
            .registry
            .hosts()
            .iter()
            .enumerate()
            .filter(|(i, _)| topology.nodes_on(*i).next().is_some())
            .map(|(_, h)| HostTarget(h.clone()))
            .collect();

        let image = image.to_string();
        let outcome = self
            .dispatcher
            .dispatch(involved, move |HostTarget(host)| {
                let image = image.clone();
                async move {
                    host.client().find_image(&image).await?.ok_or_else(|| {
                        ComposerError::NotFound(format!("image '{}' on {}", image, host.endpoint()))
                    })
                }
            })
            .await;

        if let Some((_, e)) = outcome.failures().next() {
            outcome.log_failures("find image");
            return Err(match e {
                ComposerError::NotFound(what) => ComposerError::NotFound(what.clone()),
                e => ComposerError::Task(e.to_string()),
            });
        }
        Ok(outcome
            .into_values()
            .into_iter()
            .map(|(HostTarget(h), id)| (h.endpoint().to_string(), id))
            .collect())
    }

    /// Creates and starts one container per node.  A node that fails is
    /// reported in the outcome; nodes already started keep running.
    pub async fn launch(
        &self,
        topology: &Topology,
        image: &str,
        settings: &LaunchSettings,
    ) -> Result<Outcome<LaunchTarget, String>> {
        let images = self.resolve_images(topology, image).await?;

        let mut targets = Vec::new();
        for node in topology.ordered() {
            let host = self.registry.hosts()[node.host].clone();
            let image_id = images.get(host.endpoint()).cloned().ok_or_else(|| {
                ComposerError::NotFound(format!("image '{}' on {}", image, host.endpoint()))
            })?;
            let settings = LaunchSettings {
                image_id,
                ..settings.clone()
            };
            targets.push(LaunchTarget {
                spec: node_spec(node, &host, &settings),
                name: container_name(&node.alias),
                alias: node.alias.clone(),
                endpoint: node.endpoint.to_string(),
                host,
            });
        }

        let outcome = self
            .dispatcher
            .dispatch(targets, |target: LaunchTarget| async move {
                let launch_err = |e: ComposerError| ComposerError::Launch {
                    name: target.name.clone(),
                    reason: e.to_string(),
                };
                let client = target.host.client();
                let id = client
                    .create_container(&target.name, &target.spec)
                    .await
                    .map_err(launch_err)?;
                client.start_container(&id).await.map_err(launch_err)?;
                info!(
                    "launch node alias={} endpoint={} container={}",
                    target.alias,
                    target.endpoint,
                    &id[..id.len().min(12)]
                );
                Ok(id)
            })
            .await;
        outcome.log_failures("run container");
        Ok(outcome)
    }

    pub async fn stop(&self, targets: Vec<FleetContainer>) -> Outcome<FleetContainer> {
        let outcome = self
            .dispatcher
            .dispatch(targets, |c: FleetContainer| async move {
                c.host.client().stop_container(&c.record.id).await
            })
            .await;
        outcome.log_failures("stop");
        outcome
    }

    pub async fn remove(&self, targets: Vec<FleetContainer>) -> Outcome<FleetContainer> {
        let outcome = self
            .dispatcher
            .dispatch(targets, |c: FleetContainer| async move {
                c.host.client().remove_container(&c.record.id).await
            })
            .await;
        outcome.log_failures("remove");
        outcome
    }

    /// Writes each container's logs to `<output>/<alias>.log`.
    pub async fn collect_logs(
        &self,
        targets: Vec<FleetContainer>,
        output: &Path,
        options: &LogOptions,
    ) -> Outcome<FleetContainer, PathBuf> {
        let output = output.to_path_buf();
        let options = options.clone();
        let outcome = self
            .dispatcher
            .dispatch(targets, move |c: FleetContainer| {
                let path = output.join(format!("{}.log", c.alias()));
                let options = options.clone();
                async move {
                    let logs = c.host.client().logs(&c.record.id, &options, true).await?;
                    tokio::fs::write(&path, logs).await?;
                    Ok(path)
                }
            })
            .await;
        outcome.log_failures("download logs");
        outcome
    }

    /// Copies `source` out of each container into `<output>/<alias>`.
    pub async fn collect_files(
        &self,
        targets: Vec<FleetContainer>,
        source: &str,
        output: &Path,
    ) -> Outcome<FleetContainer, PathBuf> {
        let output = output.to_path_buf();
        let source = source.to_string();
        let outcome = self
            .dispatcher
            .dispatch(targets, move |c: FleetContainer| {
                let dest = output.join(c.alias());
                let source = source.clone();
                async move {
                    let archive = c.host.client().copy_from_container(&c.record.id, &source).await?;
                    unpack(archive, dest.clone()).await?;
                    Ok(dest)
                }
            })
            .await;
        outcome.log_failures("download source");
        outcome
    }

    /// Published endpoint of every running fleet container, with the host
    /// part replaced by the Docker host's name so it is reachable from here.
    pub async fn node_endpoints(&self, targets: Vec<FleetContainer>) -> Result<Vec<String>> {
        let running: Vec<_> = targets.into_iter().filter(|c| !c.record.is_exited()).collect();
        let outcome = self
            .dispatcher
            .dispatch(running, |c: FleetContainer| async move {
                let env = c.host.client().container_env(&c.record.id).await?;
                let publish = env_lookup(&env, ENV_PUBLISH).ok_or_else(|| {
                    ComposerError::NotFound(format!("{} in {}", ENV_PUBLISH, c.record.name))
                })?;
                reachable_endpoint(publish, c.host.endpoint())
            })
            .await;

        if let Some((c, e)) = outcome.failures().next() {
            outcome.log_failures("inspect containers");
            return Err(ComposerError::Task(format!("failed to inspect {}: {}", c, e)));
        }
        Ok(outcome.into_values().into_iter().map(|(_, e)| e).collect())
    }

    /// Status monitor targets for the nodes of `topology`.
    pub fn monitor_targets(&self, topology: &Topology) -> Vec<MonitorTarget> {
        topology
            .ordered()
            .map(|node| MonitorTarget {
                host: self.registry.hosts()[node.host].client().clone(),
                name: container_name(&node.alias),
            })
            .collect()
    }
}

/// Rewrites the host of `publish` to the hostname of `docker_endpoint`.
pub fn reachable_endpoint(publish: &str, docker_endpoint: &str) -> Result<String> {
    let docker = Url::parse(docker_endpoint)
        .map_err(|e| ComposerError::Config(format!("invalid host {}: {}", docker_endpoint, e)))?;
    let hostname = docker
        .host_str()
        .ok_or_else(|| ComposerError::Config(format!("host {} has no hostname", docker_endpoint)))?;

    let mut url = Url::parse(publish)
        .map_err(|e| ComposerError::Config(format!("invalid publish endpoint {}: {}", publish, e)))?;
    url.set_host(Some(hostname))
        .map_err(|e| ComposerError::Config(format!("invalid hostname {}: {}", hostname, e)))?;
    Ok(url.to_string())
}

async fn pack_context(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(ComposerError::Config(format!(
            "build context is not a directory: {}",
            dir.display()
        )));
    }
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(true);
        builder.append_dir_all(".", &dir)?;
        Ok(builder.into_inner()?)
    })
    .await
    .map_err(|e| ComposerError::Task(e.to_string()))?
}

async fn unpack(archive: Vec<u8>, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dest)?;
        tar::Archive::new(Cursor::new(archive)).unpack(&dest)?;
        Ok(())
    })
    .await
    .map_err(|e| ComposerError::Task(e.to_string()))?
}
