//! Host registry.
//!
//! One [`Host`] per configured Docker endpoint, each owning the single
//! authenticated client shared by every fan-out unit that targets it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use log::{debug, info};

use crate::config::{Config, EnvVar, Volume};
use crate::error::{ComposerError, Result};
use crate::keypair::Keypair;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::types::{LogOptions, ContainerSpec};

const IP_HELPER_IMAGE: &str = "alpine:latest";
const IP_HELPER_PULL: &str = "docker.io/library/alpine:latest";
const IP_HELPER_NAME: &str = "sebak-network-composer-get-ip";
const IP_HELPER_SCRIPT: &str =
    "/sbin/ip route | grep '^default ' | sed -e 's/.* src //g' -e 's/ metric.*//g'";

pub struct Host {
    /// Alias of the host in the config file.
    pub name: String,
    client: Arc<dyn ContainerRuntime>,
    ip: OnceLock<String>,
    pub volumes: Vec<Volume>,
    pub env: Vec<EnvVar>,
    pub seeds: Vec<Keypair>,
}

impl Host {
    pub fn new(name: &str, client: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            name: name.to_string(),
            client,
            ip: OnceLock::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            seeds: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    pub fn client(&self) -> &Arc<dyn ContainerRuntime> {
        &self.client
    }

    /// Address the host's containers are reachable at, once discovered.
    pub fn ip(&self) -> Option<&str> {
        self.ip.get().map(String::as_str)
    }

    /// Records the discovered address.  The first value wins.
    pub fn set_ip(&self, ip: String) {
        if self.ip.set(ip).is_err() {
            debug!("{}: ip already discovered", self.endpoint());
        }
    }

    /// Finds the host's primary address by running a throwaway container in
    /// host network mode and reading its default route.
    pub async fn discover_ip(&self) -> Result<String> {
        if let Some(ip) = self.ip() {
            return Ok(ip.to_string());
        }

        let client = &self.client;
        let image = match client.find_image(IP_HELPER_IMAGE).await? {
            Some(id) => id,
            None => {
                client.pull_image(IP_HELPER_PULL).await?;
                client.find_image(IP_HELPER_IMAGE).await?.ok_or_else(|| {
                    ComposerError::NotFound(format!("image '{}' after pull", IP_HELPER_IMAGE))
                })?
            }
        };

        client.remove_container_by_name(IP_HELPER_NAME).await?;

        let spec = ContainerSpec {
            image,
            entrypoint: vec!["/bin/sh".into(), "-c".into(), IP_HELPER_SCRIPT.into()],
            host_network: true,
            ..Default::default()
        };
        let id = client.create_container(IP_HELPER_NAME, &spec).await?;

        let output = async {
            client.start_container(&id).await?;
            client.wait_container(&id).await?;
            client.logs(&id, &LogOptions::default(), false).await
        }
        .await;

        if let Err(e) = client.remove_container(&id).await {
            debug!("{}: failed to remove ip helper: {}", self.endpoint(), e);
        }

        let ip = String::from_utf8_lossy(&output?).trim().to_string();
        if ip.is_empty() {
            return Err(ComposerError::NotFound(format!(
                "internal ip of {}",
                self.endpoint()
            )));
        }
        info!("{}: internal ip {}", self.endpoint(), ip);
        self.set_ip(ip.clone());
        Ok(ip)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint())
            .field("ip", &self.ip())
            .finish_non_exhaustive()
    }
}

/// The configured hosts, ordered by endpoint.
#[derive(Debug, Default)]
pub struct Registry {
    hosts: Vec<Arc<Host>>,
}

impl Registry {
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        Self { hosts }
    }

    /// Connects to every configured host and verifies each connection.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut hosts = Vec::new();
        for (name, hc) in config.ordered_hosts() {
            let runtime = DockerRuntime::connect(&hc.host, &hc.ca, &hc.cert, &hc.cert_key)
                .map_err(|e| ComposerError::Config(format!("host `{}`: {}", name, e)))?;
            runtime
                .ping()
                .await
                .map_err(|e| ComposerError::Config(format!("host `{}`: {}", name, e)))?;
            debug!("connected to {} ({})", hc.host, name);

            let mut host = Host::new(name, Arc::new(runtime));
            host.volumes = hc.volume.clone();
            host.env = hc.env.clone();
            host.seeds = hc.seed_keypairs()?;
            hosts.push(Arc::new(host));
        }
        Ok(Self::new(hosts))
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}
