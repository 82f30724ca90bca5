use super::ContainerRuntime;
use crate::error::{ComposerError, Result};
use crate::types::{ContainerRecord, ContainerSpec, LogOptions};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::{StreamExt, TryStreamExt};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

/// Per-request timeout handed to bollard.  Covers image builds on a cold
/// host.
const REQUEST_TIMEOUT_SECS: u64 = 3600;

/// A remote Docker daemon reached over mutual TLS.
pub struct DockerRuntime {
    endpoint: String,
    docker: Docker,
}

impl DockerRuntime {
    /// Builds the TLS client for `endpoint`.  No request is made; call
    /// [`ContainerRuntime::ping`] to verify the connection.
    pub fn connect(endpoint: &str, ca: &Path, cert: &Path, key: &Path) -> Result<Self> {
        let docker = Docker::connect_with_ssl(
            endpoint,
            key,
            cert,
            ca,
            REQUEST_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            docker,
        })
    }
}

fn not_found(e: bollard::errors::Error, what: impl Into<String>) -> ComposerError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ComposerError::NotFound(what.into()),
        e => e.into(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        // A full listing exercises the same path every command relies on.
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        self.docker.list_containers(Some(opts)).await?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerRecord {
                    id: c.id.unwrap_or_default(),
                    name,
                    host: self.endpoint.clone(),
                    image: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn container_env(&self, id: &str) -> Result<Vec<String>> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| not_found(e, format!("container '{}'", id)))?;
        Ok(detail.config.and_then(|c| c.env).unwrap_or_default())
    }

    async fn find_image(&self, reference: &str) -> Result<Option<String>> {
        let opts = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };
        let images = self.docker.list_images(Some(opts)).await?;
        Ok(images
            .into_iter()
            .find(|i| i.repo_tags.iter().any(|t| t.contains(reference)))
            .map(|i| i.id))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let opts = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(info) = stream.try_next().await? {
            if let Some(status) = info.status {
                debug!("{}: pull {}: {}", self.endpoint, reference, status);
            }
        }
        Ok(())
    }

    async fn build_image(&self, context: Vec<u8>, dockerfile: &str, tag: &str) -> Result<()> {
        let opts = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(opts, None, Some(context.into()));
        while let Some(info) = stream.try_next().await? {
            if let Some(error) = info.error {
                return Err(ComposerError::Docker(
                    bollard::errors::Error::DockerStreamError { error },
                ));
            }
            if let Some(line) = info.stream {
                debug!("{}: build: {}", self.endpoint, line.trim_end());
            }
        }
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        let opts = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(id, Some(opts), None)
            .await
            .map_err(|e| not_found(e, format!("image '{}'", id)))?;
        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            network_mode: spec.host_network.then(|| "host".to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            tty: Some(false),
            open_stdin: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self.docker.create_container(Some(opts), config).await?;
        for warning in response.warnings {
            warn!("{}: create {}: {}", self.endpoint, name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found(e, format!("container '{}'", id)))
    }

    async fn wait_container(&self, id: &str) -> Result<()> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => {}
                // A non-zero exit still means the container finished.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    debug!("{}: container {} exited with {}", self.endpoint, id, code);
                }
                Err(e) => return Err(not_found(e, format!("container '{}'", id))),
            }
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(|e| not_found(e, format!("container '{}'", id)))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(opts))
            .await
            .map_err(|e| not_found(e, format!("container '{}'", id)))?;
        debug!("{}: container removed: {}", self.endpoint, id);
        Ok(())
    }

    async fn logs(&self, id: &str, options: &LogOptions, stderr: bool) -> Result<Vec<u8>> {
        let opts = LogsOptions::<String> {
            stdout: true,
            stderr,
            since: options.since,
            tail: options.tail.clone(),
            ..Default::default()
        };
        let mut out = Vec::new();
        let mut stream = self.docker.logs(id, Some(opts));
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| not_found(e, format!("container '{}'", id)))?;
            out.extend_from_slice(&chunk.into_bytes());
        }
        Ok(out)
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let opts = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut out = Vec::new();
        let mut stream = self.docker.download_from_container(id, Some(opts));
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| not_found(e, format!("'{}' in '{}'", path, id)))?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
