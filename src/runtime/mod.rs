use crate::error::{ComposerError, Result};
use crate::types::{ContainerRecord, ContainerSpec, LogOptions, CONTAINER_NAME_PREFIX};
use async_trait::async_trait;

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;

/// Primitive operations of one remote container runtime.
///
/// Implementations are shared between concurrent fan-out units, so every
/// method takes `&self`.  A missing container or image is reported as
/// [`ComposerError::NotFound`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Endpoint the runtime is reached at; copied into container records.
    fn endpoint(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    async fn container_env(&self, id: &str) -> Result<Vec<String>>;

    /// Image id of the first image whose tag contains `reference`.
    async fn find_image(&self, reference: &str) -> Result<Option<String>>;

    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Builds `tag` from a tar archive of the build context.
    async fn build_image(&self, context: Vec<u8>, dockerfile: &str, tag: &str) -> Result<()>;

    async fn remove_image(&self, id: &str) -> Result<()>;

    /// Creates a container and returns its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Blocks until the container exits.
    async fn wait_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force removes a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Combined stdout and stderr of a container.
    async fn logs(&self, id: &str, options: &LogOptions, stderr: bool) -> Result<Vec<u8>>;

    /// Tar archive of `path` inside the container.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    /// Fleet containers, identified by the name prefix.
    async fn find_containers_by_prefix(&self) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| c.name.starts_with(CONTAINER_NAME_PREFIX))
            .collect())
    }

    /// First container whose name contains `name`.
    async fn find_container(&self, name: &str) -> Result<ContainerRecord> {
        self.list_containers()
            .await?
            .into_iter()
            .find(|c| c.name.contains(name))
            .ok_or_else(|| ComposerError::NotFound(format!("container '{}'", name)))
    }

    /// Removes the container matching `name`; absence is not an error.
    async fn remove_container_by_name(&self, name: &str) -> Result<()> {
        match self.find_container(name).await {
            Ok(c) => self.remove_container(&c.id).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
