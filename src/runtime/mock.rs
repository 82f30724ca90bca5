//! In-memory runtime used by the unit tests.

use super::ContainerRuntime;
use crate::error::{ComposerError, Result};
use crate::types::{ContainerRecord, ContainerSpec, LogOptions, STATE_RUNNING};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    containers: Vec<ContainerRecord>,
    specs: HashMap<String, ContainerSpec>,
    images: Vec<(String, String)>,
    logs: HashMap<String, Vec<u8>>,
    archives: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    calls: Vec<String>,
    next_id: usize,
}

pub struct MockRuntime {
    endpoint: String,
    inner: Mutex<Inner>,
}

impl MockRuntime {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_image(self, tag: &str, id: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .images
            .push((tag.to_string(), id.to_string()));
        self
    }

    /// Makes every call of `op` (e.g. `"build_image"`), or of `op` against
    /// one target (`"stop_container:abcd"`), fail.
    pub fn fail(&self, op: &str) {
        self.inner.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn add_container(&self, name: &str, state: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("{:04x}{}", inner.next_id, "f".repeat(60));
        inner.containers.push(ContainerRecord {
            id: id.clone(),
            name: name.to_string(),
            host: self.endpoint.clone(),
            image: "image".into(),
            state: state.to_string(),
            status: state.to_string(),
        });
        id
    }

    pub fn set_state(&self, name: &str, state: &str) {
        let mut inner = self.inner.lock().unwrap();
        for c in inner.containers.iter_mut().filter(|c| c.name == name) {
            c.state = state.to_string();
            c.status = state.to_string();
        }
    }

    pub fn set_logs(&self, name_or_id: &str, logs: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .logs
            .insert(name_or_id.to_string(), logs.to_vec());
    }

    pub fn set_archive(&self, id: &str, archive: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .archives
            .insert(id.to_string(), archive);
    }

    pub fn containers(&self) -> Vec<ContainerRecord> {
        self.inner.lock().unwrap().containers.clone()
    }

    pub fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.inner.lock().unwrap().specs.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, op: &str, target: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let call = format!("{}:{}", op, target);
        inner.calls.push(call.clone());
        if inner.failing.contains(op) || inner.failing.contains(&call) {
            return Err(ComposerError::Task(format!("{} failed on {}", call, self.endpoint)));
        }
        Ok(())
    }

    fn resolve(&self, name_or_id: &str) -> Result<ContainerRecord> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.id == name_or_id || c.name == name_or_id)
            .cloned()
            .ok_or_else(|| ComposerError::NotFound(format!("container '{}'", name_or_id)))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping", "")
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.record("list_containers", "")?;
        Ok(self.containers())
    }

    async fn container_env(&self, id: &str) -> Result<Vec<String>> {
        self.record("container_env", id)?;
        let c = self.resolve(id)?;
        Ok(self.spec(&c.name).map(|s| s.env).unwrap_or_default())
    }

    async fn find_image(&self, reference: &str) -> Result<Option<String>> {
        self.record("find_image", reference)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .images
            .iter()
            .find(|(tag, _)| tag.contains(reference))
            .map(|(_, id)| id.clone()))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.record("pull_image", reference)?;
        let tag = reference.rsplit('/').next().unwrap_or(reference).to_string();
        self.inner
            .lock()
            .unwrap()
            .images
            .push((tag, format!("sha256:{}", reference)));
        Ok(())
    }

    async fn build_image(&self, context: Vec<u8>, dockerfile: &str, tag: &str) -> Result<()> {
        self.record("build_image", dockerfile)?;
        if context.is_empty() {
            return Err(ComposerError::Task("empty build context".into()));
        }
        self.inner
            .lock()
            .unwrap()
            .images
            .push((tag.to_string(), format!("sha256:{}", tag)));
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.record("remove_image", id)?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.images.len();
        inner.images.retain(|(_, i)| i != id);
        if inner.images.len() == before {
            return Err(ComposerError::NotFound(format!("image '{}'", id)));
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        self.record("create_container", name)?;
        if self.resolve(name).is_ok() {
            return Err(ComposerError::Task(format!("name '{}' already in use", name)));
        }
        let id = self.add_container(name, "created");
        self.inner
            .lock()
            .unwrap()
            .specs
            .insert(name.to_string(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let c = self.resolve(id)?;
        self.record("start_container", &c.name)?;
        self.set_state(&c.name, STATE_RUNNING);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<()> {
        let c = self.resolve(id)?;
        self.record("wait_container", &c.name)?;
        self.set_state(&c.name, "exited");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let c = self.resolve(id)?;
        self.record("stop_container", &c.name)?;
        self.set_state(&c.name, "exited");
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let c = self.resolve(id)?;
        self.record("remove_container", &c.name)?;
        self.inner
            .lock()
            .unwrap()
            .containers
            .retain(|other| other.id != c.id);
        Ok(())
    }

    async fn logs(&self, id: &str, _options: &LogOptions, _stderr: bool) -> Result<Vec<u8>> {
        let c = self.resolve(id)?;
        self.record("logs", &c.name)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .logs
            .get(&c.name)
            .or_else(|| inner.logs.get(&c.id))
            .cloned()
            .unwrap_or_default())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let c = self.resolve(id)?;
        self.record("copy_from_container", &c.name)?;
        self.inner
            .lock()
            .unwrap()
            .archives
            .get(&c.id)
            .cloned()
            .ok_or_else(|| ComposerError::NotFound(format!("'{}' in '{}'", path, id)))
    }
}
