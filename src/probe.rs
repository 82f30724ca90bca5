//! Node status probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{ComposerError, Result};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the status document a running node serves at its endpoint.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn get(&self, endpoint: &str) -> Result<Vec<u8>>;
}

/// Plain HTTPS GET.  Nodes use self-signed certificates, so certificate
/// validation is off.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ComposerError::Probe(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusProbe for HttpProbe {
    async fn get(&self, endpoint: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| ComposerError::Probe(format!("{}: {}", endpoint, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ComposerError::Probe(format!("{}: status {}", endpoint, status)));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ComposerError::Probe(format!("{}: {}", endpoint, e)))?;
        Ok(body.to_vec())
    }
}

/// Probes every endpoint concurrently.  Bodies are returned as compact JSON.
pub async fn probe_all(
    probe: Arc<dyn StatusProbe>,
    endpoints: Vec<String>,
    dispatcher: &Dispatcher,
) -> Outcome<String, String> {
    let outcome = dispatcher
        .dispatch(endpoints, move |endpoint: String| {
            let probe = probe.clone();
            async move {
                let body = probe.get(&endpoint).await?;
                let doc: serde_json::Value = serde_json::from_slice(&body)
                    .map_err(|e| ComposerError::Probe(format!("{}: invalid json: {}", endpoint, e)))?;
                Ok(doc.to_string())
            }
        })
        .await;
    outcome.log_failures("probe node");
    outcome
}
