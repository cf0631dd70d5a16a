use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use vpsgate_core::error::{Error, Result};

/// One API instance as registered in the shared key/value registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiInstance {
    pub id: String,
    pub url: String,
}

/// Out-of-band discovery of API instances plus connection-status
/// reporting.
#[async_trait]
pub trait InstanceRegistry: Send + Sync + 'static {
    async fn list_instances(&self) -> Result<Vec<ApiInstance>>;

    async fn report_status(&self, gateway_id: &str, api_url: &str, connected: bool) -> Result<()>;
}

/// Registry reached over HTTP.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    api_url: &'a str,
    connected: bool,
    updated_at: chrono::DateTime<Utc>,
}

impl HttpRegistry {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }
}

#[async_trait]
impl InstanceRegistry for HttpRegistry {
    async fn list_instances(&self) -> Result<Vec<ApiInstance>> {
        let url = format!("{}/instances", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-gateway-secret", &self.secret)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))
    }

    async fn report_status(&self, gateway_id: &str, api_url: &str, connected: bool) -> Result<()> {
        let url = format!("{}/gateways/{gateway_id}/status", self.base_url);
        self.client
            .put(&url)
            .header("x-gateway-secret", &self.secret)
            .json(&StatusReport {
                api_url,
                connected,
                updated_at: Utc::now(),
            })
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))?;
        Ok(())
    }
}

/// Collapse registry entries to the set of unique stream URLs. Multiple
/// instances often register the same virtual service address; one stream
/// per URL is enough.
pub fn unique_urls(instances: &[ApiInstance]) -> Vec<String> {
    let mut seen = HashSet::new();
    instances
        .iter()
        .map(|i| i.url.trim_end_matches('/').to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
