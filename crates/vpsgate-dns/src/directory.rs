use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use vpsgate_core::error::{Error, Result};
use vpsgate_core::types::GameKind;

/// Resolved game-server location. `host` may be an IP literal or a
/// hostname that still needs a recursive lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct GameServerInfo {
    pub host: String,
    pub port: Option<u16>,
    pub game: GameKind,
}

/// Lookup interface over the authoritative database, reached through the
/// API instances. The DNS resolver consults this before the delegated
/// records table.
#[async_trait]
pub trait ResourceDirectory: Send + Sync + 'static {
    /// Where a game server runs, or `None` if it does not exist.
    async fn game_server(&self, id: &str) -> Result<Option<GameServerInfo>>;

    /// The front-end addresses of the region a deployment runs in, or
    /// `None` if the deployment does not exist.
    async fn deployment_frontends(&self, id: &str) -> Result<Option<Vec<String>>>;
}

/// Directory backed by the API's internal lookup endpoints.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

#[derive(Deserialize)]
struct DeploymentResponse {
    #[allow(dead_code)]
    region: String,
    frontend_ips: Vec<String>,
}

impl HttpDirectory {
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

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-internal-secret", &self.secret)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        let body = response
            .json::<T>()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("{url}: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl ResourceDirectory for HttpDirectory {
    async fn game_server(&self, id: &str) -> Result<Option<GameServerInfo>> {
        self.fetch(&format!("/internal/game-servers/{id}")).await
    }

    async fn deployment_frontends(&self, id: &str) -> Result<Option<Vec<String>>> {
        let found: Option<DeploymentResponse> =
            self.fetch(&format!("/internal/deployments/{id}")).await?;
        Ok(found.map(|d| d.frontend_ips))
    }
}
