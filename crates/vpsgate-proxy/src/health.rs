use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpsgate_core::metrics::names;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(3);
/// Gap between samples, to land on different replicas behind a load
/// balancer.
const SAMPLE_DELAY: Duration = Duration::from_millis(100);
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// A replica unseen for this long is dropped.
pub fn replica_stale_after() -> chrono::Duration {
    chrono::Duration::minutes(2)
}

/// How many health samples to take for a backend with `known` tracked
/// replicas.
pub fn sample_count(known: usize) -> usize {
    (known + 2).clamp(3, 10)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub healthy: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub replicas: HashMap<String, ReplicaStatus>,
}

impl ServiceHealth {
    /// A service is healthy when any tracked replica is; with none tracked
    /// it is optimistically healthy so cold-start traffic can route.
    fn recompute(&mut self) {
        self.healthy = self.replicas.is_empty() || self.replicas.values().any(|r| r.healthy);
    }
}

/// One `/health` probe observation.
#[derive(Debug)]
pub struct SampleResult {
    /// The request completed with HTTP 200 or 503.
    pub ok: bool,
    pub replica_id: Option<String>,
    pub healthy: bool,
}

/// Shared per-backend health state. The checker takes the write path when
/// merging discovered replicas; request routing takes the read path.
pub struct HealthRegistry {
    services: RwLock<HashMap<String, ServiceHealth>>,
    initialized: AtomicBool,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub async fn replica_count(&self, url: &str) -> usize {
        let services = self.services.read().await;
        services.get(url).map(|s| s.replicas.len()).unwrap_or(0)
    }

    /// `(healthy, replica_count)` for the routing decision. An untracked
    /// backend is optimistically healthy.
    pub async fn routing_view(&self, url: &str) -> (bool, usize) {
        let services = self.services.read().await;
        services
            .get(url)
            .map(|s| (s.healthy, s.replicas.len()))
            .unwrap_or((true, 0))
    }

    /// Merge one round of samples into the backend's replica map and
    /// recompute its health.
    pub async fn apply_samples(&self, url: &str, samples: &[SampleResult]) {
        let now = Utc::now();
        let mut services = self.services.write().await;
        let service = services.entry(url.to_string()).or_default();
        let was_healthy = service.healthy || service.replicas.is_empty();

        let mut real_ids = 0usize;
        let mut successes = 0usize;
        for sample in samples {
            if sample.ok {
                successes += 1;
            }
            if let Some(id) = &sample.replica_id {
                real_ids += 1;
                service.replicas.insert(
                    id.clone(),
                    ReplicaStatus {
                        healthy: sample.healthy,
                        last_seen: now,
                    },
                );
            }
        }

        // Older backends answer without a replica id; tolerate them by
        // synthesizing one so the service still counts as healthy. The
        // pruner retires these once the backend goes quiet.
        if successes > 0 && real_ids == 0 {
            let synthetic = format!("unidentified-{}", Uuid::new_v4());
            service.replicas.insert(
                synthetic,
                ReplicaStatus {
                    healthy: true,
                    last_seen: now,
                },
            );
        }

        service.recompute();
        if service.healthy != was_healthy {
            counter!(names::HEALTH_TRANSITIONS).increment(1);
            if service.healthy {
                info!(url, "backend recovered");
            } else {
                warn!(url, "backend unhealthy");
            }
        }
    }

    /// Drop replicas unseen since `cutoff` and recompute health. Returns
    /// the number removed.
    pub async fn prune_stale(&self, cutoff: DateTime<Utc>) -> usize {
        let mut services = self.services.write().await;
        let mut removed = 0;
        for service in services.values_mut() {
            let before = service.replicas.len();
            service.replicas.retain(|_, r| r.last_seen >= cutoff);
            removed += before - service.replicas.len();
            service.recompute();
        }
        removed
    }

    pub async fn detailed_report(&self) -> Option<DetailedReport> {
        if !self.is_initialized() {
            return None;
        }

        let services = self.services.read().await;
        let mut healthy_backends = Vec::new();
        let mut unhealthy_backends = Vec::new();
        let mut report_services = HashMap::new();

        for (url, service) in services.iter() {
            if service.healthy {
                healthy_backends.push(url.clone());
            } else {
                unhealthy_backends.push(url.clone());
            }
            report_services.insert(
                url.clone(),
                ServiceReport {
                    healthy: service.healthy,
                    replica_count: service.replicas.len(),
                    replicas: service.replicas.clone(),
                },
            );
        }
        healthy_backends.sort();
        unhealthy_backends.sort();

        let all_healthy = unhealthy_backends.is_empty();
        Some(DetailedReport {
            status: if all_healthy { "healthy" } else { "degraded" }.to_string(),
            service: "api-gateway".to_string(),
            all_backends_healthy: all_healthy,
            total_backends: services.len(),
            healthy_backends,
            unhealthy_backends,
            services: report_services,
        })
    }
}

#[derive(Serialize)]
pub struct DetailedReport {
    pub status: String,
    pub service: String,
    pub all_backends_healthy: bool,
    pub healthy_backends: Vec<String>,
    pub unhealthy_backends: Vec<String>,
    pub total_backends: usize,
    pub services: HashMap<String, ServiceReport>,
}

#[derive(Serialize)]
pub struct ServiceReport {
    pub healthy: bool,
    pub replica_count: usize,
    pub replicas: HashMap<String, ReplicaStatus>,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
    #[allow(dead_code)]
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    replica_id: Option<String>,
}

/// Background sampler: every 10 s, probe each backend's `/health` with a
/// replica-count-scaled number of samples.
pub struct HealthChecker {
    registry: Arc<HealthRegistry>,
    backends: Vec<String>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(registry: Arc<HealthRegistry>, backends: Vec<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SAMPLE_TIMEOUT)
            .build()?;
        Ok(Self {
            registry,
            backends,
            client,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(backends = self.backends.len(), "health checker started");
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for url in &self.backends {
                        self.check_backend(url).await;
                    }
                    self.registry.mark_initialized();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_backend(&self, url: &str) {
        let count = sample_count(self.registry.replica_count(url).await);
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            samples.push(self.sample(url).await);
            if i + 1 < count {
                tokio::time::sleep(SAMPLE_DELAY).await;
            }
        }
        debug!(url, samples = samples.len(), "health samples collected");
        self.registry.apply_samples(url, &samples).await;
    }

    async fn sample(&self, url: &str) -> SampleResult {
        let endpoint = format!("{}/health", url.trim_end_matches('/'));
        let response = match self.client.get(&endpoint).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "health sample failed");
                return SampleResult {
                    ok: false,
                    replica_id: None,
                    healthy: false,
                };
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return SampleResult {
                ok: false,
                replica_id: None,
                healthy: false,
            };
        }

        let body: Option<HealthBody> = response.json().await.ok();
        SampleResult {
            ok: true,
            replica_id: body.as_ref().and_then(|b| b.replica_id.clone()),
            healthy: status == reqwest::StatusCode::OK
                && body.map(|b| b.status == "healthy").unwrap_or(true),
        }
    }
}

/// Separate slow task dropping replicas unseen for over two minutes.
pub async fn run_pruner(
    registry: Arc<HealthRegistry>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut shutdown = shutdown;
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = registry.prune_stale(Utc::now() - replica_stale_after()).await;
                if removed > 0 {
                    info!(removed, "pruned stale replicas");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}
