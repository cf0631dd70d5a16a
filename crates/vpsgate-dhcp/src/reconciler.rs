use crate::manager::DhcpManager;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use vpsgate_core::metrics::names;

/// Background task that aligns the allocation map, the daemon's lease
/// file, and TTL state on a fixed interval.
pub struct Reconciler {
    manager: Arc<DhcpManager>,
}

impl Reconciler {
    pub fn new(manager: Arc<DhcpManager>) -> Self {
        Self { manager }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let interval = self.manager.get_config().reconcile_interval;
        info!(interval_secs = interval.as_secs(), "reconciler started");

        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so the channel client
        // gets a quiet window to attach first.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One reconcile pass: defensive host rewrite, lease sync, TTL sweep.
    pub async fn run_pass(&self) {
        counter!(names::DHCP_RECONCILE_RUNS).increment(1);

        if let Err(e) = self.manager.sync_hosts_from_allocations().await {
            error!(error = %e, "host file sync failed");
        }
        if let Err(e) = self.manager.sync_with_leases().await {
            error!(error = %e, "lease sync failed");
        }
        match self.manager.sweep_expired().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "TTL sweep removed expired allocations"),
            Err(e) => error!(error = %e, "TTL sweep failed"),
        }
    }
}
