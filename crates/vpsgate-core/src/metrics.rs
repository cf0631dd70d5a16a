use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Metric names used across the gateway.
pub mod names {
    pub const DHCP_ALLOCATIONS: &str = "vpsgate_dhcp_allocations_total";
    pub const DHCP_RELEASES: &str = "vpsgate_dhcp_releases_total";
    pub const DHCP_RECONCILE_RUNS: &str = "vpsgate_dhcp_reconcile_runs_total";
    pub const DHCP_STALE_PRUNED: &str = "vpsgate_dhcp_stale_pruned_total";
    pub const DNS_QUERIES: &str = "vpsgate_dns_queries_total";
    pub const DNS_ERRORS: &str = "vpsgate_dns_resolve_errors_total";
    pub const DELEGATION_PUSHES: &str = "vpsgate_dns_delegation_pushes_total";
    pub const CHANNEL_RECONNECTS: &str = "vpsgate_channel_reconnects_total";
    pub const CHANNEL_REQUESTS: &str = "vpsgate_channel_requests_total";
    pub const PROXY_FORWARDS: &str = "vpsgate_proxy_forwards_total";
    pub const PROXY_UPSTREAM_ERRORS: &str = "vpsgate_proxy_upstream_errors_total";
    pub const HEALTH_TRANSITIONS: &str = "vpsgate_health_transitions_total";
}

/// Install the process-wide Prometheus recorder. The returned handle renders
/// the scrape text pushed over the control channel.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
