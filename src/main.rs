use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vpsgate_channel::{ChannelClient, HttpRegistry, InstanceRegistry};
use vpsgate_core::config::GatewayConfig;
use vpsgate_core::store::Store;
use vpsgate_core::types::GatewayIdentity;
use vpsgate_dhcp::{DhcpManager, DnsmasqDaemon, Reconciler};
use vpsgate_dns::delegation::{self, DelegationState};
use vpsgate_dns::directory::HttpDirectory;
use vpsgate_dns::{DnsServer, Resolver};
use vpsgate_proxy::health::{self, HealthChecker, HealthRegistry};
use vpsgate_proxy::routes::RouteTable;
use vpsgate_proxy::ProxyServer;

#[derive(Parser)]
#[command(
    name = "vpsgate",
    about = "VPS network gateway - DHCP allocation, authoritative DNS, and API reverse proxy"
)]
struct Cli {
    /// Override LOG_LEVEL from the environment
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;

    init_logging(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    let identity = Arc::new(GatewayIdentity::from_hostname());
    info!(
        gateway_id = identity.gateway_id(),
        zone = %config.dns.zone,
        pool_start = %config.dhcp.pool_start,
        pool_end = %config.dhcp.pool_end,
        "starting vpsgate"
    );

    let metrics_handle = match vpsgate_core::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let store = Store::open(&config.store_path).context("failed to open store")?;
    info!(path = %config.store_path.display(), "store opened");

    // The DHCP daemon must be up before anything is served; a failed start
    // is fatal.
    let daemon = Arc::new(DnsmasqDaemon::new(config.dhcp.clone(), config.dns.zone.clone()));
    daemon
        .start()
        .await
        .context("DHCP daemon failed to start")?;

    let manager = Arc::new(
        DhcpManager::new(config.dhcp.clone(), identity.clone()).with_daemon(daemon.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Daemon supervision
    {
        let daemon = daemon.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = daemon.monitor(rx).await {
                error!("daemon monitor error: {e}");
            }
        }));
    }

    // Background reconciler
    {
        let reconciler = Reconciler::new(manager.clone());
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = reconciler.run(rx).await {
                error!("reconciler error: {e}");
            }
        }));
    }

    // Authoritative DNS
    {
        let directory = HttpDirectory::new(
            &http_url(&config.channel.api_url),
            &config.channel.api_secret,
            config.channel.api_call_timeout,
        )
        .context("directory client")?;
        let resolver = Arc::new(Resolver::new(
            Arc::new(directory),
            store.clone(),
            &config.dns.managed_suffix(),
        ));
        let server = DnsServer::new(config.dns.listen, resolver);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(rx).await {
                error!("DNS server error: {e}");
            }
        }));
    }

    // Delegation push API + cleanup
    {
        let state = DelegationState {
            store: store.clone(),
            suffix: config.dns.managed_suffix(),
        };
        let listen = config.dns.delegation_listen;
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let app = delegation::router(state);
            let listener = match tokio::net::TcpListener::bind(listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("delegation API bind failed: {e}");
                    return;
                }
            };
            info!("delegation API listening on {listen}");
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = serve.await {
                error!("delegation API error: {e}");
            }
        }));

        let rx = shutdown_rx.clone();
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = delegation::run_cleanup(store, rx).await {
                error!("delegation cleanup error: {e}");
            }
        }));
    }

    // Reverse proxy + health checking
    {
        let routes = RouteTable::new(config.proxy.routes.clone());
        let registry = Arc::new(HealthRegistry::new());

        if routes.is_empty() {
            warn!("no proxy routes configured");
        } else {
            let checker = HealthChecker::new(registry.clone(), routes.upstreams())
                .context("health checker")?;
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = checker.run(rx).await {
                    error!("health checker error: {e}");
                }
            }));

            let rx = shutdown_rx.clone();
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = health::run_pruner(registry, rx).await {
                    error!("health pruner error: {e}");
                }
            }));
        }

        let proxy = ProxyServer::new(config.proxy.listen, routes, registry)
            .context("reverse proxy")?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = proxy.run(rx).await {
                error!("reverse proxy error: {e}");
            }
        }));
    }

    // Control-channel client
    {
        let mut client = ChannelClient::new(manager.clone(), config.channel.clone());
        if let Some(registry_url) = &config.channel.registry_url {
            let registry = HttpRegistry::new(
                registry_url,
                &config.channel.api_secret,
                config.channel.api_call_timeout,
            )
            .context("registry client")?;
            client = client.with_registry(Arc::new(registry) as Arc<dyn InstanceRegistry>);
        }
        if let Some(handle) = metrics_handle {
            client = client.with_metrics(handle);
        }
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = client.run(rx).await {
                error!("control channel error: {e}");
            }
        }));
    }

    // One lease sync shortly after the channel client has had a chance to
    // attach, so the first PushLeases reflects reality.
    {
        let manager = manager.clone();
        let delay = config.channel.client_init_delay + std::time::Duration::from_secs(3);
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = manager.sync_with_leases().await {
                warn!("initial lease sync failed: {e}");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    daemon.stop().await;
    info!("vpsgate stopped");
    Ok(())
}

/// The directory and registry speak HTTP even when the channel URL is
/// configured with a ws(s) scheme.
fn http_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
