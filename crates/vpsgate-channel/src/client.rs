use crate::dispatch;
use crate::frames::{Frame, PushLeasesRequest};
use crate::registry::{unique_urls, InstanceRegistry};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpsgate_core::config::ChannelSettings;
use vpsgate_core::error::{Error, Result};
use vpsgate_core::metrics::names;
use vpsgate_dhcp::DhcpManager;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const METRICS_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const LEASE_PUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Maintains one long-lived stream per unique API URL, answers inbound
/// RPCs, and pushes telemetry. Per-instance failures are isolated: a dead
/// stream backs off and reconnects without touching its siblings.
pub struct ChannelClient {
    manager: Arc<DhcpManager>,
    settings: ChannelSettings,
    registry: Option<Arc<dyn InstanceRegistry>>,
    metrics: Option<PrometheusHandle>,
}

struct ConnectionHandle {
    stop: watch::Sender<bool>,
}

impl ChannelClient {
    pub fn new(manager: Arc<DhcpManager>, settings: ChannelSettings) -> Self {
        Self {
            manager,
            settings,
            registry: None,
            metrics: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Discovery loop: every 10 s, reconcile the set of connection tasks
    /// against the registry's current instance list.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tokio::time::sleep(self.settings.client_init_delay).await;

        let this = Arc::new(self);
        let mut connections: HashMap<String, ConnectionHandle> = HashMap::new();
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        info!("control-channel client started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let urls = this.discover().await;

                    for url in &urls {
                        if !connections.contains_key(url) {
                            info!(%url, "opening control channel");
                            let (stop_tx, stop_rx) = watch::channel(false);
                            tokio::spawn(Self::run_connection(this.clone(), url.clone(), stop_rx));
                            connections.insert(url.clone(), ConnectionHandle { stop: stop_tx });
                        }
                    }

                    connections.retain(|url, handle| {
                        if urls.contains(url) {
                            true
                        } else {
                            info!(%url, "instance gone from registry, closing channel");
                            let _ = handle.stop.send(true);
                            false
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("control-channel client shutting down");
                        break;
                    }
                }
            }
        }

        for handle in connections.values() {
            let _ = handle.stop.send(true);
        }
        Ok(())
    }

    /// Current set of unique stream URLs: the registry when it answers with
    /// entries, the fallback URL otherwise.
    async fn discover(&self) -> Vec<String> {
        if let Some(registry) = &self.registry {
            match registry.list_instances().await {
                Ok(instances) if !instances.is_empty() => {
                    return unique_urls(&instances)
                        .into_iter()
                        .map(|url| ws_url(&url))
                        .collect();
                }
                Ok(_) => debug!("registry empty, using fallback URL"),
                Err(e) => warn!(error = %e, "registry unavailable, using fallback URL"),
            }
        }
        vec![ws_url(&self.settings.api_url)]
    }

    /// Connection loop for one URL: serve the stream until it breaks, then
    /// back off and reconnect with a fresh child context.
    pub async fn run_connection(this: Arc<Self>, url: String, stop: watch::Receiver<bool>) {
        let mut stop = stop;
        loop {
            if *stop.borrow() {
                break;
            }
            match Self::connect_and_serve(&this, &url, stop.clone()).await {
                Ok(()) => info!(%url, "control stream closed"),
                Err(e) => warn!(%url, error = %e, "control stream failed"),
            }
            this.report_status(&url, false).await;

            if *stop.borrow() {
                break;
            }
            counter!(names::CHANNEL_RECONNECTS).increment(1);
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = stop.changed() => {}
            }
        }
    }

    async fn connect_and_serve(
        this: &Arc<Self>,
        url: &str,
        stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::StreamBroken(format!("{url}: {e}")))?;
        request.headers_mut().insert(
            "x-gateway-secret",
            HeaderValue::from_str(&this.settings.api_secret)
                .map_err(|_| Error::Config("API secret is not header-safe".into()))?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| Error::StreamBroken(format!("connect {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        // Single-writer discipline: every sender posts to this mailbox and
        // one task owns the sink.
        let (tx, mut rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (senders_stop, _) = watch::channel(false);
        let mut registered = false;

        send_frame(&tx, &this.register_frame()).await?;

        let mut stop = stop;
        let outcome = loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        None => break Err(Error::StreamBroken(format!("{url}: EOF"))),
                        Some(Err(e)) => break Err(Error::StreamBroken(format!("{url}: {e}"))),
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = Self::handle_frame(
                                this,
                                url,
                                text.as_str(),
                                &tx,
                                &senders_stop,
                                &mut registered,
                            )
                            .await
                            {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) => break Ok(()),
                        Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        let _ = senders_stop.send(true);
        drop(tx);
        writer.abort();
        outcome
    }

    async fn handle_frame(
        this: &Arc<Self>,
        url: &str,
        text: &str,
        tx: &mpsc::Sender<Message>,
        senders_stop: &watch::Sender<bool>,
        registered: &mut bool,
    ) -> Result<()> {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(url, error = %e, "undecodable frame");
                return Ok(());
            }
        };

        match frame {
            Frame::Registered { node_name } => {
                if let Some(name) = node_name {
                    this.manager.set_node_name(&name);
                }
                if !*registered {
                    *registered = true;
                    info!(url, node_name = ?this.manager.identity().node_name(), "registered with API");
                    this.report_status(url, true).await;
                    Self::spawn_senders(this, tx.clone(), senders_stop.subscribe());
                }
                Ok(())
            }
            Frame::Request {
                request_id,
                method,
                payload,
            } => {
                let this = this.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = dispatch::dispatch(
                        &this.manager,
                        &method,
                        &payload,
                        this.settings.api_call_timeout,
                    )
                    .await;
                    let response = Frame::Response {
                        request_id,
                        success: outcome.success,
                        payload: outcome.payload,
                        error: outcome.error,
                    };
                    if let Err(e) = send_frame(&tx, &response).await {
                        warn!(error = %e, "failed to send response");
                    }
                });
                Ok(())
            }
            Frame::Response { request_id, success, error, .. } => {
                // Ack for an outbound push.
                if !success {
                    warn!(url, %request_id, error = ?error, "push rejected by API");
                }
                Ok(())
            }
            other => {
                debug!(url, frame = ?other, "ignoring unexpected frame");
                Ok(())
            }
        }
    }

    /// The three fire-and-forget siblings sharing this stream's mailbox.
    fn spawn_senders(this: &Arc<Self>, tx: mpsc::Sender<Message>, stop: watch::Receiver<bool>) {
        // Metrics, Prometheus text format.
        {
            let this = this.clone();
            let tx = tx.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(METRICS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let Some(handle) = &this.metrics else { continue };
                            let frame = Frame::Metrics { prom_text: handle.render() };
                            if send_frame(&tx, &frame).await.is_err() {
                                break;
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() { break; }
                        }
                    }
                }
            });
        }

        // Heartbeat.
        {
            let tx = tx.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let frame = Frame::Heartbeat { timestamp: chrono::Utc::now() };
                            if send_frame(&tx, &frame).await.is_err() {
                                break;
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() { break; }
                        }
                    }
                }
            });
        }

        // Lease snapshot, so the database can reconcile against the
        // daemon's view.
        {
            let this = this.clone();
            let mut stop = stop;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(LEASE_PUSH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let leases = match this.manager.get_active_leases().await {
                                Ok(leases) => leases,
                                Err(e) => {
                                    warn!(error = %e, "lease snapshot failed");
                                    continue;
                                }
                            };
                            let push = PushLeasesRequest {
                                gateway_id: this.manager.identity().gateway_id().to_string(),
                                leases,
                            };
                            let payload = match serde_json::to_value(&push) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    error!(error = %e, "lease snapshot encode failed");
                                    continue;
                                }
                            };
                            let frame = Frame::Request {
                                request_id: Uuid::new_v4().to_string(),
                                method: "PushLeases".to_string(),
                                payload,
                            };
                            if send_frame(&tx, &frame).await.is_err() {
                                break;
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() { break; }
                        }
                    }
                }
            });
        }
    }

    fn register_frame(&self) -> Frame {
        let dhcp = self.manager.get_config();
        Frame::Register {
            gateway_id: self.manager.identity().gateway_id().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gateway_ip: dhcp.gateway_ip,
            dhcp_pool_start: dhcp.pool_start,
            dhcp_pool_end: dhcp.pool_end,
            subnet_mask: dhcp.subnet_mask,
            gateway_ip_dhcp: dhcp.listen_ip.unwrap_or(dhcp.gateway_ip),
        }
    }

    async fn report_status(&self, url: &str, connected: bool) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry
                .report_status(self.manager.identity().gateway_id(), url, connected)
                .await
            {
                debug!(url, error = %e, "status report failed");
            }
        }
    }
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &Frame) -> Result<()> {
    let json = frame
        .to_json()
        .map_err(|e| Error::StreamBroken(format!("encode: {e}")))?;
    tx.send(Message::Text(json.into()))
        .await
        .map_err(|_| Error::StreamBroken("writer gone".into()))
}

/// The API URL may be configured with an http(s) scheme; the stream always
/// speaks ws(s).
fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        url.to_string()
    }
}
