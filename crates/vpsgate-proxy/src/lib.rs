pub mod forward;
pub mod health;
pub mod routes;
pub mod ws;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use health::HealthRegistry;
use metrics::counter;
use routes::RouteTable;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use vpsgate_core::metrics::names;

/// Reverse proxy front-end: longest-prefix routing, WebSocket hijack, and
/// the health endpoints.
pub struct ProxyServer {
    listen_addr: SocketAddr,
    state: ProxyState,
}

#[derive(Clone)]
pub struct ProxyState {
    pub routes: Arc<RouteTable>,
    pub health: Arc<HealthRegistry>,
    pub client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(
        listen_addr: SocketAddr,
        routes: RouteTable,
        health: Arc<HealthRegistry>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(forward::FORWARD_TIMEOUT)
            .build()?;
        Ok(Self {
            listen_addr,
            state: ProxyState {
                routes: Arc::new(routes),
                health,
                client,
            },
        })
    }

    pub fn router(state: ProxyState) -> Router {
        // The single CORS policy; backend CORS headers are stripped in the
        // forwarder.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/detailed", get(detailed_health_handler))
            .fallback(proxy_handler)
            .layer(cors)
            .with_state(state)
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = Self::router(self.state);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("reverse proxy listening on {}", self.listen_addr);

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "service": "api-gateway" }))
}

async fn detailed_health_handler(State(state): State<ProxyState>) -> Response {
    match state.health.detailed_report().await {
        None => Json(serde_json::json!({
            "status": "initializing",
            "message": "health checks not yet initialized",
        }))
        .into_response(),
        Some(report) => {
            let code = if report.all_backends_healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, Json(report)).into_response()
        }
    }
}

async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(upstream) = state.routes.match_path(&path) else {
        return (StatusCode::NOT_FOUND, "no route").into_response();
    };

    // Degraded-serve policy: an unhealthy backend with tracked replicas is
    // still routed to.
    let (healthy, replica_count) = state.health.routing_view(upstream).await;
    if !healthy && replica_count > 0 {
        warn!(upstream, replica_count, "routing to unhealthy backend");
    }

    counter!(names::PROXY_FORWARDS).increment(1);
    if ws::wants_upgrade(request.headers()) {
        return ws::hijack(upstream, request).await;
    }
    forward::forward(&state.client, upstream, request).await
}
