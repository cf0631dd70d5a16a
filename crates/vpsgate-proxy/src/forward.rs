use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use std::time::Duration;
use tracing::{debug, warn};
use vpsgate_core::metrics::names;

/// End-to-end budget for one forwarded request.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest request body the proxy will buffer.
const MAX_FORWARD_BODY: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: [&str; 5] = ["connection", "upgrade", "transfer-encoding", "te", "trailer"];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Headers to send upstream: everything except the hop-by-hop set and
/// `Host`, which the HTTP client resets to the target.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to relay back: hop-by-hop dropped, backend CORS headers dropped
/// so the middleware in front applies the single policy.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || lower.starts_with("access-control-") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Forward one request to `upstream`, copying method, body, and filtered
/// headers.
pub async fn forward(client: &reqwest::Client, upstream: &str, request: Request) -> Response {
    let path_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{upstream}{path_query}");
    let method = request.method().clone();
    let headers = filter_request_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_FORWARD_BODY).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read request body")
                .into_response();
        }
    };

    debug!(%method, %url, "forwarding");
    let result = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let headers = filter_response_headers(upstream_response.headers());
            let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) if e.is_builder() => {
            warn!(%url, error = %e, "invalid upstream target");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("invalid upstream target: {e}"))
                .into_response()
        }
        Err(e) => {
            counter!(names::PROXY_UPSTREAM_ERRORS).increment(1);
            warn!(%url, error = %e, "upstream unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, format!("upstream unavailable: {e}"))
                .into_response()
        }
    }
}
