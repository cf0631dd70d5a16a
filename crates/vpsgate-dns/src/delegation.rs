use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};
use vpsgate_core::metrics::names;
use vpsgate_core::store::Store;
use vpsgate_core::types::{DelegatedRecord, DelegatedRecordKind, DelegationKey};

/// How often expired delegated records are purged.
const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Clone)]
pub struct DelegationState {
    pub store: Store,
    /// Managed suffix, e.g. `my.example.com`.
    pub suffix: String,
}

pub fn router(state: DelegationState) -> Router {
    Router::new()
        .route("/dns/push", post(push_single))
        .route("/dns/push/batch", post(push_batch))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    domain: String,
    record_type: String,
    records: Vec<String>,
    ttl: u32,
}

#[derive(Serialize)]
struct PushResponse {
    success: bool,
    domain: String,
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    records: Vec<PushRequest>,
}

#[derive(Serialize)]
struct BatchResponse {
    success: bool,
    errors: Vec<String>,
    total: usize,
    success_count: usize,
}

/// Resolve the bearer key, refusing unauthenticated callers and delegation
/// chains before any state changes.
fn authenticate(state: &DelegationState, headers: &HeaderMap) -> Result<DelegationKey, Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            (StatusCode::UNAUTHORIZED, "missing delegation API key".to_string()).into_response()
        })?;

    let key = match state.store.validate_key(token) {
        Ok(Some(key)) => key,
        Ok(None) => {
            return Err(
                (StatusCode::FORBIDDEN, "invalid delegation API key".to_string()).into_response(),
            )
        }
        Err(e) => {
            error!(error = %e, "key lookup failed");
            return Err(
                (StatusCode::INTERNAL_SERVER_ERROR, "key lookup failed".to_string())
                    .into_response(),
            );
        }
    };

    match state.store.source_accepts_delegations(&key.source_api_id) {
        Ok(true) => Err((
            StatusCode::FORBIDDEN,
            format!("source API {} is itself a delegation target", key.source_api_id),
        )
            .into_response()),
        Ok(false) => Ok(key),
        Err(e) => {
            error!(error = %e, "chain check failed");
            Err(
                (StatusCode::INTERNAL_SERVER_ERROR, "chain check failed".to_string())
                    .into_response(),
            )
        }
    }
}

fn validate(state: &DelegationState, push: &PushRequest) -> Result<DelegatedRecordKind, String> {
    let domain = push.domain.trim_end_matches('.').to_lowercase();
    if domain != state.suffix && !domain.ends_with(&format!(".{}", state.suffix)) {
        return Err(format!("domain {} is outside zone {}", push.domain, state.suffix));
    }

    let kind: DelegatedRecordKind = push
        .record_type
        .parse()
        .map_err(|_| format!("unsupported record type: {}", push.record_type))?;

    if push.records.is_empty() {
        return Err("records array is empty".to_string());
    }
    if push.ttl == 0 {
        return Err("ttl must be positive".to_string());
    }

    Ok(kind)
}

fn upsert(
    state: &DelegationState,
    key: &DelegationKey,
    push: &PushRequest,
    kind: DelegatedRecordKind,
) -> Result<(), String> {
    let now = Utc::now();
    let record = DelegatedRecord {
        domain: push.domain.trim_end_matches('.').to_lowercase(),
        kind,
        records: push.records.clone(),
        ttl_seconds: push.ttl,
        source_api_id: key.source_api_id.clone(),
        api_key_id: key.id,
        organization_id: key.organization_id.clone(),
        expires_at: now + chrono::Duration::seconds(i64::from(push.ttl)),
        updated_at: now,
    };
    state
        .store
        .upsert_delegated(&record)
        .map_err(|e| format!("store write failed: {e}"))
}

async fn push_single(
    State(state): State<DelegationState>,
    headers: HeaderMap,
    Json(push): Json<PushRequest>,
) -> Response {
    let key = match authenticate(&state, &headers) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let kind = match validate(&state, &push) {
        Ok(kind) => kind,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    if let Err(message) = upsert(&state, &key, &push, kind) {
        error!(domain = %push.domain, "{message}");
        return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
    }

    counter!(names::DELEGATION_PUSHES).increment(1);
    info!(domain = %push.domain, kind = %kind, source = %key.source_api_id, "delegated record upserted");
    Json(PushResponse {
        success: true,
        domain: push.domain,
        record_type: kind.to_string(),
    })
    .into_response()
}

async fn push_batch(
    State(state): State<DelegationState>,
    headers: HeaderMap,
    Json(batch): Json<BatchRequest>,
) -> Response {
    let key = match authenticate(&state, &headers) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let total = batch.records.len();
    let mut errors = Vec::new();
    let mut success_count = 0usize;

    for (index, push) in batch.records.iter().enumerate() {
        let result = validate(&state, push).and_then(|kind| upsert(&state, &key, push, kind));
        match result {
            Ok(()) => success_count += 1,
            Err(message) => errors.push(format!("record {index} ({}): {message}", push.domain)),
        }
    }

    counter!(names::DELEGATION_PUSHES).increment(success_count as u64);
    Json(BatchResponse {
        success: errors.is_empty(),
        errors,
        total,
        success_count,
    })
    .into_response()
}

/// Background task pruning delegated records past their expiry.
pub async fn run_cleanup(store: Store, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut shutdown = shutdown;
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.purge_expired(Utc::now()) {
                    Ok(0) => {}
                    Ok(n) => info!("purged {n} expired delegated records"),
                    Err(e) => error!("delegated record cleanup error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("delegation cleanup shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_state() -> (DelegationState, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();

        let key = DelegationKey {
            id: Uuid::new_v4(),
            organization_id: "org-A".to_string(),
            source_api_id: "api-eu-1".to_string(),
            accepts_delegations: false,
            active: true,
            created_at: Utc::now(),
        };
        store.insert_key("good-token", &key).unwrap();

        let chained = DelegationKey {
            id: Uuid::new_v4(),
            organization_id: "org-B".to_string(),
            source_api_id: "api-chain".to_string(),
            accepts_delegations: true,
            active: true,
            created_at: Utc::now(),
        };
        store.insert_key("chain-token", &chained).unwrap();

        (
            DelegationState {
                store,
                suffix: "my.example.com".to_string(),
            },
            dir,
        )
    }

    fn push_body(domain: &str, record_type: &str, records: &[&str], ttl: u32) -> String {
        serde_json::json!({
            "domain": domain,
            "record_type": record_type,
            "records": records,
            "ttl": ttl,
        })
        .to_string()
    }

    async fn send(state: &DelegationState, uri: &str, token: Option<&str>, body: String) -> Response {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        router(state.clone())
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_key_is_401() {
        let (state, _dir) = test_state();
        let response = send(
            &state,
            "/dns/push",
            None,
            push_body("box.my.example.com", "A", &["203.0.113.5"], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_key_is_403() {
        let (state, _dir) = test_state();
        let response = send(
            &state,
            "/dns/push",
            Some("bogus"),
            push_body("box.my.example.com", "A", &["203.0.113.5"], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delegation_chain_is_403() {
        let (state, _dir) = test_state();
        let response = send(
            &state,
            "/dns/push",
            Some("chain-token"),
            push_body("box.my.example.com", "A", &["203.0.113.5"], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // No state change.
        assert!(state
            .store
            .get_delegated("box.my.example.com", DelegatedRecordKind::A)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_domain_outside_zone_is_400() {
        let (state, _dir) = test_state();
        let response = send(
            &state,
            "/dns/push",
            Some("good-token"),
            push_body("box.other.example.org", "A", &["203.0.113.5"], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state
            .store
            .get_delegated("box.other.example.org", DelegatedRecordKind::A)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_type_and_empty_records() {
        let (state, _dir) = test_state();

        let response = send(
            &state,
            "/dns/push",
            Some("good-token"),
            push_body("box.my.example.com", "MX", &["203.0.113.5"], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &state,
            "/dns/push",
            Some("good-token"),
            push_body("box.my.example.com", "A", &[], 60),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_then_repush_returns_latest() {
        let (state, _dir) = test_state();

        let response = send(
            &state,
            "/dns/push",
            Some("good-token"),
            push_body("box.my.example.com", "A", &["203.0.113.5"], 300),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &state,
            "/dns/push",
            Some("good-token"),
            push_body("box.my.example.com", "A", &["203.0.113.9"], 300),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["domain"], "box.my.example.com");
        assert_eq!(json["type"], "A");

        let stored = state
            .store
            .get_delegated("box.my.example.com", DelegatedRecordKind::A)
            .unwrap()
            .unwrap();
        assert_eq!(stored.records, vec!["203.0.113.9"]);
        assert_eq!(stored.source_api_id, "api-eu-1");
    }

    #[tokio::test]
    async fn test_batch_mixed_rows() {
        let (state, _dir) = test_state();
        let body = serde_json::json!({
            "records": [
                {"domain": "a.my.example.com", "record_type": "A", "records": ["203.0.113.5"], "ttl": 60},
                {"domain": "bad.example.org", "record_type": "A", "records": ["203.0.113.5"], "ttl": 60},
                {"domain": "b.my.example.com", "record_type": "SRV", "records": ["0 5 25565 mc.example.net"], "ttl": 60},
                {"domain": "c.my.example.com", "record_type": "TXT", "records": ["x"], "ttl": 60},
            ]
        })
        .to_string();

        let response = send(&state, "/dns/push/batch", Some("good-token"), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["total"], 4);
        assert_eq!(json["success_count"], 2);
        assert_eq!(json["success"], false);
        assert_eq!(json["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let (state, _dir) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/dns/push")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
