use crate::frames::{
    AllocateIpRequest, AllocateIpResponse, GatewayInfoResponse, ListIpsRequest, ListIpsResponse,
    ReleaseIpRequest,
};
use metrics::counter;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vpsgate_core::error::{Error, Result};
use vpsgate_core::metrics::names;
use vpsgate_dhcp::DhcpManager;

/// Outcome of one inbound request, ready to be wrapped in a `response`
/// frame.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub success: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload,
            error: None,
        }
    }

    fn err(e: &Error) -> Self {
        Self {
            success: false,
            payload: serde_json::Value::Null,
            error: Some(format!("{}: {e}", e.kind())),
        }
    }
}

/// Decode and execute one inbound method against the DHCP manager,
/// bounded by the per-method timeout.
pub async fn dispatch(
    manager: &Arc<DhcpManager>,
    method: &str,
    payload: &serde_json::Value,
    timeout: Duration,
) -> DispatchOutcome {
    counter!(names::CHANNEL_REQUESTS).increment(1);
    debug!(method, "dispatching inbound request");

    let result = tokio::time::timeout(timeout, run_method(manager, method, payload)).await;
    match result {
        Ok(Ok(payload)) => DispatchOutcome::ok(payload),
        Ok(Err(e)) => DispatchOutcome::err(&e),
        Err(_) => DispatchOutcome::err(&Error::TransientIo(format!(
            "method {method} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

async fn run_method(
    manager: &Arc<DhcpManager>,
    method: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value> {
    match method {
        "AllocateIP" => {
            let request: AllocateIpRequest = decode(payload)?;
            let preferred_ip = request
                .preferred_ip
                .as_deref()
                .map(parse_ip)
                .transpose()?;
            let allocation = manager
                .allocate(
                    &request.vps_id,
                    &request.organization_id,
                    &request.mac_address,
                    preferred_ip,
                    request.allow_public_ip,
                )
                .await?;
            Ok(serde_json::to_value(AllocateIpResponse { allocation })?)
        }
        "ReleaseIP" => {
            let request: ReleaseIpRequest = decode(payload)?;
            let ip = request.ip.as_deref().map(parse_ip).transpose()?;
            manager.release(&request.vps_id, ip).await?;
            Ok(serde_json::json!({ "released": true }))
        }
        "ListIPs" => {
            let request: ListIpsRequest = decode(payload)?;
            let allocations = manager
                .list(request.organization_id.as_deref(), request.vps_id.as_deref())
                .await?;
            Ok(serde_json::to_value(ListIpsResponse { allocations })?)
        }
        "GetGatewayInfo" => {
            let settings = manager.get_config();
            let info = GatewayInfoResponse {
                gateway_id: manager.identity().gateway_id().to_string(),
                node_name: manager.identity().node_name().map(String::from),
                version: env!("CARGO_PKG_VERSION").to_string(),
                pool_start: settings.pool_start,
                pool_end: settings.pool_end,
                subnet_mask: settings.subnet_mask,
                gateway_ip: settings.gateway_ip,
                stats: manager.get_stats().await,
            };
            Ok(serde_json::to_value(info)?)
        }
        other => Err(Error::InvalidInput(format!("unknown method: {other}"))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidInput(format!("bad payload: {e}")))
}

fn parse_ip(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::InvalidIp(value.to_string()))
}
