use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use vpsgate_core::types::{Allocation, LeaseInfo};

/// One control-channel frame. Each WebSocket text message carries exactly
/// one frame; method payloads ride inside `request`/`response` as opaque
/// JSON values keyed by the method name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register {
        gateway_id: String,
        version: String,
        gateway_ip: Ipv4Addr,
        dhcp_pool_start: Ipv4Addr,
        dhcp_pool_end: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        gateway_ip_dhcp: Ipv4Addr,
    },
    Registered {
        #[serde(default)]
        node_name: Option<String>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Metrics {
        prom_text: String,
    },
    Request {
        request_id: String,
        method: String,
        payload: serde_json::Value,
    },
    Response {
        request_id: String,
        success: bool,
        payload: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl Frame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// --- Method payloads ---

#[derive(Debug, Deserialize)]
pub struct AllocateIpRequest {
    pub vps_id: String,
    pub organization_id: String,
    pub mac_address: String,
    #[serde(default)]
    pub preferred_ip: Option<String>,
    #[serde(default)]
    pub allow_public_ip: bool,
}

#[derive(Debug, Serialize)]
pub struct AllocateIpResponse {
    pub allocation: Allocation,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseIpRequest {
    pub vps_id: String,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListIpsRequest {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub vps_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListIpsResponse {
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Serialize)]
pub struct GatewayInfoResponse {
    pub gateway_id: String,
    pub node_name: Option<String>,
    pub version: String,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub stats: vpsgate_dhcp::DhcpStats,
}

/// Outbound lease snapshot, pushed on a fixed cadence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushLeasesRequest {
    pub gateway_id: String,
    pub leases: Vec<LeaseInfo>,
}
