use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use uuid::Uuid;

/// A local record binding a VPS identifier to an IPv4 address and MAC.
///
/// Owned exclusively by the DHCP manager; every mutation happens under its
/// map mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub vps_id: String,
    pub organization_id: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub allocated_at: DateTime<Utc>,
    /// Expiry of the daemon lease backing this allocation. `None` until a
    /// lease row has been observed for it.
    pub lease_expires: Option<DateTime<Utc>>,
}

/// One unexpired row of the DHCP daemon's lease file. Never persisted;
/// recomputed on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub expires_at: DateTime<Utc>,
}

/// Record types accepted on the delegation push API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DelegatedRecordKind {
    A,
    SRV,
}

impl std::fmt::Display for DelegatedRecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegatedRecordKind::A => write!(f, "A"),
            DelegatedRecordKind::SRV => write!(f, "SRV"),
        }
    }
}

impl std::str::FromStr for DelegatedRecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "A" => Ok(DelegatedRecordKind::A),
            "SRV" => Ok(DelegatedRecordKind::SRV),
            _ => Err(Error::InvalidInput(format!("unknown record type: {s}"))),
        }
    }
}

/// A DNS record pushed by a federated self-hosted API instance.
/// Keyed by `(domain, kind)`; used as the fallback lookup source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedRecord {
    pub domain: String,
    pub kind: DelegatedRecordKind,
    pub records: Vec<String>,
    pub ttl_seconds: u32,
    pub source_api_id: String,
    pub api_key_id: Uuid,
    pub organization_id: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A per-organization API key authorizing delegation pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationKey {
    pub id: Uuid,
    pub organization_id: String,
    pub source_api_id: String,
    /// The source API itself accepts third-party delegations. Pushes from
    /// such a key would form a delegation chain and are refused.
    pub accepts_delegations: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Game kinds a `gs-` hostname can run, with their SRV service contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameKind {
    MinecraftJava,
    MinecraftBedrock,
    Rust,
    Valheim,
}

impl GameKind {
    /// The `(service, proto)` pair a SRV query must carry for this game.
    pub fn srv_service(&self) -> (&'static str, &'static str) {
        match self {
            GameKind::MinecraftJava => ("minecraft", "tcp"),
            GameKind::MinecraftBedrock => ("minecraft", "udp"),
            GameKind::Rust => ("rust", "udp"),
            GameKind::Valheim => ("valheim", "udp"),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            GameKind::MinecraftJava => 25565,
            GameKind::MinecraftBedrock => 19132,
            GameKind::Rust => 28015,
            GameKind::Valheim => 2456,
        }
    }

    /// Whether a SRV query's `_service._proto` labels are compatible with
    /// this game kind.
    pub fn matches_srv(&self, service: &str, proto: &str) -> bool {
        let (want_service, want_proto) = self.srv_service();
        service.eq_ignore_ascii_case(want_service) && proto.eq_ignore_ascii_case(want_proto)
    }
}

impl std::str::FromStr for GameKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minecraft" | "minecraft-java" => Ok(GameKind::MinecraftJava),
            "minecraft-bedrock" | "bedrock" => Ok(GameKind::MinecraftBedrock),
            "rust" => Ok(GameKind::Rust),
            "valheim" => Ok(GameKind::Valheim),
            _ => Err(Error::InvalidInput(format!("unknown game kind: {s}"))),
        }
    }
}

/// Process-wide gateway identity: a hostname-derived id plus a node name
/// learned from the first control-channel registration and immutable until
/// restart.
#[derive(Debug)]
pub struct GatewayIdentity {
    gateway_id: String,
    node_name: OnceLock<String>,
}

impl GatewayIdentity {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            node_name: OnceLock::new(),
        }
    }

    /// Derive the identity from the host name, as `gw-<hostname>`.
    pub fn from_hostname() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(format!("gw-{host}"))
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Record the node name assigned by the API. First write wins; repeated
    /// identical writes are idempotent, conflicting writes are ignored.
    pub fn set_node_name(&self, name: &str) {
        if let Some(existing) = self.node_name.get() {
            if existing != name {
                tracing::warn!(
                    existing = %existing,
                    requested = %name,
                    "ignoring node name change; immutable until restart"
                );
            }
            return;
        }
        let _ = self.node_name.set(name.to_string());
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.get().map(|s| s.as_str())
    }
}

/// Normalize a MAC address to lowercase colon-separated form.
/// Accepts `:` or `-` separators; rejects anything that is not 6 hex octets.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let octets: Vec<&str> = mac.split([':', '-']).collect();
    if octets.len() != 6 {
        return Err(Error::InvalidInput(format!("invalid MAC address: {mac}")));
    }
    let mut parts = Vec::with_capacity(6);
    for octet in octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!("invalid MAC address: {mac}")));
        }
        parts.push(octet.to_lowercase());
    }
    Ok(parts.join(":"))
}
