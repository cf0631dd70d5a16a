use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Reject absurd pool ranges before building per-address state.
pub const MAX_POOL_SIZE: u64 = 1_000_000;

/// Complete gateway configuration, read from the process environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub dhcp: DhcpSettings,
    pub dns: DnsSettings,
    pub proxy: ProxySettings,
    pub channel: ChannelSettings,
    pub logging: LoggingSettings,
    pub store_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DhcpSettings {
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    /// Extra daemon listen address; defaults to the gateway IP.
    pub listen_ip: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub interface: String,
    pub lease_dir: PathBuf,
    pub allocation_ttl: Duration,
    pub reconcile_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    /// Apex the gateway is authoritative under; queries must end in
    /// `my.<zone>`.
    pub zone: String,
    pub listen: SocketAddr,
    pub delegation_listen: SocketAddr,
}

impl DnsSettings {
    /// The managed suffix, without a leading dot: `my.<zone>`.
    pub fn managed_suffix(&self) -> String {
        format!("my.{}", self.zone)
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen: SocketAddr,
    /// `(path prefix, upstream base URL)` pairs; longest prefix wins.
    pub routes: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Fallback API URL when the registry is unavailable or empty.
    pub api_url: String,
    pub api_secret: String,
    pub registry_url: Option<String>,
    pub client_init_delay: Duration,
    pub find_vps_timeout: Duration,
    pub api_call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl GatewayConfig {
    /// Read the full configuration from the process environment.
    /// Any missing or unparseable required variable is fatal.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Testable core of [`from_env`]: resolve variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("missing required env var {name}")))
        };
        let optional = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let pool_start = parse_ipv4("DHCP_POOL_START", &require("DHCP_POOL_START")?)?;
        let pool_end = parse_ipv4("DHCP_POOL_END", &require("DHCP_POOL_END")?)?;
        let start_u32: u32 = pool_start.into();
        let end_u32: u32 = pool_end.into();
        if start_u32 > end_u32 {
            return Err(Error::Config(format!(
                "DHCP pool start {pool_start} is above pool end {pool_end}"
            )));
        }
        let pool_size = u64::from(end_u32 - start_u32) + 1;
        if pool_size > MAX_POOL_SIZE {
            return Err(Error::Config(format!(
                "DHCP pool spans {pool_size} addresses, above the {MAX_POOL_SIZE} cap"
            )));
        }

        let subnet_mask = parse_netmask(&require("DHCP_SUBNET_MASK")?)?;
        let gateway_ip = parse_ipv4("GATEWAY_IP", &require("GATEWAY_IP")?)?;
        let listen_ip = optional("GATEWAY_LISTEN_IP")
            .map(|v| parse_ipv4("GATEWAY_LISTEN_IP", &v))
            .transpose()?;

        let dns_servers = require("DNS_SERVERS")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| parse_ipv4("DNS_SERVERS", s))
            .collect::<Result<Vec<_>>>()?;
        if dns_servers.is_empty() {
            return Err(Error::Config("DNS_SERVERS has no entries".into()));
        }

        let dhcp = DhcpSettings {
            pool_start,
            pool_end,
            subnet_mask,
            gateway_ip,
            listen_ip,
            dns_servers,
            interface: require("DHCP_INTERFACE")?,
            lease_dir: PathBuf::from(
                optional("DHCP_LEASE_DIR").unwrap_or_else(|| "/var/lib/vpsgate".to_string()),
            ),
            allocation_ttl: parse_secs("ALLOCATION_TTL_SECS", optional("ALLOCATION_TTL_SECS"), 86_400)?,
            reconcile_interval: parse_secs(
                "RECONCILE_INTERVAL_SECS",
                optional("RECONCILE_INTERVAL_SECS"),
                30,
            )?,
        };

        let dns = DnsSettings {
            zone: require("ZONE")?.trim_matches('.').to_string(),
            listen: parse_socket_addr(
                "DNS_LISTEN",
                &optional("DNS_LISTEN").unwrap_or_else(|| "0.0.0.0:53".to_string()),
            )?,
            delegation_listen: parse_socket_addr(
                "DELEGATION_LISTEN",
                &optional("DELEGATION_LISTEN").unwrap_or_else(|| "0.0.0.0:8053".to_string()),
            )?,
        };

        let proxy = ProxySettings {
            listen: parse_socket_addr(
                "PROXY_LISTEN",
                &optional("PROXY_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            )?,
            routes: parse_routes(&optional("PROXY_ROUTES").unwrap_or_default())?,
        };

        let channel = ChannelSettings {
            api_url: require("API_URL")?,
            api_secret: require("API_SECRET")?,
            registry_url: optional("REGISTRY_URL"),
            client_init_delay: parse_secs("CLIENT_INIT_DELAY_SECS", optional("CLIENT_INIT_DELAY_SECS"), 2)?,
            find_vps_timeout: parse_secs("FIND_VPS_TIMEOUT_SECS", optional("FIND_VPS_TIMEOUT_SECS"), 10)?,
            api_call_timeout: parse_secs("API_CALL_TIMEOUT_SECS", optional("API_CALL_TIMEOUT_SECS"), 5)?,
        };

        let logging = LoggingSettings {
            level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format: optional("LOG_FORMAT").unwrap_or_else(|| "text".to_string()),
        };

        Ok(Self {
            dhcp,
            dns,
            proxy,
            channel,
            logging,
            store_path: PathBuf::from(
                optional("STORE_PATH").unwrap_or_else(|| "/var/lib/vpsgate/gateway.redb".to_string()),
            ),
        })
    }
}

impl DhcpSettings {
    pub fn pool_size(&self) -> u64 {
        let start: u32 = self.pool_start.into();
        let end: u32 = self.pool_end.into();
        u64::from(end - start) + 1
    }

    pub fn host_file(&self) -> PathBuf {
        self.lease_dir.join("vps-hosts")
    }

    pub fn lease_file(&self) -> PathBuf {
        self.lease_dir.join("dnsmasq.leases")
    }

    pub fn daemon_config_file(&self) -> PathBuf {
        self.lease_dir.join("dnsmasq.conf")
    }
}

fn parse_ipv4(name: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name}: not an IPv4 address: {value}")))
}

/// Accepts either CIDR prefix form (`/24`) or a dotted quad
/// (`255.255.255.0`).
pub fn parse_netmask(value: &str) -> Result<Ipv4Addr> {
    if let Some(prefix) = value.strip_prefix('/') {
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Config(format!("invalid netmask prefix: {value}")))?;
        let net = ipnet::Ipv4Net::new(Ipv4Addr::UNSPECIFIED, prefix)
            .map_err(|_| Error::Config(format!("invalid netmask prefix: {value}")))?;
        return Ok(net.netmask());
    }

    let mask: Ipv4Addr = value
        .parse()
        .map_err(|_| Error::Config(format!("invalid netmask: {value}")))?;
    // A valid mask is a contiguous run of ones.
    let bits: u32 = mask.into();
    let ones = bits.leading_ones();
    let expect: u32 = if ones == 0 { 0 } else { !0u32 << (32 - ones) };
    if bits != expect {
        return Err(Error::Config(format!("non-contiguous netmask: {value}")));
    }
    Ok(mask)
}

fn parse_socket_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name}: not a socket address: {value}")))
}

fn parse_secs(name: &str, value: Option<String>, default: u64) -> Result<Duration> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(v) => v
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name}: not a number of seconds: {v}"))),
    }
}

/// Parse `PROXY_ROUTES`, formatted `prefix=url` pairs separated by commas:
/// `/api=http://api:3000,/terminal/ws=http://deployments:3005`.
fn parse_routes(value: &str) -> Result<Vec<(String, String)>> {
    let mut routes = Vec::new();
    for pair in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (prefix, upstream) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("PROXY_ROUTES entry missing '=': {pair}")))?;
        if !prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "PROXY_ROUTES prefix must start with '/': {prefix}"
            )));
        }
        routes.push((prefix.to_string(), upstream.trim_end_matches('/').to_string()));
    }
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DHCP_POOL_START", "10.0.0.10"),
            ("DHCP_POOL_END", "10.0.0.250"),
            ("DHCP_SUBNET_MASK", "/24"),
            ("GATEWAY_IP", "10.0.0.1"),
            ("DNS_SERVERS", "1.1.1.1, 8.8.8.8"),
            ("DHCP_INTERFACE", "br0"),
            ("ZONE", "example.com"),
            ("API_URL", "ws://api:3000/gateway"),
            ("API_SECRET", "hunter2"),
        ])
    }

    fn load(env: &HashMap<&str, &str>) -> Result<GatewayConfig> {
        GatewayConfig::from_lookup(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_minimal_env() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.dhcp.pool_start, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(config.dhcp.pool_size(), 241);
        assert_eq!(config.dhcp.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.dhcp.dns_servers.len(), 2);
        assert_eq!(config.dns.managed_suffix(), "my.example.com");
        assert_eq!(config.dhcp.reconcile_interval, Duration::from_secs(30));
        assert!(config.channel.registry_url.is_none());
    }

    #[test]
    fn test_missing_required_is_fatal() {
        let mut env = base_env();
        env.remove("API_SECRET");
        assert!(matches!(load(&env), Err(Error::Config(_))));
    }

    #[test]
    fn test_pool_inverted() {
        let mut env = base_env();
        env.insert("DHCP_POOL_START", "10.0.1.0");
        env.insert("DHCP_POOL_END", "10.0.0.10");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_pool_size_cap() {
        let mut env = base_env();
        env.insert("DHCP_POOL_START", "10.0.0.0");
        env.insert("DHCP_POOL_END", "10.255.255.255");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_netmask_forms() {
        assert_eq!(parse_netmask("/24").unwrap(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(parse_netmask("/0").unwrap(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(parse_netmask("/32").unwrap(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(
            parse_netmask("255.255.240.0").unwrap(),
            Ipv4Addr::new(255, 255, 240, 0)
        );
        assert!(parse_netmask("/33").is_err());
        assert!(parse_netmask("255.0.255.0").is_err());
    }

    #[test]
    fn test_routes_parse() {
        let routes =
            parse_routes("/api=http://api:3000, /terminal/ws=http://deployments:3005/").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].0, "/terminal/ws");
        assert_eq!(routes[1].1, "http://deployments:3005");

        assert!(parse_routes("no-equals").is_err());
        assert!(parse_routes("api=http://x").is_err());
    }
}
