use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::warn;
use vpsgate_core::error::{Error, Result};
use vpsgate_core::types::{normalize_mac, LeaseInfo};

/// Parse the daemon lease file. Each line:
/// `<expiry-epoch-secs> <mac> <ipv4> <hostname> [client-id]`.
/// Rows whose expiry is at or before `now` are skipped, as are blank and
/// malformed lines (logged).
pub fn parse(content: &str, now: DateTime<Utc>) -> Vec<LeaseInfo> {
    let mut leases = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line, now) {
            Ok(Some(lease)) => leases.push(lease),
            Ok(None) => {} // expired
            Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed lease row"),
        }
    }
    leases
}

fn parse_line(line: &str, now: DateTime<Utc>) -> Result<Option<LeaseInfo>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::InvalidInput(format!("short lease row: {line}")));
    }

    let expiry_secs: i64 = fields[0]
        .parse()
        .map_err(|_| Error::InvalidInput(format!("bad expiry: {}", fields[0])))?;
    let expires_at = Utc
        .timestamp_opt(expiry_secs, 0)
        .single()
        .ok_or_else(|| Error::InvalidInput(format!("bad expiry: {expiry_secs}")))?;
    // A row expiring exactly now is already dead.
    if expires_at <= now {
        return Ok(None);
    }

    let mac = normalize_mac(fields[1])?;
    let ip: Ipv4Addr = fields[2]
        .parse()
        .map_err(|_| Error::InvalidIp(fields[2].to_string()))?;

    Ok(Some(LeaseInfo {
        mac,
        ip,
        hostname: fields[3].to_string(),
        expires_at,
    }))
}

/// Read and parse the lease file. A missing file is an empty lease set
/// (the daemon has not written one yet); any other read failure is
/// transient.
pub async fn read(path: &Path, now: DateTime<Utc>) -> Result<Vec<LeaseInfo>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse(&content, now)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::TransientIo(format!("read {}: {e}", path.display()))),
    }
}

/// Build `mac -> lease` and `ip -> lease` indices. Where a MAC appears
/// more than once, the entry with the latest expiry wins.
pub fn build_indices(
    leases: &[LeaseInfo],
) -> (HashMap<String, LeaseInfo>, HashMap<Ipv4Addr, LeaseInfo>) {
    let mut by_mac: HashMap<String, LeaseInfo> = HashMap::new();
    for lease in leases {
        match by_mac.get(&lease.mac) {
            Some(existing) if existing.expires_at >= lease.expires_at => {}
            _ => {
                by_mac.insert(lease.mac.clone(), lease.clone());
            }
        }
    }

    let mut by_ip: HashMap<Ipv4Addr, LeaseInfo> = HashMap::new();
    for lease in by_mac.values() {
        by_ip.insert(lease.ip, lease.clone());
    }

    (by_mac, by_ip)
}
