use chrono::{DateTime, SecondsFormat, Utc};
use std::net::Ipv4Addr;
use std::path::Path;
use vpsgate_core::error::{Error, Result};

/// Render the daemon host file: commented header, then one
/// `<ipv4> <vps_id>` line per allocation, sorted by address.
pub fn render(entries: &[(Ipv4Addr, String)], now: DateTime<Utc>) -> String {
    let mut sorted: Vec<&(Ipv4Addr, String)> = entries.iter().collect();
    sorted.sort_by_key(|(ip, _)| u32::from(*ip));

    let mut out = String::new();
    out.push_str("# VPS hostname to IP mappings\n");
    out.push_str("# Auto-generated by vpsgate; do not edit\n");
    out.push_str(&format!(
        "# Last updated: {}\n\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    for (ip, vps_id) in sorted {
        out.push_str(&format!("{ip} {vps_id}\n"));
    }
    out
}

/// Write `content` atomically: a sibling temp file, then rename over the
/// target so the daemon never reads a partial file.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| Error::TransientIo(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::TransientIo(format!("rename {} -> {}: {e}", tmp.display(), path.display())))?;
    Ok(())
}

/// Parse the body lines of a host file back into `(ip, vps_id)` pairs.
/// Comment and blank lines are skipped.
pub fn parse(content: &str) -> Vec<(Ipv4Addr, String)> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip = fields.next()?.parse().ok()?;
            let vps_id = fields.next()?.to_string();
            Some((ip, vps_id))
        })
        .collect()
}
