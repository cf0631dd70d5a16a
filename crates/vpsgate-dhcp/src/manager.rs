use crate::daemon::DnsmasqDaemon;
use crate::{hostfile, leasefile};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vpsgate_core::config::DhcpSettings;
use vpsgate_core::error::{Error, Result};
use vpsgate_core::metrics::names;
use vpsgate_core::types::{normalize_mac, Allocation, GatewayIdentity, LeaseInfo};

/// Owns the `vps_id -> Allocation` map and keeps the daemon's host file in
/// sync with it.
///
/// Lock discipline: `allocations` guards the map, `file_ops` serializes
/// host-file writes. The two are never held together: mutations happen
/// under the map lock, a snapshot is taken, the lock is dropped, and only
/// then is the file written.
pub struct DhcpManager {
    settings: DhcpSettings,
    identity: Arc<GatewayIdentity>,
    daemon: Option<Arc<DnsmasqDaemon>>,
    allocations: Mutex<HashMap<String, Allocation>>,
    file_ops: Mutex<()>,
    last_reconcile: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time counters for `get_stats` / `GetGatewayInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct DhcpStats {
    pub pool_size: u64,
    pub allocated_total: usize,
    pub allocated_in_pool: usize,
    pub static_count: usize,
    pub free_in_pool: u64,
    pub last_reconcile: Option<DateTime<Utc>>,
}

impl DhcpManager {
    pub fn new(settings: DhcpSettings, identity: Arc<GatewayIdentity>) -> Self {
        Self {
            settings,
            identity,
            daemon: None,
            allocations: Mutex::new(HashMap::new()),
            file_ops: Mutex::new(()),
            last_reconcile: Mutex::new(None),
        }
    }

    /// Attach the daemon handle so host-file writes trigger a reload.
    pub fn with_daemon(mut self, daemon: Arc<DnsmasqDaemon>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn pool_contains(&self, ip: Ipv4Addr) -> bool {
        let start: u32 = self.settings.pool_start.into();
        let end: u32 = self.settings.pool_end.into();
        let ip: u32 = ip.into();
        ip >= start && ip <= end
    }

    // --- Public contract ---

    /// Allocate an address for `vps_id`. Idempotent: a VPS that already has
    /// an allocation gets it back unchanged. With `preferred_ip`, the
    /// address is validated (in-pool unless `allow_public_ip`, not already
    /// taken); without it, the smallest free pool address is chosen.
    pub async fn allocate(
        &self,
        vps_id: &str,
        organization_id: &str,
        mac: &str,
        preferred_ip: Option<Ipv4Addr>,
        allow_public_ip: bool,
    ) -> Result<Allocation> {
        let mac = normalize_mac(mac)?;

        let (allocation, snapshot) = {
            let mut map = self.allocations.lock().await;
            if let Some(existing) = map.get(vps_id) {
                debug!(vps_id, ip = %existing.ip_address, "allocate is idempotent");
                return Ok(existing.clone());
            }

            let ip = match preferred_ip {
                Some(ip) => {
                    if !self.pool_contains(ip) && !allow_public_ip {
                        return Err(Error::IpOutOfPool(ip));
                    }
                    if let Some(holder) = map.values().find(|a| a.ip_address == ip) {
                        return Err(Error::IpAlreadyAllocated {
                            ip,
                            vps_id: holder.vps_id.clone(),
                        });
                    }
                    ip
                }
                None => self.find_free_ip(&map)?,
            };

            let allocation = Allocation {
                vps_id: vps_id.to_string(),
                organization_id: organization_id.to_string(),
                ip_address: ip,
                mac_address: mac,
                allocated_at: Utc::now(),
                lease_expires: None,
            };
            map.insert(vps_id.to_string(), allocation.clone());
            (allocation, Self::snapshot(&map))
        };

        if let Err(e) = self.write_host_file(&snapshot).await {
            // Roll back so the map never references an entry the daemon
            // cannot see.
            let mut map = self.allocations.lock().await;
            map.remove(vps_id);
            return Err(e);
        }

        counter!(names::DHCP_ALLOCATIONS).increment(1);
        info!(vps_id, ip = %allocation.ip_address, org = organization_id, "allocated IP");
        Ok(allocation)
    }

    /// Release the allocation for `vps_id`. When `ip` is supplied it must
    /// match the held address.
    pub async fn release(&self, vps_id: &str, ip: Option<Ipv4Addr>) -> Result<()> {
        let snapshot = {
            let mut map = self.allocations.lock().await;
            let held = map
                .get(vps_id)
                .ok_or_else(|| Error::NotFound(format!("no allocation for {vps_id}")))?;
            if let Some(given) = ip {
                if held.ip_address != given {
                    return Err(Error::IpMismatch {
                        held: held.ip_address,
                        given,
                    });
                }
            }
            map.remove(vps_id);
            Self::snapshot(&map)
        };

        // The removal stands even if the write fails; the reconciler's
        // defensive sync repairs the host file on its next pass.
        if let Err(e) = self.write_host_file(&snapshot).await {
            warn!(vps_id, error = %e, "host file write after release failed");
        }

        counter!(names::DHCP_RELEASES).increment(1);
        info!(vps_id, "released IP");
        Ok(())
    }

    /// List allocations, optionally filtered by organization and VPS.
    ///
    /// Runs a full lease sync first so returned addresses reflect the
    /// daemon's view; callers on hot paths should expect file I/O.
    pub async fn list(
        &self,
        organization_id: Option<&str>,
        vps_id: Option<&str>,
    ) -> Result<Vec<Allocation>> {
        self.sync_with_leases().await?;

        let map = self.allocations.lock().await;
        let mut result: Vec<Allocation> = map
            .values()
            .filter(|a| organization_id.is_none_or(|org| a.organization_id == org))
            .filter(|a| vps_id.is_none_or(|id| a.vps_id == id))
            .cloned()
            .collect();
        result.sort_by_key(|a| u32::from(a.ip_address));
        Ok(result)
    }

    /// Bind a VPS to an address outside the normal pool flow (typically a
    /// public IP). Out-of-pool addresses require `is_public`.
    pub async fn add_static_lease(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        vps_id: &str,
        organization_id: &str,
        is_public: bool,
    ) -> Result<()> {
        let mac = normalize_mac(mac)?;

        let snapshot = {
            let mut map = self.allocations.lock().await;
            if let Some(existing) = map.get(vps_id) {
                if existing.ip_address == ip {
                    return Ok(());
                }
                return Err(Error::IpAlreadyAllocated {
                    ip: existing.ip_address,
                    vps_id: vps_id.to_string(),
                });
            }
            if !self.pool_contains(ip) && !is_public {
                return Err(Error::IpOutOfPool(ip));
            }
            if let Some(holder) = map.values().find(|a| a.ip_address == ip) {
                return Err(Error::IpAlreadyAllocated {
                    ip,
                    vps_id: holder.vps_id.clone(),
                });
            }
            map.insert(
                vps_id.to_string(),
                Allocation {
                    vps_id: vps_id.to_string(),
                    organization_id: organization_id.to_string(),
                    ip_address: ip,
                    mac_address: mac,
                    allocated_at: Utc::now(),
                    lease_expires: None,
                },
            );
            Self::snapshot(&map)
        };

        if let Err(e) = self.write_host_file(&snapshot).await {
            let mut map = self.allocations.lock().await;
            map.remove(vps_id);
            return Err(e);
        }
        info!(vps_id, %ip, is_public, "static lease added");
        Ok(())
    }

    /// Remove a static binding created by [`add_static_lease`].
    pub async fn remove_static_lease(&self, vps_id: &str, ip: Ipv4Addr) -> Result<()> {
        self.release(vps_id, Some(ip)).await
    }

    /// Idempotent insert used by self-healing when the daemon's lease file
    /// contains a VM the gateway forgot about. An existing allocation is
    /// re-pointed at the observed address.
    pub async fn register_lease_directly(
        &self,
        vps_id: &str,
        organization_id: &str,
        ip: Ipv4Addr,
        is_public: bool,
        mac: &str,
    ) -> Result<()> {
        let mac = normalize_mac(mac)?;
        if !self.pool_contains(ip) && !is_public {
            return Err(Error::IpOutOfPool(ip));
        }

        let snapshot = {
            let mut map = self.allocations.lock().await;
            match map.get_mut(vps_id) {
                Some(existing) => {
                    if existing.ip_address == ip && existing.mac_address == mac {
                        return Ok(());
                    }
                    existing.ip_address = ip;
                    existing.mac_address = mac;
                }
                None => {
                    map.insert(
                        vps_id.to_string(),
                        Allocation {
                            vps_id: vps_id.to_string(),
                            organization_id: organization_id.to_string(),
                            ip_address: ip,
                            mac_address: mac,
                            allocated_at: Utc::now(),
                            lease_expires: None,
                        },
                    );
                }
            }
            Self::snapshot(&map)
        };

        self.write_host_file(&snapshot).await?;
        info!(vps_id, %ip, "lease registered directly");
        Ok(())
    }

    /// Parse the daemon lease file and return the unexpired entries.
    pub async fn get_active_leases(&self) -> Result<Vec<LeaseInfo>> {
        leasefile::read(&self.settings.lease_file(), Utc::now()).await
    }

    pub fn get_config(&self) -> &DhcpSettings {
        &self.settings
    }

    pub async fn get_stats(&self) -> DhcpStats {
        let map = self.allocations.lock().await;
        let allocated_in_pool = map
            .values()
            .filter(|a| self.pool_contains(a.ip_address))
            .count();
        DhcpStats {
            pool_size: self.settings.pool_size(),
            allocated_total: map.len(),
            allocated_in_pool,
            static_count: map.len() - allocated_in_pool,
            free_in_pool: self.settings.pool_size() - allocated_in_pool as u64,
            last_reconcile: *self.last_reconcile.lock().await,
        }
    }

    pub fn set_node_name(&self, name: &str) {
        self.identity.set_node_name(name);
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    // --- Reconciliation ---

    /// Defensive pass: rewrite the host file from the current map.
    pub async fn sync_hosts_from_allocations(&self) -> Result<()> {
        let snapshot = {
            let map = self.allocations.lock().await;
            Self::snapshot(&map)
        };
        self.write_host_file(&snapshot).await
    }

    /// Reconcile the allocation map against the daemon's lease file.
    ///
    /// Matching prefers MAC; an allocation whose MAC is absent from the
    /// lease set falls back to its IP and has the MAC backfilled. Matched
    /// allocations take the lease's address and expiry. A pool-backed
    /// allocation that has held a lease before and no longer matches any
    /// row is removed; the daemon is authoritative for live pool leases.
    /// Never-leased allocations are left to the TTL sweep, and static
    /// (out-of-pool) allocations are never pruned here.
    pub async fn sync_with_leases(&self) -> Result<()> {
        let now = Utc::now();
        let leases = match leasefile::read(&self.settings.lease_file(), now).await {
            Ok(leases) => leases,
            Err(e) => {
                // Stale allocations remain until the next successful parse.
                warn!(error = %e, "lease file read failed, keeping cached allocations");
                return Ok(());
            }
        };
        let (by_mac, by_ip) = leasefile::build_indices(&leases);

        let snapshot = {
            let mut map = self.allocations.lock().await;
            let mut hosts_dirty = false;
            let mut matched: HashSet<String> = HashSet::new();

            for alloc in map.values_mut() {
                let lease = match by_mac.get(&alloc.mac_address) {
                    Some(lease) => Some(lease),
                    None => by_ip.get(&alloc.ip_address),
                };
                let Some(lease) = lease else { continue };

                matched.insert(alloc.vps_id.clone());
                if alloc.mac_address != lease.mac {
                    debug!(vps_id = %alloc.vps_id, mac = %lease.mac, "backfilled MAC from lease");
                    alloc.mac_address = lease.mac.clone();
                }
                if alloc.ip_address != lease.ip {
                    info!(
                        vps_id = %alloc.vps_id,
                        old_ip = %alloc.ip_address,
                        new_ip = %lease.ip,
                        "lease moved allocation to a new address"
                    );
                    alloc.ip_address = lease.ip;
                    hosts_dirty = true;
                }
                alloc.lease_expires = Some(lease.expires_at);
            }

            let before = map.len();
            map.retain(|vps_id, alloc| {
                if matched.contains(vps_id) || !self.pool_contains(alloc.ip_address) {
                    return true;
                }
                // Only prune entries the daemon has leased before; a fresh
                // allocation whose VM has not booted yet keeps its slot.
                if alloc.lease_expires.is_some() {
                    info!(%vps_id, ip = %alloc.ip_address, "pruning allocation with no live lease");
                    false
                } else {
                    true
                }
            });
            if map.len() != before {
                hosts_dirty = true;
            }

            hosts_dirty.then(|| Self::snapshot(&map))
        };

        if let Some(snapshot) = snapshot {
            self.write_host_file(&snapshot).await?;
        }
        *self.last_reconcile.lock().await = Some(now);
        Ok(())
    }

    /// TTL sweep: remove pool-backed allocations whose lease expiry and
    /// `allocated_at + allocation_ttl` are both in the past. Returns the
    /// number removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.allocation_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        let (removed, snapshot) = {
            let mut map = self.allocations.lock().await;
            let before = map.len();
            map.retain(|vps_id, alloc| {
                if !self.pool_contains(alloc.ip_address) {
                    return true;
                }
                let lease_dead = alloc.lease_expires.is_none_or(|at| at <= now);
                let ttl_dead = alloc.allocated_at + ttl <= now;
                if lease_dead && ttl_dead {
                    info!(%vps_id, ip = %alloc.ip_address, "removing expired allocation");
                    false
                } else {
                    true
                }
            });
            let removed = before - map.len();
            (removed, (removed > 0).then(|| Self::snapshot(&map)))
        };

        if let Some(snapshot) = snapshot {
            self.write_host_file(&snapshot).await?;
        }
        if removed > 0 {
            counter!(names::DHCP_STALE_PRUNED).increment(removed as u64);
        }
        Ok(removed)
    }

    // --- Internals ---

    fn find_free_ip(&self, map: &HashMap<String, Allocation>) -> Result<Ipv4Addr> {
        let in_use: HashSet<Ipv4Addr> = map.values().map(|a| a.ip_address).collect();
        let start: u32 = self.settings.pool_start.into();
        let end: u32 = self.settings.pool_end.into();
        for candidate in start..=end {
            let ip = Ipv4Addr::from(candidate);
            if !in_use.contains(&ip) {
                return Ok(ip);
            }
        }
        Err(Error::PoolExhausted)
    }

    fn snapshot(map: &HashMap<String, Allocation>) -> Vec<(Ipv4Addr, String)> {
        map.values()
            .map(|a| (a.ip_address, a.vps_id.clone()))
            .collect()
    }

    /// The single host-file writer. Serialized by `file_ops`; callers must
    /// not hold the map lock.
    async fn write_host_file(&self, entries: &[(Ipv4Addr, String)]) -> Result<()> {
        let _guard = self.file_ops.lock().await;
        let content = hostfile::render(entries, Utc::now());
        hostfile::write_atomic(&self.settings.host_file(), &content).await?;
        drop(_guard);

        if let Some(daemon) = &self.daemon {
            daemon.reload().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager_with_pool(start: &str, end: &str) -> (DhcpManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let settings = DhcpSettings {
            pool_start: start.parse().unwrap(),
            pool_end: end.parse().unwrap(),
            subnet_mask: "255.255.255.0".parse().unwrap(),
            gateway_ip: "10.0.0.1".parse().unwrap(),
            listen_ip: None,
            dns_servers: vec!["1.1.1.1".parse().unwrap()],
            interface: "br0".to_string(),
            lease_dir: dir.path().to_path_buf(),
            allocation_ttl: Duration::from_secs(86_400),
            reconcile_interval: Duration::from_secs(30),
        };
        let manager = DhcpManager::new(settings, Arc::new(GatewayIdentity::new("gw-test")));
        (manager, dir)
    }

    async fn host_entries(manager: &DhcpManager) -> Vec<(Ipv4Addr, String)> {
        let content = tokio::fs::read_to_string(manager.get_config().host_file())
            .await
            .unwrap_or_default();
        hostfile::parse(&content)
    }

    async fn write_lease_file(manager: &DhcpManager, rows: &[(i64, &str, &str, &str)]) {
        let content: String = rows
            .iter()
            .map(|(expiry, mac, ip, host)| format!("{expiry} {mac} {ip} {host}\n"))
            .collect();
        tokio::fs::write(manager.get_config().lease_file(), content)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cold_start_allocation() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");

        let alloc = manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        assert_eq!(alloc.ip_address, "10.0.0.10".parse::<Ipv4Addr>().unwrap());

        let entries = host_entries(&manager).await;
        assert_eq!(entries, vec![("10.0.0.10".parse().unwrap(), "vps-1".to_string())]);
    }

    #[tokio::test]
    async fn test_preferred_in_pool_then_smallest_free() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");

        let alloc = manager
            .allocate(
                "vps-2",
                "org-A",
                "aa:bb:cc:dd:ee:02",
                Some("10.0.0.12".parse().unwrap()),
                false,
            )
            .await
            .unwrap();
        assert_eq!(alloc.ip_address, "10.0.0.12".parse::<Ipv4Addr>().unwrap());

        let next = manager
            .allocate("vps-3", "org-A", "aa:bb:cc:dd:ee:03", None, false)
            .await
            .unwrap();
        assert_eq!(next.ip_address, "10.0.0.10".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_allocate_idempotent() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");

        let first = manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        let second = manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        assert_eq!(first.ip_address, second.ip_address);

        // Single host-file entry.
        assert_eq!(host_entries(&manager).await.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_boundaries_and_public() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");

        // Preferred at pool start and end both work.
        manager
            .allocate("vps-s", "org-A", "aa:bb:cc:dd:ee:01", Some("10.0.0.10".parse().unwrap()), false)
            .await
            .unwrap();
        manager
            .allocate("vps-e", "org-A", "aa:bb:cc:dd:ee:02", Some("10.0.0.12".parse().unwrap()), false)
            .await
            .unwrap();

        // Out of pool is refused without allow_public_ip, accepted with it.
        let err = manager
            .allocate("vps-p", "org-A", "aa:bb:cc:dd:ee:03", Some("203.0.113.9".parse().unwrap()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpOutOfPool(_)));

        let public = manager
            .allocate("vps-p", "org-A", "aa:bb:cc:dd:ee:03", Some("203.0.113.9".parse().unwrap()), true)
            .await
            .unwrap();
        assert_eq!(public.ip_address, "203.0.113.9".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_preferred_conflict() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", Some("10.0.0.11".parse().unwrap()), false)
            .await
            .unwrap();

        let err = manager
            .allocate("vps-2", "org-A", "aa:bb:cc:dd:ee:02", Some("10.0.0.11".parse().unwrap()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpAlreadyAllocated { .. }));
    }

    #[tokio::test]
    async fn test_single_ip_pool_exhaustion() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.10");

        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        let err = manager
            .allocate("vps-2", "org-A", "aa:bb:cc:dd:ee:02", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));

        manager.release("vps-1", None).await.unwrap();
        let again = manager
            .allocate("vps-2", "org-A", "aa:bb:cc:dd:ee:02", None, false)
            .await
            .unwrap();
        assert_eq!(again.ip_address, "10.0.0.10".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_release_errors() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        assert!(matches!(
            manager.release("ghost", None).await.unwrap_err(),
            Error::NotFound(_)
        ));

        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        let err = manager
            .release("vps-1", Some("10.0.0.99".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpMismatch { .. }));

        // Allocation survives the mismatched release.
        assert_eq!(manager.get_stats().await.allocated_total, 1);
    }

    #[tokio::test]
    async fn test_map_size_invariant() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.20");
        for i in 1..=5u8 {
            manager
                .allocate(
                    &format!("vps-{i}"),
                    "org-A",
                    &format!("aa:bb:cc:dd:ee:{i:02x}"),
                    None,
                    false,
                )
                .await
                .unwrap();
        }
        manager.release("vps-2", None).await.unwrap();
        manager.release("vps-4", None).await.unwrap();

        assert_eq!(manager.get_stats().await.allocated_total, 3);

        // Host file mirrors the map exactly.
        let entries = host_entries(&manager).await;
        assert_eq!(entries.len(), 3);
        let ids: HashSet<String> = entries.into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, HashSet::from(["vps-1".into(), "vps-3".into(), "vps-5".into()]));
    }

    #[tokio::test]
    async fn test_lease_driven_update() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();

        // The daemon moved the VM to .11.
        let future = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        write_lease_file(&manager, &[(future, "aa:bb:cc:dd:ee:01", "10.0.0.11", "vps-1")]).await;

        manager.sync_with_leases().await.unwrap();

        let allocs = manager.list(None, Some("vps-1")).await.unwrap();
        assert_eq!(allocs[0].ip_address, "10.0.0.11".parse::<Ipv4Addr>().unwrap());
        assert!(allocs[0].lease_expires.is_some());

        let entries = host_entries(&manager).await;
        assert_eq!(entries, vec![("10.0.0.11".parse().unwrap(), "vps-1".to_string())]);
    }

    #[tokio::test]
    async fn test_mac_backfill_via_ip_match() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();

        // Lease carries a different MAC for the same IP: backfill.
        let future = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        write_lease_file(&manager, &[(future, "aa:bb:cc:dd:ee:99", "10.0.0.10", "vps-1")]).await;
        manager.sync_with_leases().await.unwrap();

        let allocs = manager.list(None, Some("vps-1")).await.unwrap();
        assert_eq!(allocs[0].mac_address, "aa:bb:cc:dd:ee:99");
    }

    #[tokio::test]
    async fn test_prune_pool_allocation_without_live_lease() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();

        // First sync: the VM holds a lease.
        let future = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        write_lease_file(&manager, &[(future, "aa:bb:cc:dd:ee:01", "10.0.0.10", "vps-1")]).await;
        manager.sync_with_leases().await.unwrap();

        // Lease gone: the daemon dropped it, so the allocation goes too.
        write_lease_file(&manager, &[]).await;
        manager.sync_with_leases().await.unwrap();

        assert_eq!(manager.get_stats().await.allocated_total, 0);
        assert!(host_entries(&manager).await.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_allocation_survives_sync() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();

        // No lease yet (VM still booting): sync must not prune it.
        write_lease_file(&manager, &[]).await;
        manager.sync_with_leases().await.unwrap();
        assert_eq!(manager.get_stats().await.allocated_total, 1);
    }

    #[tokio::test]
    async fn test_static_lease_exempt_from_sync_prune() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager
            .add_static_lease("aa:bb:cc:dd:ee:01", "203.0.113.9".parse().unwrap(), "vps-pub", "org-A", true)
            .await
            .unwrap();

        write_lease_file(&manager, &[]).await;
        manager.sync_with_leases().await.unwrap();
        manager.sweep_expired().await.unwrap();

        assert_eq!(manager.get_stats().await.static_count, 1);

        manager
            .remove_static_lease("vps-pub", "203.0.113.9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(manager.get_stats().await.allocated_total, 0);
    }

    #[tokio::test]
    async fn test_static_lease_requires_public_flag() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        let err = manager
            .add_static_lease("aa:bb:cc:dd:ee:01", "203.0.113.9".parse().unwrap(), "vps-pub", "org-A", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpOutOfPool(_)));
    }

    #[tokio::test]
    async fn test_ttl_sweep() {
        let (mut manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager.settings.allocation_ttl = Duration::ZERO;

        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();

        // lease_expires unset and allocated_at + 0 already past: removed.
        let removed = manager.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(manager.get_stats().await.allocated_total, 0);
        assert!(host_entries(&manager).await.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_sweep_keeps_live_lease() {
        let (mut manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        manager.settings.allocation_ttl = Duration::ZERO;

        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        let future = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        write_lease_file(&manager, &[(future, "aa:bb:cc:dd:ee:01", "10.0.0.10", "vps-1")]).await;
        manager.sync_with_leases().await.unwrap();

        // TTL is past but the daemon lease is live: kept.
        assert_eq!(manager.sweep_expired().await.unwrap(), 0);
        assert_eq!(manager.get_stats().await.allocated_total, 1);
    }

    #[tokio::test]
    async fn test_register_lease_directly_idempotent() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");

        manager
            .register_lease_directly("vps-1", "org-A", "10.0.0.11".parse().unwrap(), false, "aa:bb:cc:dd:ee:01")
            .await
            .unwrap();
        manager
            .register_lease_directly("vps-1", "org-A", "10.0.0.11".parse().unwrap(), false, "aa:bb:cc:dd:ee:01")
            .await
            .unwrap();

        assert_eq!(manager.get_stats().await.allocated_total, 1);
        assert_eq!(host_entries(&manager).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.20");
        manager
            .allocate("vps-1", "org-A", "aa:bb:cc:dd:ee:01", None, false)
            .await
            .unwrap();
        manager
            .allocate("vps-2", "org-B", "aa:bb:cc:dd:ee:02", None, false)
            .await
            .unwrap();

        assert_eq!(manager.list(None, None).await.unwrap().len(), 2);
        assert_eq!(manager.list(Some("org-A"), None).await.unwrap().len(), 1);
        assert_eq!(manager.list(None, Some("vps-2")).await.unwrap().len(), 1);
        assert!(manager.list(Some("org-C"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_active_leases_filters_expired() {
        let (manager, _dir) = manager_with_pool("10.0.0.10", "10.0.0.12");
        let future = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let past = (Utc::now() - chrono::Duration::hours(1)).timestamp();
        write_lease_file(
            &manager,
            &[
                (future, "aa:bb:cc:dd:ee:01", "10.0.0.10", "vps-1"),
                (past, "aa:bb:cc:dd:ee:02", "10.0.0.11", "vps-2"),
            ],
        )
        .await;

        let leases = manager.get_active_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].hostname, "vps-1");
    }
}
