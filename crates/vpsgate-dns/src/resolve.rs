use crate::directory::{GameServerInfo, ResourceDirectory};
use hickory_proto::rr::rdata::{A, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use metrics::counter;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vpsgate_core::cache::TtlCache;
use vpsgate_core::metrics::names;
use vpsgate_core::store::Store;
use vpsgate_core::types::DelegatedRecordKind;

/// TTL applied to answers resolved through the directory, and the lifetime
/// of the local resolution cache.
const ANSWER_TTL: u32 = 60;
const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: usize = 10_000;

/// Answer section contents for one query.
#[derive(Debug, Default)]
pub struct ResolvedAnswer {
    pub answers: Vec<Record>,
    pub additionals: Vec<Record>,
}

/// What a query under the managed suffix is asking for.
#[derive(Debug, PartialEq, Eq)]
enum QueryTarget {
    A {
        resource: String,
    },
    Srv {
        service: String,
        proto: String,
        resource: String,
    },
}

/// Resolves `*.my.<zone>` names from the directory (local authority) with
/// the delegated-records table as fallback.
pub struct Resolver {
    directory: Arc<dyn ResourceDirectory>,
    store: Store,
    cache: TtlCache<Vec<Ipv4Addr>>,
    /// Managed suffix without trailing dot, e.g. `my.example.com`.
    suffix: String,
    recursor: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(directory: Arc<dyn ResourceDirectory>, store: Store, suffix: &str) -> Self {
        let recursor =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            directory,
            store,
            cache: TtlCache::new(CACHE_CAPACITY),
            suffix: suffix.trim_matches('.').to_lowercase(),
            recursor,
        }
    }

    /// Resolve one query. `None` means NXDOMAIN.
    pub async fn answer(&self, qname: &str, qtype: RecordType) -> Option<ResolvedAnswer> {
        counter!(names::DNS_QUERIES).increment(1);

        let qname = qname.trim_end_matches('.').to_lowercase();
        let target = self.parse_query(&qname, qtype)?;

        match target {
            QueryTarget::A { resource } => self.answer_a(&qname, &resource).await,
            QueryTarget::Srv {
                service,
                proto,
                resource,
            } => self.answer_srv(&qname, &service, &proto, &resource).await,
        }
    }

    /// Split a qname under the managed suffix into its query shape.
    fn parse_query(&self, qname: &str, qtype: RecordType) -> Option<QueryTarget> {
        let prefix = qname.strip_suffix(&self.suffix)?.strip_suffix('.')?;
        let labels: Vec<&str> = prefix.split('.').collect();

        match qtype {
            RecordType::A if labels.len() == 1 && !labels[0].is_empty() => Some(QueryTarget::A {
                resource: labels[0].to_string(),
            }),
            RecordType::SRV if labels.len() == 3 => {
                let service = labels[0].strip_prefix('_')?;
                let proto = labels[1].strip_prefix('_')?;
                Some(QueryTarget::Srv {
                    service: service.to_string(),
                    proto: proto.to_string(),
                    resource: labels[2].to_string(),
                })
            }
            _ => None,
        }
    }

    async fn answer_a(&self, qname: &str, resource: &str) -> Option<ResolvedAnswer> {
        let ips = if resource.starts_with("gs-") {
            self.game_server_ips(qname, resource).await
        } else {
            self.deployment_ips(qname, resource).await
        };

        let ips = ips?;
        if ips.is_empty() {
            return None;
        }

        let name = Name::from_str(&format!("{qname}.")).ok()?;
        let answers = ips
            .into_iter()
            .map(|ip| Record::from_rdata(name.clone(), ANSWER_TTL, RData::A(A::from(ip))))
            .collect();
        Some(ResolvedAnswer {
            answers,
            additionals: Vec::new(),
        })
    }

    async fn answer_srv(
        &self,
        qname: &str,
        service: &str,
        proto: &str,
        resource: &str,
    ) -> Option<ResolvedAnswer> {
        // Local authority first.
        match self.directory.game_server(resource).await {
            Ok(Some(info)) => {
                if !info.game.matches_srv(service, proto) {
                    debug!(resource, service, proto, "SRV service/proto mismatch for game kind");
                    return None;
                }
                let ips = self.host_ipv4s(resource, &info).await;
                if ips.is_empty() {
                    return self.delegated_srv(qname).await;
                }

                let target = Name::from_str(&format!("{resource}.{}.", self.suffix)).ok()?;
                let owner = Name::from_str(&format!("{qname}.")).ok()?;
                let port = info.port.unwrap_or_else(|| info.game.default_port());

                let srv = Record::from_rdata(
                    owner,
                    ANSWER_TTL,
                    RData::SRV(SRV::new(0, 0, port, target.clone())),
                );
                let additionals = ips
                    .into_iter()
                    .map(|ip| Record::from_rdata(target.clone(), ANSWER_TTL, RData::A(A::from(ip))))
                    .collect();
                Some(ResolvedAnswer {
                    answers: vec![srv],
                    additionals,
                })
            }
            Ok(None) => self.delegated_srv(qname).await,
            Err(e) => {
                warn!(resource, error = %e, "directory SRV lookup failed, trying delegation");
                let answer = self.delegated_srv(qname).await;
                if answer.is_none() {
                    counter!(names::DNS_ERRORS).increment(1);
                }
                answer
            }
        }
    }

    /// IPv4 addresses for a game server, via the 60 s cache.
    async fn game_server_ips(&self, qname: &str, resource: &str) -> Option<Vec<Ipv4Addr>> {
        let cache_key = format!("dns:gameserver:{resource}");
        if let Some(ips) = self.cache.get(&cache_key) {
            return Some(ips);
        }

        match self.directory.game_server(resource).await {
            Ok(Some(info)) => {
                let ips = self.host_ipv4s(resource, &info).await;
                (!ips.is_empty()).then_some(ips)
            }
            Ok(None) => self.delegated_a(qname).await,
            Err(e) => {
                warn!(resource, error = %e, "directory lookup failed, trying delegation");
                let ips = self.delegated_a(qname).await;
                if ips.is_none() {
                    counter!(names::DNS_ERRORS).increment(1);
                }
                ips
            }
        }
    }

    /// Front-end IPv4 addresses for a deployment, via the 60 s cache.
    async fn deployment_ips(&self, qname: &str, resource: &str) -> Option<Vec<Ipv4Addr>> {
        let cache_key = format!("dns:deployment:{resource}");
        if let Some(ips) = self.cache.get(&cache_key) {
            return Some(ips);
        }

        match self.directory.deployment_frontends(resource).await {
            Ok(Some(hosts)) => {
                let mut ips = Vec::new();
                for host in &hosts {
                    ips.extend(self.resolve_host_ipv4(host).await);
                }
                if ips.is_empty() {
                    return None;
                }
                self.cache.insert(cache_key, ips.clone(), CACHE_TTL);
                Some(ips)
            }
            Ok(None) => self.delegated_a(qname).await,
            Err(e) => {
                warn!(resource, error = %e, "directory lookup failed, trying delegation");
                let ips = self.delegated_a(qname).await;
                if ips.is_none() {
                    counter!(names::DNS_ERRORS).increment(1);
                }
                ips
            }
        }
    }

    async fn host_ipv4s(&self, resource: &str, info: &GameServerInfo) -> Vec<Ipv4Addr> {
        let cache_key = format!("dns:gameserver:{resource}");
        if let Some(ips) = self.cache.get(&cache_key) {
            return ips;
        }
        let ips = self.resolve_host_ipv4(&info.host).await;
        if !ips.is_empty() {
            self.cache.insert(cache_key, ips.clone(), CACHE_TTL);
        }
        ips
    }

    /// Interpret a directory `host` value: IP literal, or a hostname chased
    /// through the recursive resolver, preferring IPv4.
    async fn resolve_host_ipv4(&self, host: &str) -> Vec<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return vec![ip];
        }
        if host.parse::<IpAddr>().is_ok() {
            // IPv6 literal: nothing usable for an A answer.
            return Vec::new();
        }

        match self.recursor.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!(host, error = %e, "recursive lookup failed");
                Vec::new()
            }
        }
    }

    /// A-record fallback from the delegated table.
    async fn delegated_a(&self, domain: &str) -> Option<Vec<Ipv4Addr>> {
        match self.store.get_delegated(domain, DelegatedRecordKind::A) {
            Ok(Some(record)) => {
                let ips: Vec<Ipv4Addr> = record
                    .records
                    .iter()
                    .filter_map(|r| r.parse().ok())
                    .collect();
                (!ips.is_empty()).then_some(ips)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(domain, error = %e, "delegated record lookup failed");
                None
            }
        }
    }

    /// SRV fallback from the delegated table. Record values are
    /// `priority weight port target`.
    async fn delegated_srv(&self, qname: &str) -> Option<ResolvedAnswer> {
        let record = match self.store.get_delegated(qname, DelegatedRecordKind::SRV) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(qname, error = %e, "delegated record lookup failed");
                return None;
            }
        };

        let owner = Name::from_str(&format!("{qname}.")).ok()?;
        let answers: Vec<Record> = record
            .records
            .iter()
            .filter_map(|value| {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.len() != 4 {
                    return None;
                }
                let priority = fields[0].parse().ok()?;
                let weight = fields[1].parse().ok()?;
                let port = fields[2].parse().ok()?;
                let target = Name::from_str(&format!("{}.", fields[3].trim_end_matches('.'))).ok()?;
                Some(Record::from_rdata(
                    owner.clone(),
                    record.ttl_seconds,
                    RData::SRV(SRV::new(priority, weight, port, target)),
                ))
            })
            .collect();

        (!answers.is_empty()).then(|| ResolvedAnswer {
            answers,
            additionals: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use uuid::Uuid;
    use vpsgate_core::error::{Error, Result as CoreResult};
    use vpsgate_core::types::{DelegatedRecord, GameKind};

    #[derive(Default)]
    struct StaticDirectory {
        games: HashMap<String, GameServerInfo>,
        deployments: HashMap<String, Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ResourceDirectory for StaticDirectory {
        async fn game_server(&self, id: &str) -> CoreResult<Option<GameServerInfo>> {
            if self.fail {
                return Err(Error::UpstreamUnavailable("database down".into()));
            }
            Ok(self.games.get(id).cloned())
        }

        async fn deployment_frontends(&self, id: &str) -> CoreResult<Option<Vec<String>>> {
            if self.fail {
                return Err(Error::UpstreamUnavailable("database down".into()));
            }
            Ok(self.deployments.get(id).cloned())
        }
    }

    fn resolver_with(directory: StaticDirectory) -> (Resolver, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (
            Resolver::new(Arc::new(directory), store, "my.example.com"),
            dir,
        )
    }

    fn delegated(domain: &str, kind: DelegatedRecordKind, records: Vec<&str>) -> DelegatedRecord {
        DelegatedRecord {
            domain: domain.to_string(),
            kind,
            records: records.into_iter().map(String::from).collect(),
            ttl_seconds: 120,
            source_api_id: "api-eu-1".to_string(),
            api_key_id: Uuid::new_v4(),
            organization_id: "org-A".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            updated_at: Utc::now(),
        }
    }

    fn minecraft_java(host: &str, port: u16) -> GameServerInfo {
        GameServerInfo {
            host: host.to_string(),
            port: Some(port),
            game: GameKind::MinecraftJava,
        }
    }

    #[tokio::test]
    async fn test_srv_resolution_with_glue() {
        let mut directory = StaticDirectory::default();
        directory
            .games
            .insert("gs-42".to_string(), minecraft_java("198.51.100.7", 25565));
        let (resolver, _dir) = resolver_with(directory);

        let answer = resolver
            .answer("_minecraft._tcp.gs-42.my.example.com.", RecordType::SRV)
            .await
            .unwrap();

        assert_eq!(answer.answers.len(), 1);
        let srv = match answer.answers[0].data() {
            Some(RData::SRV(srv)) => srv,
            other => panic!("expected SRV, got {other:?}"),
        };
        assert_eq!(srv.port(), 25565);
        assert_eq!(srv.target().to_string(), "gs-42.my.example.com.");

        assert_eq!(answer.additionals.len(), 1);
        match answer.additionals[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "198.51.100.7".parse::<Ipv4Addr>().unwrap()),
            other => panic!("expected glue A, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_srv_proto_mismatch_is_nxdomain() {
        let mut directory = StaticDirectory::default();
        directory
            .games
            .insert("gs-42".to_string(), minecraft_java("198.51.100.7", 25565));
        let (resolver, _dir) = resolver_with(directory);

        // Java runs over TCP; a UDP query is incompatible.
        assert!(resolver
            .answer("_minecraft._udp.gs-42.my.example.com.", RecordType::SRV)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_game_server_a_record() {
        let mut directory = StaticDirectory::default();
        directory
            .games
            .insert("gs-42".to_string(), minecraft_java("198.51.100.7", 25565));
        let (resolver, _dir) = resolver_with(directory);

        let answer = resolver
            .answer("gs-42.my.example.com.", RecordType::A)
            .await
            .unwrap();
        match answer.answers[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "198.51.100.7".parse::<Ipv4Addr>().unwrap()),
            other => panic!("expected A, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deployment_resolves_to_frontends() {
        let mut directory = StaticDirectory::default();
        directory.deployments.insert(
            "deploy-7".to_string(),
            vec!["192.0.2.10".to_string(), "192.0.2.11".to_string()],
        );
        let (resolver, _dir) = resolver_with(directory);

        let answer = resolver
            .answer("deploy-7.my.example.com.", RecordType::A)
            .await
            .unwrap();
        assert_eq!(answer.answers.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_zone_is_nxdomain() {
        let (resolver, _dir) = resolver_with(StaticDirectory::default());
        assert!(resolver
            .answer("deploy-7.other.example.org.", RecordType::A)
            .await
            .is_none());
        assert!(resolver
            .answer("my.example.com.evil.com.", RecordType::A)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_resource_is_nxdomain() {
        let (resolver, _dir) = resolver_with(StaticDirectory::default());
        assert!(resolver
            .answer("gs-404.my.example.com.", RecordType::A)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_database_outage_degrades_to_delegation() {
        let directory = StaticDirectory {
            fail: true,
            ..Default::default()
        };
        let (resolver, _dir) = resolver_with(directory);
        resolver
            .store
            .upsert_delegated(&delegated(
                "gs-fed.my.example.com",
                DelegatedRecordKind::A,
                vec!["203.0.113.20"],
            ))
            .unwrap();

        let answer = resolver
            .answer("gs-fed.my.example.com.", RecordType::A)
            .await
            .unwrap();
        match answer.answers[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "203.0.113.20".parse::<Ipv4Addr>().unwrap()),
            other => panic!("expected A, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_database_takes_precedence_over_delegation() {
        let mut directory = StaticDirectory::default();
        directory
            .games
            .insert("gs-42".to_string(), minecraft_java("198.51.100.7", 25565));
        let (resolver, _dir) = resolver_with(directory);
        resolver
            .store
            .upsert_delegated(&delegated(
                "gs-42.my.example.com",
                DelegatedRecordKind::A,
                vec!["203.0.113.99"],
            ))
            .unwrap();

        let answer = resolver
            .answer("gs-42.my.example.com.", RecordType::A)
            .await
            .unwrap();
        match answer.answers[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, "198.51.100.7".parse::<Ipv4Addr>().unwrap()),
            other => panic!("expected A, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delegated_srv_fallback() {
        let (resolver, _dir) = resolver_with(StaticDirectory::default());
        resolver
            .store
            .upsert_delegated(&delegated(
                "_minecraft._tcp.gs-fed.my.example.com",
                DelegatedRecordKind::SRV,
                vec!["0 5 25565 mc.fed.example.net"],
            ))
            .unwrap();

        let answer = resolver
            .answer("_minecraft._tcp.gs-fed.my.example.com.", RecordType::SRV)
            .await
            .unwrap();
        match answer.answers[0].data() {
            Some(RData::SRV(srv)) => {
                assert_eq!(srv.port(), 25565);
                assert_eq!(srv.target().to_string(), "mc.fed.example.net.");
            }
            other => panic!("expected SRV, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_port_when_unset() {
        let mut directory = StaticDirectory::default();
        directory.games.insert(
            "gs-9".to_string(),
            GameServerInfo {
                host: "198.51.100.8".to_string(),
                port: None,
                game: GameKind::Rust,
            },
        );
        let (resolver, _dir) = resolver_with(directory);

        let answer = resolver
            .answer("_rust._udp.gs-9.my.example.com.", RecordType::SRV)
            .await
            .unwrap();
        match answer.answers[0].data() {
            Some(RData::SRV(srv)) => assert_eq!(srv.port(), 28015),
            other => panic!("expected SRV, got {other:?}"),
        }
    }
}
