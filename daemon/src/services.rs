//! Collaborators consumed by the core
//!
//! Player history, operator notification, VPN detection and reverse DNS
//! all sit behind traits so the session loop never depends on a concrete
//! backend, and tests can swap in fakes.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// How long a VPN verdict is trusted
pub const VPN_CACHE_TTL: Duration = Duration::from_secs(3600);

/// One connect as remembered by the history store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: u64,
    pub frontend: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub cookie: String,
}

#[async_trait]
pub trait PlayerHistory: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> std::io::Result<()>;

    /// Rows whose name, address, cookie or frontend contain `query`
    async fn search(&self, query: &str) -> std::io::Result<Vec<HistoryEntry>>;
}

/// Keeps nothing
pub struct NullHistory;

#[async_trait]
impl PlayerHistory for NullHistory {
    async fn record(&self, _entry: HistoryEntry) -> std::io::Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &str) -> std::io::Result<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }
}

/// Append-only JSON lines file
pub struct FileHistory {
    path: PathBuf,
    write: tokio::sync::Mutex<()>,
}

impl FileHistory {
    /// Open (creating if needed) the history file
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            write: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl PlayerHistory for FileHistory {
    async fn record(&self, entry: HistoryEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let _guard = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn search(&self, query: &str) -> std::io::Result<Vec<HistoryEntry>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let needle = query.to_lowercase();
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<HistoryEntry>(line).ok())
            .filter(|e| {
                e.name.to_lowercase().contains(&needle)
                    || e.frontend.to_lowercase().contains(&needle)
                    || e.cookie == query
                    || e.ip.is_some_and(|ip| ip.to_string().contains(query))
            })
            .collect())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str);
}

/// Writes notifications to the log instead of mailing them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) {
        info!("Notify {}: {} - {}", recipient, subject, body);
    }
}

#[async_trait]
pub trait VpnLookup: Send + Sync {
    async fn is_vpn(&self, ip: IpAddr) -> bool;

    /// Drop stale cached verdicts, if any are kept
    fn cleanup(&self) {}
}

/// Treats every address as residential
pub struct NoVpnLookup;

#[async_trait]
impl VpnLookup for NoVpnLookup {
    async fn is_vpn(&self, _ip: IpAddr) -> bool {
        false
    }
}

/// TTL cache in front of a slower lookup
pub struct CachedVpnLookup<L> {
    inner: L,
    cache: DashMap<IpAddr, (bool, Instant)>,
    ttl: Duration,
}

impl<L: VpnLookup> CachedVpnLookup<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[async_trait]
impl<L: VpnLookup> VpnLookup for CachedVpnLookup<L> {
    async fn is_vpn(&self, ip: IpAddr) -> bool {
        if let Some(hit) = self.cache.get(&ip) {
            let (verdict, at) = *hit;
            if at.elapsed() < self.ttl {
                return verdict;
            }
        }
        let verdict = self.inner.is_vpn(ip).await;
        self.cache.insert(ip, (verdict, Instant::now()));
        verdict
    }

    fn cleanup(&self) {
        let ttl = self.ttl;
        self.cache.retain(|_, (_, at)| at.elapsed() < ttl);
    }
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// PTR name for `ip`, without the trailing dot
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

pub struct NoResolver;

#[async_trait]
impl HostResolver for NoResolver {
    async fn reverse(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// System resolver backed PTR lookups
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("System resolver config unusable ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!("PTR lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

/// Bundle of collaborators threaded through the daemon
#[derive(Clone)]
pub struct Services {
    pub history: Arc<dyn PlayerHistory>,
    pub notifier: Arc<dyn Notifier>,
    pub vpn: Arc<dyn VpnLookup>,
    pub resolver: Arc<dyn HostResolver>,
}

impl Services {
    /// Inert collaborators, for tests and minimal setups
    pub fn offline() -> Self {
        Self {
            history: Arc::new(NullHistory),
            notifier: Arc::new(LogNotifier),
            vpn: Arc::new(NoVpnLookup),
            resolver: Arc::new(NoResolver),
        }
    }

    /// Collaborators for a running daemon: system DNS and a cached VPN verdict
    pub fn system(history: Arc<dyn PlayerHistory>) -> Self {
        Self {
            history,
            notifier: Arc::new(LogNotifier),
            vpn: Arc::new(CachedVpnLookup::new(NoVpnLookup, VPN_CACHE_TTL)),
            resolver: Arc::new(DnsResolver::from_system()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl VpnLookup for Counting {
        async fn is_vpn(&self, ip: IpAddr) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            ip.is_loopback()
        }
    }

    #[tokio::test]
    async fn test_vpn_cache_hits() {
        let cached = CachedVpnLookup::new(Counting(AtomicUsize::new(0)), Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(cached.is_vpn(ip).await);
        assert!(cached.is_vpn(ip).await);
        assert!(!cached.is_vpn("10.0.0.1".parse().unwrap()).await);
        assert_eq!(cached.inner.0.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn test_vpn_cache_expiry() {
        let cached = CachedVpnLookup::new(Counting(AtomicUsize::new(0)), Duration::ZERO);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        cached.is_vpn(ip).await;
        cached.is_vpn(ip).await;
        assert_eq!(cached.inner.0.load(Ordering::SeqCst), 2);
        cached.cleanup();
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_file_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = FileHistory::open(dir.path().join("history.jsonl")).unwrap();
        for (name, ip) in [("claire", "10.0.0.1"), ("bob", "10.0.0.2")] {
            history
                .record(HistoryEntry {
                    time: 1,
                    frontend: "dm".into(),
                    name: name.into(),
                    ip: Some(ip.parse().unwrap()),
                    cookie: format!("{name}-cookie"),
                })
                .await
                .unwrap();
        }

        assert_eq!(history.search("CLAIRE").await.unwrap().len(), 1);
        assert_eq!(history.search("10.0.0.2").await.unwrap()[0].name, "bob");
        assert_eq!(history.search("dm").await.unwrap().len(), 2);
        assert!(history.search("nobody").await.unwrap().is_empty());
    }
}
