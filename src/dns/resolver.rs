//! Secure-DNS resolver seam
//!
//! The secure transport itself (DoH or similar) is an external collaborator;
//! the core consumes it through [`SecureResolver`]: a raw forwarding path
//! for whole queries and a typed-query path for single domains.
//! [`BootstrapResolver`] is the built-in implementation that speaks plain
//! DNS to the configured bootstrap resolvers, with a TTL cache on typed
//! queries.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::DnsError;

/// Per-upstream exchange timeout
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum size of a UDP DNS response
const MAX_RESPONSE_SIZE: usize = 4096;

/// The black-box resolver interface the core depends on
#[async_trait]
pub trait SecureResolver: Send + Sync {
    /// Forward a raw query and return the raw response
    async fn forward_query(&self, query: &[u8]) -> Result<Vec<u8>, DnsError>;

    /// Resolve a single domain to addresses of the given record type
    async fn resolve(&self, domain: &str, record: RecordType) -> Result<Vec<IpAddr>, DnsError>;
}

/// Plain-DNS implementation over the configured bootstrap resolvers
pub struct BootstrapResolver {
    config: ResolverConfig,
    cache: Mutex<HashMap<(String, RecordType), CacheEntry>>,
}

struct CacheEntry {
    ips: Vec<IpAddr>,
    cached_at: Instant,
}

impl BootstrapResolver {
    /// Create a resolver from the config section
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        if !config.servers.is_empty() {
            debug!(
                "secure upstreams configured ({}); bootstrap path serves typed queries",
                config.servers.len()
            );
        }
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl)
    }

    fn cache_get(&self, domain: &str, record: RecordType) -> Option<Vec<IpAddr>> {
        let cache = self.cache.lock();
        let entry = cache.get(&(domain.to_string(), record))?;
        if entry.cached_at.elapsed() > self.cache_ttl() {
            return None;
        }
        Some(entry.ips.clone())
    }

    fn cache_put(&self, domain: &str, record: RecordType, ips: Vec<IpAddr>) {
        self.cache.lock().insert(
            (domain.to_string(), record),
            CacheEntry {
                ips,
                cached_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl SecureResolver for BootstrapResolver {
    async fn forward_query(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        for upstream in &self.config.resolvers {
            match plain_exchange(upstream, query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if self.config.verbose {
                        warn!("upstream {upstream} failed: {e}");
                    }
                }
            }
        }
        Err(DnsError::AllUpstreamsFailed)
    }

    async fn resolve(&self, domain: &str, record: RecordType) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(ips) = self.cache_get(domain, record) {
            return Ok(ips);
        }

        let name = Name::from_utf8(domain)
            .map_err(|e| DnsError::EncodeError(format!("bad name {domain}: {e}")))?;
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, record));
        let query = message
            .to_vec()
            .map_err(|e| DnsError::EncodeError(e.to_string()))?;

        let response = self.forward_query(&query).await?;
        let parsed = Message::from_vec(&response)
            .map_err(|e| DnsError::DecodeError(e.to_string()))?;

        let ips = extract_ips(&parsed);
        if ips.is_empty() {
            return Err(DnsError::NoRecords(domain.to_string()));
        }
        self.cache_put(domain, record, ips.clone());
        Ok(ips)
    }
}

/// One plain-DNS exchange over UDP with a single upstream
///
/// The upstream may be given without a port; 53 is assumed.
pub async fn plain_exchange(upstream: &str, query: &[u8]) -> Result<Vec<u8>, DnsError> {
    let addr = normalize_upstream(upstream).await?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.send_to(query, addr).await?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let (len, _) = tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| DnsError::UpstreamFailed {
            upstream: upstream.to_string(),
            reason: "timed out".into(),
        })??;
    buf.truncate(len);
    Ok(buf)
}

async fn normalize_upstream(upstream: &str) -> Result<SocketAddr, DnsError> {
    let upstream = upstream.trim();
    if upstream.is_empty() {
        return Err(DnsError::UpstreamFailed {
            upstream: String::new(),
            reason: "resolver is empty".into(),
        });
    }
    if let Ok(addr) = upstream.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let with_port = format!("{upstream}:53");
    if let Ok(addr) = with_port.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(&with_port)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| DnsError::UpstreamFailed {
            upstream: upstream.to_string(),
            reason: "unresolvable upstream".into(),
        })
}

/// A/AAAA addresses in a response's answer section
#[must_use]
pub fn extract_ips(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}
