//! Embedded DNS server
//!
//! Listens on UDP and TCP, forwards queries through the secure resolver (or
//! a matching custom upstream), writes the response to the client and only
//! then dispatches the observer task. A counting semaphore bounds the number
//! of concurrently in-flight handler tasks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::DnsServerConfig;
use crate::error::DnsError;
use crate::rules::pattern;

use super::observer::ResolverObserver;
use super::resolver::{extract_ips, plain_exchange, SecureResolver};

/// Maximum DNS message size accepted over either transport
const MAX_MESSAGE_SIZE: usize = 4096;

/// A custom-resolve rule: queries matching the pattern go to this upstream
#[derive(Debug, Clone)]
struct CustomRule {
    upstream: String,
    pattern: String,
}

struct ServerInner {
    config: DnsServerConfig,
    custom_rules: Vec<CustomRule>,
    semaphore: Semaphore,
    resolver: Arc<dyn SecureResolver>,
    observer: Arc<ResolverObserver>,
}

/// A bound DNS server, ready to serve until shutdown
pub struct DnsServer {
    inner: Arc<ServerInner>,
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
}

impl DnsServer {
    /// Bind the UDP and TCP listeners
    ///
    /// Invalid custom-resolve patterns are logged and skipped; they never
    /// prevent the server from starting.
    ///
    /// # Errors
    ///
    /// `DnsError::BindError` when either socket cannot be bound.
    pub async fn bind(
        config: DnsServerConfig,
        resolver: Arc<dyn SecureResolver>,
        observer: Arc<ResolverObserver>,
    ) -> Result<Self, DnsError> {
        let mut custom_rules = Vec::new();
        for (upstream, patterns) in &config.custom_resolve {
            for raw in patterns {
                if let Err(e) = pattern::validate(raw) {
                    error!("invalid custom-resolve pattern {raw:?}: {e}");
                    continue;
                }
                custom_rules.push(CustomRule {
                    upstream: upstream.clone(),
                    pattern: raw.clone(),
                });
            }
        }

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        let udp = UdpSocket::bind(addr).await.map_err(|e| DnsError::BindError {
            port: config.port,
            reason: e.to_string(),
        })?;
        let tcp = TcpListener::bind(addr).await.map_err(|e| DnsError::BindError {
            port: config.port,
            reason: e.to_string(),
        })?;

        info!("DNS server listening on :{}", config.port);

        let inner = Arc::new(ServerInner {
            semaphore: Semaphore::new(config.max_concurrent),
            custom_rules,
            config,
            resolver,
            observer,
        });

        Ok(Self {
            inner,
            udp: Arc::new(udp),
            tcp,
        })
    }

    /// The bound port (useful when configured with port 0)
    ///
    /// # Errors
    ///
    /// Propagates the socket's `local_addr` failure.
    pub fn local_port(&self) -> Result<u16, DnsError> {
        Ok(self.udp.local_addr()?.port())
    }

    /// Serve until the shutdown channel fires
    pub async fn run_until_shutdown(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DnsError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            tokio::select! {
                result = self.udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let data = buf[..len].to_vec();
                            let inner = Arc::clone(&self.inner);
                            let socket = Arc::clone(&self.udp);
                            tokio::spawn(async move {
                                handle_udp(inner, socket, data, peer).await;
                            });
                        }
                        Err(e) => warn!("DNS UDP recv error: {e}"),
                    }
                }
                result = self.tcp.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let inner = Arc::clone(&self.inner);
                            tokio::spawn(async move {
                                if let Err(e) = handle_tcp(inner, stream, peer).await {
                                    debug!("DNS TCP connection from {peer} ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("DNS TCP accept error: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("DNS server shutdown");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_udp(inner: Arc<ServerInner>, socket: Arc<UdpSocket>, data: Vec<u8>, peer: SocketAddr) {
    let Some(response) = handle_query(&inner, &data, peer).await else {
        return;
    };
    if let Err(e) = socket.send_to(&response.bytes, peer).await {
        warn!("DNS UDP send to {peer} failed: {e}");
        return;
    }
    dispatch_observer(&inner, response);
}

async fn handle_tcp(
    inner: Arc<ServerInner>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), DnsError> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(DnsError::DecodeError(format!("bad TCP length {len}")));
        }
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let Some(response) = handle_query(&inner, &data, peer).await else {
            continue;
        };
        let len = u16::try_from(response.bytes.len())
            .map_err(|_| DnsError::EncodeError("response too large for TCP".into()))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&response.bytes).await?;
        stream.flush().await?;

        dispatch_observer(&inner, response);
    }
}

/// A produced response plus the observation it carries
struct HandledResponse {
    bytes: Vec<u8>,
    domain: String,
    ips: Vec<IpAddr>,
}

/// Observer work happens on its own task so the response writer (which has
/// already run by now) is never coupled to reconciliation latency.
fn dispatch_observer(inner: &Arc<ServerInner>, response: HandledResponse) {
    if response.domain.is_empty() || response.ips.is_empty() {
        return;
    }
    let observer = Arc::clone(&inner.observer);
    tokio::spawn(async move {
        observer.observe(&response.domain, &response.ips).await;
    });
}

async fn handle_query(
    inner: &Arc<ServerInner>,
    data: &[u8],
    peer: SocketAddr,
) -> Option<HandledResponse> {
    let _permit = inner.semaphore.acquire().await.ok()?;

    let query = match Message::from_vec(data) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping malformed DNS query from {peer}: {e}");
            return None;
        }
    };
    let domain = query
        .queries()
        .first()
        .map(|q| q.name().to_utf8().trim_end_matches('.').to_string())
        .unwrap_or_default();

    if inner.config.verbose {
        info!("DNS query from {peer}: {domain}");
    }

    let response_bytes = match custom_upstream(inner, &domain) {
        Some(upstream) => {
            if inner.config.verbose {
                info!("domain {domain} resolved via custom upstream {upstream}");
            }
            match plain_exchange(&upstream, data).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("custom upstream {upstream} failed for {domain}: {e}");
                    return None;
                }
            }
        }
        None => match inner.resolver.forward_query(data).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("upstream forwarding failed for {domain}: {e}");
                return None;
            }
        },
    };

    // Re-stamp the client's transaction id; upstreams may have rewritten it
    let (bytes, ips) = match Message::from_vec(&response_bytes) {
        Ok(mut message) => {
            message.set_id(query.id());
            let ips = extract_ips(&message);
            match message.to_vec() {
                Ok(bytes) => (bytes, ips),
                Err(_) => (response_bytes, ips),
            }
        }
        Err(e) => {
            debug!("unparseable upstream response for {domain}: {e}");
            (response_bytes, Vec::new())
        }
    };

    if inner.config.verbose {
        info!("DNS response to {peer} for {domain}: {} answers", ips.len());
    }

    Some(HandledResponse { bytes, domain, ips })
}

fn custom_upstream(inner: &Arc<ServerInner>, domain: &str) -> Option<String> {
    if domain.is_empty() {
        return None;
    }
    inner
        .custom_rules
        .iter()
        .find(|rule| pattern::matches(&rule.pattern, domain))
        .map(|rule| rule.upstream.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsServerConfig;
    use crate::error::DnsError;
    use crate::ipset::runner::mock::ScriptedRunner;
    use crate::ipset::{CommandRunner, SetTracker};
    use crate::rules::RuleStore;
    use async_trait::async_trait;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Resolver double answering every query with a fixed A record after an
    /// optional delay
    struct FixedResolver {
        answer: Ipv4Addr,
        delay: Duration,
    }

    #[async_trait]
    impl SecureResolver for FixedResolver {
        async fn forward_query(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let query = Message::from_vec(query)
                .map_err(|e| DnsError::DecodeError(e.to_string()))?;
            let name = query.queries().first().unwrap().name().clone();
            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .add_answer(Record::from_rdata(name, 60, RData::A(A(self.answer))));
            response
                .to_vec()
                .map_err(|e| DnsError::EncodeError(e.to_string()))
        }

        async fn resolve(
            &self,
            _domain: &str,
            _record: RecordType,
        ) -> Result<Vec<IpAddr>, DnsError> {
            Ok(vec![IpAddr::V4(self.answer)])
        }
    }

    struct Fixture {
        _dir: TempDir,
        scripted: Arc<ScriptedRunner>,
        rules: Arc<RuleStore>,
        shutdown: broadcast::Sender<()>,
        port: u16,
    }

    async fn start_server(resolver: Arc<dyn SecureResolver>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        let tracker = Arc::new(SetTracker::new(dynamic, false, false, 0));
        let rules = Arc::new(RuleStore::new(
            dir.path().join("rules.yaml"),
            Arc::clone(&tracker),
        ));
        rules.init().await.unwrap();
        let observer = Arc::new(ResolverObserver::new(Arc::clone(&rules), tracker));

        let config = DnsServerConfig {
            port: 0,
            ..DnsServerConfig::default()
        };
        let server = DnsServer::bind(config, resolver, observer).await.unwrap();
        let port = server.local_port().unwrap();

        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = server.run_until_shutdown(rx).await;
        });

        Fixture {
            _dir: dir,
            scripted,
            rules,
            shutdown,
            port,
        }
    }

    fn build_query(domain: &str) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(0x4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_utf8(domain).unwrap(),
                RecordType::A,
            ));
        message.to_vec().unwrap()
    }

    async fn udp_query(port: u16, domain: &str) -> Message {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        socket
            .send_to(&build_query(domain), ("127.0.0.1", port))
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("response timed out")
            .unwrap();
        Message::from_vec(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_udp_query_answered_with_client_id() {
        let fixture = start_server(Arc::new(FixedResolver {
            answer: Ipv4Addr::new(198, 51, 100, 7),
            delay: Duration::ZERO,
        }))
        .await;

        let response = udp_query(fixture.port, "a.example.test.").await;
        assert_eq!(response.id(), 0x4242);
        assert_eq!(
            extract_ips(&response),
            vec!["198.51.100.7".parse::<IpAddr>().unwrap()]
        );
        let _ = fixture.shutdown.send(());
    }

    #[tokio::test]
    async fn test_tcp_query_answered() {
        let fixture = start_server(Arc::new(FixedResolver {
            answer: Ipv4Addr::new(203, 0, 113, 9),
            delay: Duration::ZERO,
        }))
        .await;

        let mut stream = TcpStream::connect(("127.0.0.1", fixture.port)).await.unwrap();
        let query = build_query("tcp.example.test.");
        let len = u16::try_from(query.len()).unwrap();
        stream.write_all(&len.to_be_bytes()).await.unwrap();
        stream.write_all(&query).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut data = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut data).await.unwrap();

        let response = Message::from_vec(&data).unwrap();
        assert_eq!(
            extract_ips(&response),
            vec!["203.0.113.9".parse::<IpAddr>().unwrap()]
        );
        let _ = fixture.shutdown.send(());
    }

    #[tokio::test]
    async fn test_matching_answer_feeds_kernel_set() {
        let fixture = start_server(Arc::new(FixedResolver {
            answer: Ipv4Addr::new(198, 51, 100, 7),
            delay: Duration::ZERO,
        }))
        .await;
        fixture
            .rules
            .add(crate::egress::EgressType::Xray, "xray1", "*.example.test")
            .await
            .unwrap();

        udp_query(fixture.port, "a.example.test.").await;

        // The observer runs asynchronously after the response
        let mut seen = false;
        for _ in 0..100 {
            if fixture.scripted.saw(
                "add vpner-Xray-xray1 198.51.100.7 \
                 comment rule=*.example.test|domain=a.example.test -exist",
            ) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "observer never reconciled the answer");
        let _ = fixture.shutdown.send(());
    }

    #[tokio::test]
    async fn test_response_not_blocked_by_observer() {
        // An ipset runner that blocks forever stalls any observer task
        struct HangingRunner;
        #[async_trait]
        impl CommandRunner for HangingRunner {
            async fn run(
                &self,
                _program: &str,
                _args: &[&str],
            ) -> std::io::Result<std::process::Output> {
                std::future::pending().await
            }
            async fn run_with_stdin(
                &self,
                _program: &str,
                _args: &[&str],
                _input: &[u8],
            ) -> std::io::Result<std::process::Output> {
                std::future::pending().await
            }
        }

        let dir = TempDir::new().unwrap();
        let dynamic: Arc<dyn CommandRunner> = Arc::new(HangingRunner);
        let tracker = Arc::new(SetTracker::new(dynamic, false, false, 0));
        let rules = Arc::new(RuleStore::new(
            dir.path().join("rules.yaml"),
            Arc::clone(&tracker),
        ));
        rules.init().await.unwrap();
        rules
            .add(crate::egress::EgressType::Xray, "xray1", "*.example.test")
            .await
            .unwrap();
        let observer = Arc::new(ResolverObserver::new(Arc::clone(&rules), tracker));

        let config = DnsServerConfig {
            port: 0,
            ..DnsServerConfig::default()
        };
        let server = DnsServer::bind(
            config,
            Arc::new(FixedResolver {
                answer: Ipv4Addr::new(198, 51, 100, 7),
                delay: Duration::ZERO,
            }),
            observer,
        )
        .await
        .unwrap();
        let port = server.local_port().unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = server.run_until_shutdown(rx).await;
        });

        // Several queries in a row all get answered although every observer
        // task is stuck inside the hanging runner
        for _ in 0..3 {
            let response = udp_query(port, "a.example.test.").await;
            assert!(!extract_ips(&response).is_empty());
        }
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_custom_resolver_selection() {
        // A stub upstream on localhost answering any query
        let upstream = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = upstream.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let name = query.queries().first().unwrap().name().clone();
                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .add_answer(Record::from_rdata(
                        name,
                        60,
                        RData::A(A(Ipv4Addr::new(10, 99, 0, 1))),
                    ));
                let _ = upstream
                    .send_to(&response.to_vec().unwrap(), peer)
                    .await;
            }
        });

        let dir = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        let tracker = Arc::new(SetTracker::new(dynamic, false, false, 0));
        let rules = Arc::new(RuleStore::new(
            dir.path().join("rules.yaml"),
            Arc::clone(&tracker),
        ));
        rules.init().await.unwrap();
        let observer = Arc::new(ResolverObserver::new(Arc::clone(&rules), tracker));

        let mut config = DnsServerConfig {
            port: 0,
            ..DnsServerConfig::default()
        };
        config
            .custom_resolve
            .insert(upstream_addr.to_string(), vec!["*.lan.test".into()]);

        // The secure resolver would answer differently; the custom upstream
        // must win for matching domains
        let server = DnsServer::bind(
            config,
            Arc::new(FixedResolver {
                answer: Ipv4Addr::new(198, 51, 100, 7),
                delay: Duration::ZERO,
            }),
            observer,
        )
        .await
        .unwrap();
        let port = server.local_port().unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = server.run_until_shutdown(rx).await;
        });

        let response = udp_query(port, "box.lan.test.").await;
        assert_eq!(
            extract_ips(&response),
            vec!["10.99.0.1".parse::<IpAddr>().unwrap()]
        );

        let response = udp_query(port, "other.test.").await;
        assert_eq!(
            extract_ips(&response),
            vec!["198.51.100.7".parse::<IpAddr>().unwrap()]
        );
        let _ = shutdown.send(());
    }
}
