//! RPC listeners
//!
//! Serves the protocol over an optional TCP listener and an optional Unix
//! socket. Each connection is handled on its own task; frames are processed
//! sequentially per connection. When the TCP listener has auth enabled, the
//! first accepted frame must be an `Auth` request carrying the shared
//! password.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::RpcConfig;
use crate::error::RpcError;

use super::handler::RpcHandler;
use super::protocol::{
    decode_frame_payload, encode_frame, Request, Response, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};

/// The RPC server over both listener kinds
pub struct RpcServer {
    config: RpcConfig,
    handler: Arc<RpcHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Create a server; nothing is bound until [`RpcServer::run`]
    #[must_use]
    pub fn new(config: RpcConfig, handler: Arc<RpcHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            shutdown_tx,
        }
    }

    /// A sender that stops the server when fired
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the enabled listeners and serve until shutdown
    ///
    /// # Errors
    ///
    /// `RpcError::BindError` when a configured listener cannot be bound.
    pub async fn run(&self) -> Result<(), RpcError> {
        let mut tasks = Vec::new();

        if self.config.tcp.enabled {
            let listener = TcpListener::bind(&self.config.tcp.address)
                .await
                .map_err(|e| RpcError::BindError {
                    address: self.config.tcp.address.clone(),
                    reason: e.to_string(),
                })?;
            info!("RPC listening on {} (tcp)", self.config.tcp.address);

            let handler = Arc::clone(&self.handler);
            let require_auth = self.config.tcp.auth;
            let password = self.config.auth.password.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => match result {
                            Ok((stream, peer)) => {
                                debug!("RPC connection from {peer}");
                                let handler = Arc::clone(&handler);
                                let password = password.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream, handler, require_auth, password,
                                    )
                                    .await
                                    {
                                        debug!("RPC connection from {peer} ended: {e}");
                                    }
                                });
                            }
                            Err(e) => error!("RPC TCP accept error: {e}"),
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        if self.config.unix.enabled {
            let path = self.config.unix.path.clone();
            let listener = bind_unix(&path)?;
            info!("RPC listening on {path:?} (unix)");

            let handler = Arc::clone(&self.handler);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => match result {
                            Ok((stream, _)) => {
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream, handler, false, String::new(),
                                    )
                                    .await
                                    {
                                        debug!("RPC unix connection ended: {e}");
                                    }
                                });
                            }
                            Err(e) => error!("RPC unix accept error: {e}"),
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        if tasks.is_empty() {
            warn!("RPC has no enabled listeners");
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let _ = shutdown_rx.recv().await;
            return Ok(());
        }

        for task in tasks {
            let _ = task.await;
        }

        if self.config.unix.enabled && self.config.unix.path.exists() {
            let _ = std::fs::remove_file(&self.config.unix.path);
        }
        info!("RPC server stopped");
        Ok(())
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener, RpcError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| RpcError::BindError {
            address: path.display().to_string(),
            reason: format!("failed to remove existing socket: {e}"),
        })?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| RpcError::BindError {
                address: path.display().to_string(),
                reason: format!("failed to create parent directory: {e}"),
            })?;
        }
    }
    let listener = UnixListener::bind(path).map_err(|e| RpcError::BindError {
        address: path.display().to_string(),
        reason: e.to_string(),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660));
    }

    Ok(listener)
}

/// Serve one connection until EOF
async fn handle_connection<S>(
    mut stream: S,
    handler: Arc<RpcHandler>,
    require_auth: bool,
    password: String,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut authed = !require_auth;

    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            let response = Response::error(format!("Message too large: {len} bytes"));
            send_response(&mut stream, &response).await?;
            return Err(RpcError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let request: Request = match decode_frame_payload(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid RPC request: {e}");
                let response = Response::error(format!("Invalid request format: {e}"));
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        if let Request::Auth { password: given } = &request {
            let response = if !require_auth {
                authed = true;
                Response::success("authentication not required")
            } else if *given == password {
                authed = true;
                Response::success("authenticated")
            } else {
                Response::error("invalid password")
            };
            send_response(&mut stream, &response).await?;
            continue;
        }

        if !authed {
            send_response(&mut stream, &Response::error("authentication required")).await?;
            continue;
        }

        let response = handler.handle(request).await;
        send_response(&mut stream, &response).await?;
    }
}

async fn send_response<S>(stream: &mut S, response: &Response) -> Result<(), RpcError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_frame(response)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Minimal client for the CLI and tests
pub enum RpcClient {
    /// Connected over TCP
    Tcp(TcpStream),
    /// Connected over a Unix socket
    Unix(UnixStream),
}

impl RpcClient {
    /// Connect over TCP
    pub async fn connect_tcp(address: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self::Tcp(stream))
    }

    /// Connect over a Unix socket
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::Unix(stream))
    }

    /// Send one request and read one response
    pub async fn send(&mut self, request: &Request) -> Result<Response, RpcError> {
        match self {
            Self::Tcp(stream) => exchange(stream, request).await,
            Self::Unix(stream) => exchange(stream, request).await,
        }
    }
}

async fn exchange<S>(stream: &mut S, request: &Request) -> Result<Response, RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = encode_frame(request)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RpcError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    decode_frame_payload(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DnsServerConfig, ResolverConfig, RpcAuthConfig, RpcTcpConfig, RpcUnixConfig,
    };
    use crate::dns::{BootstrapResolver, DnsService, ResolverObserver};
    use crate::egress::EgressRouter;
    use crate::firewall::FirewallManager;
    use crate::interfaces::InterfaceRegistry;
    use crate::ipset::runner::mock::ScriptedRunner;
    use crate::ipset::{CommandRunner, SetTracker};
    use crate::outbound::OutboundStore;
    use crate::rpc::protocol::GenericResult;
    use crate::rules::RuleStore;
    use crate::supervisor::ProxySupervisor;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn build_handler(dir: &TempDir) -> Arc<RpcHandler> {
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted;
        let tracker = Arc::new(SetTracker::new(Arc::clone(&dynamic), false, false, 0));
        let rules = Arc::new(RuleStore::new(
            dir.path().join("rules.yaml"),
            Arc::clone(&tracker),
        ));
        rules.init().await.unwrap();
        let outbounds = Arc::new(
            OutboundStore::new(dir.path().join("configs"), (27000, 28000)).unwrap(),
        );
        let supervisor = Arc::new(ProxySupervisor::with_program(
            Arc::clone(&outbounds),
            "true",
            Duration::from_millis(50),
        ));
        let firewall = Arc::new(FirewallManager::new(Arc::clone(&dynamic)));
        let router = Arc::new(EgressRouter::new(
            firewall,
            Arc::clone(&tracker),
            vec!["br0".into()],
            false,
        ));
        let observer = Arc::new(ResolverObserver::new(
            Arc::clone(&rules),
            Arc::clone(&tracker),
        ));
        let resolver = Arc::new(BootstrapResolver::new(ResolverConfig::default()));
        let dns = Arc::new(DnsService::new(
            DnsServerConfig {
                port: 0,
                ..DnsServerConfig::default()
            },
            resolver,
            observer,
        ));
        let interfaces = Arc::new(InterfaceRegistry::with_status_url(
            dir.path().join("interfaces.yaml"),
            "http://127.0.0.1:1/rci/show/interface",
        ));
        Arc::new(RpcHandler::new(
            dns, rules, outbounds, supervisor, router, interfaces,
        ))
    }

    #[tokio::test]
    async fn test_unix_round_trip() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("vpnerd.sock");
        let config = RpcConfig {
            tcp: RpcTcpConfig::default(),
            unix: RpcUnixConfig {
                enabled: true,
                path: socket_path.clone(),
            },
            auth: RpcAuthConfig::default(),
        };

        let handler = build_handler(&dir).await;
        let server = RpcServer::new(config, handler);
        let shutdown = server.shutdown_sender();
        let server_task = tokio::spawn(async move { server.run().await });

        // Wait for the socket to appear
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut client = RpcClient::connect_unix(&socket_path).await.unwrap();
        let response = client.send(&Request::RuleList).await.unwrap();
        let Response::RuleList { rules } = response else {
            panic!("expected listing");
        };
        assert!(rules.is_empty());

        // Multiple requests on the same connection
        let response = client
            .send(&Request::DnsManage {
                action: crate::rpc::protocol::ManageAction::Status,
            })
            .await
            .unwrap();
        assert!(!response.is_error());

        let _ = shutdown.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
    }

    #[tokio::test]
    async fn test_tcp_auth_gate() {
        let dir = TempDir::new().unwrap();
        let config = RpcConfig {
            tcp: RpcTcpConfig {
                enabled: true,
                address: "127.0.0.1:0".into(),
                auth: true,
            },
            unix: RpcUnixConfig::default(),
            auth: RpcAuthConfig {
                password: "hunter2".into(),
            },
        };

        // Bind manually to learn the ephemeral port, then hand the address
        // to the server config
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = probe.local_addr().unwrap().to_string();
        drop(probe);
        let config = RpcConfig {
            tcp: RpcTcpConfig {
                enabled: true,
                address: address.clone(),
                auth: true,
            },
            ..config
        };

        let handler = build_handler(&dir).await;
        let server = RpcServer::new(config, handler);
        let shutdown = server.shutdown_sender();
        let server_task = tokio::spawn(async move { server.run().await });

        let mut client = None;
        for _ in 0..100 {
            if let Ok(c) = RpcClient::connect_tcp(&address).await {
                client = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut client = client.expect("server never came up");

        // Request before auth is refused
        let response = client.send(&Request::RuleList).await.unwrap();
        match response {
            Response::Result(GenericResult::Error { message }) => {
                assert!(message.contains("authentication required"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Wrong password is refused
        let response = client
            .send(&Request::Auth {
                password: "wrong".into(),
            })
            .await
            .unwrap();
        assert!(response.is_error());

        // Right password unlocks the connection
        let response = client
            .send(&Request::Auth {
                password: "hunter2".into(),
            })
            .await
            .unwrap();
        assert!(!response.is_error());

        let response = client.send(&Request::RuleList).await.unwrap();
        assert!(matches!(response, Response::RuleList { .. }));

        let _ = shutdown.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
    }
}
