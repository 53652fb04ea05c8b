//! DNS service wrapper: start/stop/status over the server lifecycle
//!
//! Start binds the sockets synchronously so callers see real bind failures,
//! then serves on a background task. Stop signals shutdown; the running flag
//! clears when the serve loop actually exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

use crate::config::DnsServerConfig;
use crate::error::DnsError;

use super::observer::ResolverObserver;
use super::resolver::SecureResolver;
use super::server::DnsServer;

/// Lifecycle wrapper around [`DnsServer`]
pub struct DnsService {
    config: DnsServerConfig,
    resolver: Arc<dyn SecureResolver>,
    observer: Arc<ResolverObserver>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    running: Arc<AtomicBool>,
}

impl DnsService {
    /// Create the service; nothing is bound until [`DnsService::start`]
    #[must_use]
    pub fn new(
        config: DnsServerConfig,
        resolver: Arc<dyn SecureResolver>,
        observer: Arc<ResolverObserver>,
    ) -> Self {
        Self {
            config,
            resolver,
            observer,
            shutdown: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind and start serving; a second start while running is a no-op
    ///
    /// # Errors
    ///
    /// `DnsError::BindError` when the configured port cannot be bound.
    pub async fn start(&self) -> Result<(), DnsError> {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            debug!("DNS service already running");
            return Ok(());
        }

        let server = DnsServer::bind(
            self.config.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.observer),
        )
        .await?;

        let (tx, rx) = broadcast::channel(1);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = server.run_until_shutdown(rx).await {
                error!("DNS server exited: {e}");
            }
            running.store(false, Ordering::SeqCst);
        });

        *shutdown = Some(tx);
        info!("DNS server started on :{}", self.config.port);
        Ok(())
    }

    /// Request shutdown; idempotent
    pub async fn stop(&self) {
        let mut shutdown = self.shutdown.lock().await;
        if let Some(tx) = shutdown.take() {
            let _ = tx.send(());
            info!("DNS server shutdown requested");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the serve loop is live
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
