//! Runtime composition and lifecycle
//!
//! Wires the components together, auto-starts what the configuration asks
//! for, restores firewall state for running chains, serves RPC until
//! cancellation and shuts everything down exactly once.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dns::{BootstrapResolver, DnsService, ResolverObserver, SecureResolver};
use crate::egress::EgressRouter;
use crate::error::{Result, VpnerError};
use crate::firewall::FirewallManager;
use crate::interfaces::InterfaceRegistry;
use crate::ipset::{check_tool, SetTracker, SystemRunner};
use crate::outbound::OutboundStore;
use crate::rpc::{RpcHandler, RpcServer};
use crate::rules::RuleStore;
use crate::supervisor::ProxySupervisor;

/// The composed daemon
pub struct Runtime {
    config: Config,
    dns: Arc<DnsService>,
    outbounds: Arc<OutboundStore>,
    supervisor: Arc<ProxySupervisor>,
    router: Arc<EgressRouter>,
    handler: Arc<RpcHandler>,
    shutdown_done: tokio::sync::Mutex<bool>,
}

impl Runtime {
    /// Build the component graph
    ///
    /// # Errors
    ///
    /// Startup-class errors only: missing/old external tools, unreadable
    /// persisted state, unusable config directory.
    pub async fn new(config: Config) -> Result<Self> {
        let runner = SystemRunner::shared();

        // The set tool gates startup; everything downstream assumes it
        check_tool(&runner).await?;

        let firewall = Arc::new(FirewallManager::new(Arc::clone(&runner)));
        firewall.init(config.network.enable_ipv6).await;
        let ipv6_enabled = config.network.enable_ipv6 && firewall.ipv6_available();

        let tracker = Arc::new(SetTracker::new(
            Arc::clone(&runner),
            ipv6_enabled,
            config.network.ipset_debug,
            config.network.stale_queries,
        ));

        let rules = Arc::new(RuleStore::new(
            config.paths.unblock_rules.clone(),
            Arc::clone(&tracker),
        ));
        rules.init().await?;

        let outbounds = Arc::new(OutboundStore::new(
            config.paths.outbound_dir.clone(),
            config.outbound_port_range(),
        )?);
        let supervisor = Arc::new(ProxySupervisor::new(Arc::clone(&outbounds)));

        let router = Arc::new(EgressRouter::new(
            firewall,
            Arc::clone(&tracker),
            vec![config.network.lan_interface.clone()],
            ipv6_enabled,
        ));

        let resolver: Arc<dyn SecureResolver> =
            Arc::new(BootstrapResolver::new(config.resolver.clone()));
        let observer = Arc::new(ResolverObserver::new(Arc::clone(&rules), tracker));
        let dns = Arc::new(DnsService::new(
            config.dns_server.clone(),
            resolver,
            observer,
        ));

        let interfaces = Arc::new(InterfaceRegistry::new(config.paths.interfaces.clone()));

        let handler = Arc::new(RpcHandler::new(
            Arc::clone(&dns),
            rules,
            Arc::clone(&outbounds),
            Arc::clone(&supervisor),
            Arc::clone(&router),
            interfaces,
        ));

        Ok(Self {
            config,
            dns,
            outbounds,
            supervisor,
            router,
            handler,
            shutdown_done: tokio::sync::Mutex::new(false),
        })
    }

    /// Run until the shutdown channel fires or the RPC server dies
    ///
    /// # Errors
    ///
    /// Returns the RPC server's fatal error, after shutting down cleanly.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.config.dns_server.running {
            info!("auto-starting DNS server");
            if let Err(e) = self.dns.start().await {
                self.shutdown().await;
                return Err(e.into());
            }
        }

        // Best-effort: one bad chain must not abort startup
        let outbounds = Arc::clone(&self.outbounds);
        let lister = move || {
            outbounds
                .list_auto_run()
                .map_err(|e| crate::error::SupervisorError::SpawnFailed {
                    name: "autostart".into(),
                    reason: e.to_string(),
                })
        };
        if let Err(e) = self.supervisor.start_all(lister).await {
            error!("failed to autostart proxy chains: {e}");
        }
        self.handler.restore_running_chains(true, true).await;

        let rpc = RpcServer::new(self.config.rpc.clone(), Arc::clone(&self.handler));
        let rpc_shutdown = rpc.shutdown_sender();
        let mut rpc_task = tokio::spawn(async move { rpc.run().await });

        let result = tokio::select! {
            _ = shutdown.recv() => {
                warn!("shutdown requested");
                let _ = rpc_shutdown.send(());
                match tokio::time::timeout(std::time::Duration::from_secs(5), &mut rpc_task).await
                {
                    Ok(Ok(result)) => result.map_err(VpnerError::from),
                    Ok(Err(join_err)) => {
                        error!("RPC server task failed: {join_err}");
                        Ok(())
                    }
                    Err(_) => {
                        rpc_task.abort();
                        Ok(())
                    }
                }
            }
            result = &mut rpc_task => match result {
                Ok(result) => {
                    if let Err(ref e) = result {
                        error!("RPC server exited: {e}");
                    }
                    result.map_err(VpnerError::from)
                }
                Err(join_err) => {
                    error!("RPC server task failed: {join_err}");
                    Ok(())
                }
            },
        };

        self.shutdown().await;
        result
    }

    /// Stop DNS, disable all egress routing, stop all children; idempotent
    pub async fn shutdown(&self) {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            return;
        }
        *done = true;

        info!("stopping DNS service");
        self.dns.stop().await;

        info!("disabling egress routing");
        self.router.shutdown().await;

        info!("stopping all proxy chains");
        self.supervisor.stop_all().await;

        info!("shutdown complete");
    }
}
