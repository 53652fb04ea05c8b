//! Stateless RPC handler
//!
//! Translates requests into calls on the stores, the supervisor and the
//! egress router. Expected failures become the error side of the generic
//! envelope; no handler holds state across calls.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::dns::DnsService;
use crate::egress::{EgressRouter, EgressType};
use crate::interfaces::InterfaceRegistry;
use crate::ipset::IpFamily;
use crate::outbound::OutboundStore;
use crate::rules::{pattern, RuleStore};
use crate::supervisor::ProxySupervisor;

use super::protocol::{
    InterfaceEntry, ManageAction, OutboundEntry, Request, Response, RuleEntry, RuleSpec,
};

/// The RPC handler and its collaborators
pub struct RpcHandler {
    dns: Arc<DnsService>,
    rules: Arc<RuleStore>,
    outbounds: Arc<OutboundStore>,
    supervisor: Arc<ProxySupervisor>,
    router: Arc<EgressRouter>,
    interfaces: Arc<InterfaceRegistry>,
}

impl RpcHandler {
    /// Wire up the handler
    #[must_use]
    pub fn new(
        dns: Arc<DnsService>,
        rules: Arc<RuleStore>,
        outbounds: Arc<OutboundStore>,
        supervisor: Arc<ProxySupervisor>,
        router: Arc<EgressRouter>,
        interfaces: Arc<InterfaceRegistry>,
    ) -> Self {
        Self {
            dns,
            rules,
            outbounds,
            supervisor,
            router,
            interfaces,
        }
    }

    /// Handle one request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            // Auth frames are consumed by the server layer
            Request::Auth { .. } => Response::error("unexpected auth frame"),

            Request::DnsManage { action } => self.dns_manage(action).await,

            Request::RuleList => self.rule_list().await,
            Request::RuleAdd { chain, pattern } => self.rule_add(&chain, &pattern).await,
            Request::RuleDel { pattern } => self.rule_del(&pattern).await,
            Request::RuleDeleteFile => self.rule_delete_file().await,
            Request::RuleImportFile { rules } => self.rule_import(rules).await,

            Request::InterfaceList => self.interface_list(),
            Request::InterfaceScan => self.interface_scan().await,
            Request::InterfaceAdd { id } => self.interface_add(&id).await,
            Request::InterfaceDel { id } => self.interface_del(&id).await,

            Request::OutboundList => self.outbound_list().await,
            Request::OutboundCreate { link, auto_run } => {
                self.outbound_create(&link, auto_run).await
            }
            Request::OutboundDelete { name } => self.outbound_delete(&name).await,
            Request::OutboundManage { name, action } => self.outbound_manage(&name, action).await,
            Request::OutboundSetAutorun { name, auto_run } => {
                self.outbound_set_autorun(&name, auto_run)
            }

            Request::HookRestore { family } => self.hook_restore(family).await,
        }
    }

    async fn dns_manage(&self, action: ManageAction) -> Response {
        match action {
            ManageAction::Start => match self.dns.start().await {
                Ok(()) => Response::success("DNS server started successfully"),
                Err(e) => Response::error(format!("Failed to start DNS server: {e}")),
            },
            ManageAction::Stop => {
                self.dns.stop().await;
                Response::success("DNS server stopped successfully")
            }
            ManageAction::Status => {
                let status = if self.dns.is_running() { "RUNNING" } else { "DOWN" };
                Response::success(format!("DNS server status: {status}"))
            }
            ManageAction::Restart => {
                self.dns.stop().await;
                match self.dns.start().await {
                    Ok(()) => Response::success("DNS server restarted successfully"),
                    Err(e) => Response::error(format!("Failed to restart DNS server: {e}")),
                }
            }
        }
    }

    async fn rule_list(&self) -> Response {
        let snapshot = self.rules.get_all().await;
        let rules = snapshot
            .iter()
            .map(|(egress, chain, patterns)| RuleEntry {
                egress: egress.to_string(),
                chain: chain.to_string(),
                patterns: patterns.to_vec(),
            })
            .collect();
        Response::RuleList { rules }
    }

    /// A rule's chain must name a managed proxy chain or a tracked interface;
    /// the chain's egress type follows from that binding.
    async fn resolve_chain_type(&self, chain: &str) -> Result<EgressType, Response> {
        if self.outbounds.is_managed_chain(chain) {
            return Ok(EgressType::Xray);
        }
        match self.interfaces.tracked_type(chain) {
            Ok(Some(egress)) => Ok(egress),
            Ok(None) => Err(Response::error(format!(
                "Chain name '{chain}' does not exist"
            ))),
            Err(e) => Err(Response::error(format!(
                "Failed to load interfaces: {e}"
            ))),
        }
    }

    async fn rule_add(&self, chain: &str, new_pattern: &str) -> Response {
        if chain.is_empty() {
            return Response::error("Chain name is required");
        }
        if let Err(e) = pattern::validate(new_pattern) {
            return Response::error(format!("Invalid pattern: {e}"));
        }
        let egress = match self.resolve_chain_type(chain).await {
            Ok(egress) => egress,
            Err(response) => return response,
        };
        match self.rules.add(egress, chain, new_pattern).await {
            Ok(()) => Response::success("Rule added successfully"),
            Err(e) => Response::error(format!("Failed to add rule: {e}")),
        }
    }

    async fn rule_del(&self, target: &str) -> Response {
        if let Err(e) = pattern::validate(target) {
            return Response::error(format!("Invalid pattern: {e}"));
        }
        let Some((egress, chain)) = self.rules.find_pattern(target).await else {
            return Response::error("Rule does not exist");
        };
        match self.rules.delete(egress, &chain, target).await {
            Ok(()) => Response::success("Rule deleted successfully"),
            Err(e) => Response::error(format!("Failed to delete rule: {e}")),
        }
    }

    async fn rule_delete_file(&self) -> Response {
        match self.rules.clear().await {
            Ok(()) => Response::success("All rules deleted"),
            Err(e) => Response::error(format!("Failed to delete rules: {e}")),
        }
    }

    async fn rule_import(&self, specs: Vec<RuleSpec>) -> Response {
        let mut imported = 0usize;
        let mut failures = Vec::new();
        for spec in specs {
            let egress: EgressType = match spec.egress.parse() {
                Ok(egress) => egress,
                Err(e) => {
                    failures.push(format!("{}/{}: {e}", spec.chain, spec.pattern));
                    continue;
                }
            };
            match self.rules.add(egress, &spec.chain, &spec.pattern).await {
                Ok(()) => imported += 1,
                Err(e) => failures.push(format!("{}/{}: {e}", spec.chain, spec.pattern)),
            }
        }
        if failures.is_empty() {
            Response::success(format!("Imported {imported} rules"))
        } else {
            Response::error(format!(
                "Imported {imported} rules, {} failed: {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }

    fn interface_list(&self) -> Response {
        match self.interfaces.list() {
            Ok(tracked) => Response::InterfaceList {
                interfaces: tracked
                    .into_iter()
                    .map(|(id, iface)| InterfaceEntry {
                        id,
                        kind: iface.kind,
                        description: iface.description,
                        state: iface.state,
                        added: true,
                    })
                    .collect(),
            },
            Err(e) => Response::error(format!("Failed to load interfaces: {e}")),
        }
    }

    async fn interface_scan(&self) -> Response {
        let live = match self.interfaces.scan().await {
            Ok(live) => live,
            Err(e) => return Response::error(format!("Failed to scan interfaces: {e}")),
        };
        let tracked: HashSet<String> = match self.interfaces.list() {
            Ok(tracked) => tracked.into_keys().collect(),
            Err(e) => return Response::error(format!("Failed to load saved interfaces: {e}")),
        };
        Response::InterfaceList {
            interfaces: live
                .into_iter()
                .map(|(id, iface)| InterfaceEntry {
                    added: tracked.contains(&id),
                    id,
                    kind: iface.kind,
                    description: iface.description,
                    state: iface.state,
                })
                .collect(),
        }
    }

    async fn interface_add(&self, id: &str) -> Response {
        if id.is_empty() {
            return Response::error("interface id is required");
        }
        if let Err(e) = self.interfaces.add(id).await {
            return Response::error(format!("Failed to add interface: {e}"));
        }
        // Bind the interface's mark routing right away; its set fills as
        // rules and answers arrive
        if let Ok(Some(egress)) = self.interfaces.tracked_type(id) {
            let device = self
                .interfaces
                .list()
                .ok()
                .and_then(|tracked| tracked.get(id).map(|i| i.system_name.clone()))
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| id.to_string());
            if let Err(e) = self.router.apply_device(egress, id, &device).await {
                warn!("failed to apply routing for interface {id}: {e}");
            }
        }
        Response::success(format!("Interface added successfully: {id}"))
    }

    async fn interface_del(&self, id: &str) -> Response {
        if id.is_empty() {
            return Response::error("interface id is required");
        }
        // Cascade: drop the interface's rule chain and routing first
        if let Ok(Some(egress)) = self.interfaces.tracked_type(id) {
            if let Err(e) = self.router.remove(egress, id).await {
                warn!("failed to remove routing for interface {id}: {e}");
            }
            if let Err(e) = self.rules.delete_chain(egress, id).await {
                return Response::error(format!("Failed to delete unblock chain: {e}"));
            }
        }
        match self.interfaces.remove(id) {
            Ok(_) => Response::success(format!("Interface deleted successfully: {id}")),
            Err(e) => Response::error(format!("Failed to delete interface: {e}")),
        }
    }

    async fn outbound_list(&self) -> Response {
        let infos = match self.outbounds.list_info() {
            Ok(infos) => infos,
            Err(e) => return Response::error(format!("Failed to retrieve proxy list: {e}")),
        };
        let mut chains = Vec::with_capacity(infos.len());
        for (name, info) in infos {
            let running = self.supervisor.is_running(&name).await;
            chains.push(OutboundEntry {
                chain: name,
                protocol: info.protocol,
                host: info.host,
                port: info.port,
                auto_run: info.auto_run,
                running,
                inbound_port: info.inbound_port,
            });
        }
        Response::OutboundList { chains }
    }

    async fn outbound_create(&self, link: &str, auto_run: bool) -> Response {
        let name = match self.outbounds.create(link, auto_run) {
            Ok(name) => name,
            Err(e) => return Response::error(format!("Failed to create proxy chain: {e}")),
        };
        if auto_run {
            if let Err(e) = self.supervisor.start(&name).await {
                return Response::error(format!(
                    "Proxy chain created as {name} but failed to start: {e}"
                ));
            }
            if let Some(response) = self.apply_routing(&name).await {
                let _ = self.supervisor.stop(&name).await;
                return response;
            }
        }
        Response::success(format!("Proxy chain created successfully: {name}"))
    }

    async fn outbound_delete(&self, name: &str) -> Response {
        if self.supervisor.is_running(name).await {
            if let Err(e) = self.supervisor.stop(name).await {
                return Response::error(format!("Failed to stop proxy chain: {e}"));
            }
            if let Err(e) = self.router.remove(EgressType::Xray, name).await {
                return Response::error(format!("Failed to cleanup routing: {e}"));
            }
        }
        if let Err(e) = self.outbounds.delete(name) {
            return Response::error(format!("Failed to delete proxy chain: {e}"));
        }
        if let Err(e) = self.rules.delete_chain(EgressType::Xray, name).await {
            return Response::error(format!("Failed to delete unblock chain: {e}"));
        }
        Response::success(format!("Proxy chain deleted successfully: {name}"))
    }

    async fn outbound_manage(&self, name: &str, action: ManageAction) -> Response {
        match action {
            ManageAction::Start => {
                if let Err(e) = self.supervisor.start(name).await {
                    return Response::error(format!("Failed to start proxy chain: {e}"));
                }
                if let Some(response) = self.apply_routing(name).await {
                    let _ = self.supervisor.stop(name).await;
                    return response;
                }
                Response::success(format!("Proxy chain started successfully: {name}"))
            }
            ManageAction::Stop => {
                if let Err(e) = self.supervisor.stop(name).await {
                    return Response::error(format!("Failed to stop proxy chain: {e}"));
                }
                if let Err(e) = self.router.remove(EgressType::Xray, name).await {
                    return Response::error(format!("Failed to cleanup routing: {e}"));
                }
                Response::success(format!("Proxy chain stopped successfully: {name}"))
            }
            ManageAction::Status => {
                if self.supervisor.is_running(name).await {
                    Response::success(format!("Proxy chain is running: {name}"))
                } else {
                    Response::error(format!("Proxy chain is not running: {name}"))
                }
            }
            ManageAction::Restart => {
                if let Err(e) = self.supervisor.restart(name).await {
                    return Response::error(format!("Failed to restart proxy chain: {e}"));
                }
                if let Some(response) = self.apply_routing(name).await {
                    let _ = self.supervisor.stop(name).await;
                    return response;
                }
                Response::success(format!("Proxy chain restarted successfully: {name}"))
            }
        }
    }

    fn outbound_set_autorun(&self, name: &str, auto_run: bool) -> Response {
        if name.is_empty() {
            return Response::error("Chain name is required");
        }
        match self.outbounds.set_auto_run(name, auto_run) {
            Ok(()) => {
                let state = if auto_run { "enabled" } else { "disabled" };
                Response::success(format!("Proxy chain autorun {state}: {name}"))
            }
            Err(e) => Response::error(format!("Failed to update autorun: {e}")),
        }
    }

    async fn hook_restore(&self, family: Option<IpFamily>) -> Response {
        let (v4, v6) = match family {
            None => (true, true),
            Some(IpFamily::V4) => (true, false),
            Some(IpFamily::V6) => (false, true),
        };
        self.router.reset_state_family(v4, v6).await;
        self.restore_running_chains(v4, v6).await;
        Response::success("Routing restore triggered")
    }

    /// Re-apply routing for every chain the supervisor reports running
    pub async fn restore_running_chains(&self, v4: bool, v6: bool) {
        let chains = match self.outbounds.list_info() {
            Ok(chains) => chains,
            Err(e) => {
                warn!("failed to list proxy configs for restore: {e}");
                return;
            }
        };
        let mut running = HashSet::new();
        for (name, _) in &chains {
            if self.supervisor.is_running(name).await {
                running.insert(name.clone());
            }
        }
        self.router
            .restore(&chains, |name| running.contains(name), v4, v6)
            .await;
    }

    /// Apply routing for a freshly started chain; Some(response) on failure
    async fn apply_routing(&self, name: &str) -> Option<Response> {
        let info = match self.outbounds.info(name) {
            Ok(info) => info,
            Err(e) => {
                return Some(Response::error(format!(
                    "Failed to configure routing: {e}"
                )))
            }
        };
        match self.router.apply(name, &info).await {
            Ok(()) => None,
            Err(e) => Some(Response::error(format!("Failed to configure routing: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsServerConfig, ResolverConfig};
    use crate::dns::{BootstrapResolver, ResolverObserver};
    use crate::firewall::FirewallManager;
    use crate::ipset::runner::mock::ScriptedRunner;
    use crate::ipset::{CommandRunner, SetTracker};
    use crate::rpc::protocol::GenericResult;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        scripted: Arc<ScriptedRunner>,
        outbounds: Arc<OutboundStore>,
        handler: RpcHandler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;

        let tracker = Arc::new(SetTracker::new(Arc::clone(&dynamic), false, false, 0));
        let rules = Arc::new(RuleStore::new(
            dir.path().join("rules.yaml"),
            Arc::clone(&tracker),
        ));
        rules.init().await.unwrap();

        let outbounds = Arc::new(
            OutboundStore::new(dir.path().join("configs"), (26000, 27000)).unwrap(),
        );
        let supervisor = Arc::new(ProxySupervisor::with_program(
            Arc::clone(&outbounds),
            fake_binary(&dir),
            Duration::from_millis(100),
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

        let handler = RpcHandler::new(
            dns,
            rules,
            Arc::clone(&outbounds),
            supervisor,
            router,
            interfaces,
        );
        Fixture {
            _dir: dir,
            scripted,
            outbounds,
            handler,
        }
    }

    fn fake_binary(dir: &TempDir) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("fake-xray");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn assert_success(response: &Response) {
        match response {
            Response::Result(GenericResult::Success { .. }) => {}
            other => panic!("expected success, got {other:?}"),
        }
    }

    fn assert_error_containing(response: &Response, needle: &str) {
        match response {
            Response::Result(GenericResult::Error { message }) => {
                assert!(message.contains(needle), "message {message:?} lacks {needle:?}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    const LINK: &str = "vless://uuid@h.example:443?security=tls#t";

    #[tokio::test]
    async fn test_rule_add_requires_known_chain() {
        let f = fixture().await;
        let response = f
            .handler
            .handle(Request::RuleAdd {
                chain: "ghost".into(),
                pattern: "*.example.test".into(),
            })
            .await;
        assert_error_containing(&response, "does not exist");
    }

    #[tokio::test]
    async fn test_rule_lifecycle_via_managed_chain() {
        let f = fixture().await;
        let name = f.outbounds.create(LINK, false).unwrap();

        let response = f
            .handler
            .handle(Request::RuleAdd {
                chain: name.clone(),
                pattern: "*.example.test".into(),
            })
            .await;
        assert_success(&response);

        // Overlap is rejected through the envelope
        let response = f
            .handler
            .handle(Request::RuleAdd {
                chain: name.clone(),
                pattern: "sub.example.test".into(),
            })
            .await;
        assert_error_containing(&response, "overlaps");

        let Response::RuleList { rules } =
            f.handler.handle(Request::RuleList).await
        else {
            panic!("expected listing");
        };
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].egress, "Xray");
        assert_eq!(rules[0].patterns, vec!["*.example.test"]);

        let response = f
            .handler
            .handle(Request::RuleDel {
                pattern: "*.example.test".into(),
            })
            .await;
        assert_success(&response);

        let response = f
            .handler
            .handle(Request::RuleDel {
                pattern: "*.example.test".into(),
            })
            .await;
        assert_error_containing(&response, "does not exist");
    }

    #[tokio::test]
    async fn test_rule_import_continues_past_failures() {
        let f = fixture().await;
        let name = f.outbounds.create(LINK, false).unwrap();

        let response = f
            .handler
            .handle(Request::RuleImportFile {
                rules: vec![
                    RuleSpec {
                        egress: "Xray".into(),
                        chain: name.clone(),
                        pattern: "a.test".into(),
                    },
                    RuleSpec {
                        egress: "NotAType".into(),
                        chain: name.clone(),
                        pattern: "b.test".into(),
                    },
                    RuleSpec {
                        egress: "Xray".into(),
                        chain: name,
                        pattern: "c.test".into(),
                    },
                ],
            })
            .await;
        assert_error_containing(&response, "Imported 2 rules, 1 failed");
    }

    #[tokio::test]
    async fn test_outbound_lifecycle() {
        let f = fixture().await;

        let response = f
            .handler
            .handle(Request::OutboundCreate {
                link: LINK.into(),
                auto_run: false,
            })
            .await;
        assert_success(&response);

        let Response::OutboundList { chains } =
            f.handler.handle(Request::OutboundList).await
        else {
            panic!("expected listing");
        };
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].chain, "xray1");
        assert!(!chains[0].running);

        // Duplicate link is rejected
        let response = f
            .handler
            .handle(Request::OutboundCreate {
                link: LINK.into(),
                auto_run: false,
            })
            .await;
        assert_error_containing(&response, "duplicate");

        // Start brings up the child and programs the firewall
        f.scripted.script("-q list vpner-Xray-xray1", 1, "");
        let response = f
            .handler
            .handle(Request::OutboundManage {
                name: "xray1".into(),
                action: ManageAction::Start,
            })
            .await;
        assert_success(&response);
        assert!(f.scripted.saw("create vpner-Xray-xray1"));
        assert!(f.scripted.saw("REDIRECT --to-ports"));

        let response = f
            .handler
            .handle(Request::OutboundManage {
                name: "xray1".into(),
                action: ManageAction::Status,
            })
            .await;
        assert_success(&response);

        let response = f
            .handler
            .handle(Request::OutboundDelete {
                name: "xray1".into(),
            })
            .await;
        assert_success(&response);
        let Response::OutboundList { chains } =
            f.handler.handle(Request::OutboundList).await
        else {
            panic!("expected listing");
        };
        assert!(chains.is_empty());
    }

    #[tokio::test]
    async fn test_outbound_stop_not_running() {
        let f = fixture().await;
        f.outbounds.create(LINK, false).unwrap();
        let response = f
            .handler
            .handle(Request::OutboundManage {
                name: "xray1".into(),
                action: ManageAction::Stop,
            })
            .await;
        assert_error_containing(&response, "not running");
    }

    #[tokio::test]
    async fn test_hook_restore_reapplies_running_chains() {
        let f = fixture().await;
        f.handler
            .handle(Request::OutboundCreate {
                link: LINK.into(),
                auto_run: true,
            })
            .await;
        let applied_before = f.scripted.count("REDIRECT --to-ports");
        assert!(applied_before > 0);

        let response = f
            .handler
            .handle(Request::HookRestore {
                family: Some(IpFamily::V4),
            })
            .await;
        assert_success(&response);
        // Reset purged the applied state, the restore pass re-applied it
        assert_eq!(f.scripted.count("REDIRECT --to-ports"), applied_before * 2);
    }

    #[tokio::test]
    async fn test_dns_manage_status() {
        let f = fixture().await;
        let response = f
            .handler
            .handle(Request::DnsManage {
                action: ManageAction::Status,
            })
            .await;
        match response {
            Response::Result(GenericResult::Success { message }) => {
                assert!(message.contains("DOWN"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
