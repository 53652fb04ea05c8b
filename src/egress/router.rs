//! Egress router: composes kernel sets and firewall rules per chain
//!
//! `apply` ensures the chain's sets (v4, plus v6 when enabled system-wide
//! and the toolchain exists) and installs the diversion rules on every LAN
//! interface, tracking which families were applied so removal and restore
//! can act precisely. `reset_state` is the safety door after an external
//! firewall rebuild: it drops rules and records so the next apply is full.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::egress::EgressType;
use crate::error::{FirewallError, VpnerError};
use crate::firewall::FirewallManager;
use crate::ipset::{set_name, set_name6, IpFamily, SetTracker};
use crate::outbound::ChainInfo;

/// Which families a chain currently has rules for
#[derive(Debug, Clone, Copy, Default)]
struct AppliedState {
    v4: bool,
    v6: bool,
}

/// The egress router
pub struct EgressRouter {
    firewall: Arc<FirewallManager>,
    tracker: Arc<SetTracker>,
    lan_ifaces: Vec<String>,
    ipv6_enabled: bool,
    applied: Mutex<HashMap<String, AppliedState>>,
}

impl EgressRouter {
    /// Create a router over the given adapters
    ///
    /// Empty interface entries are dropped; with none left, `br0` is used.
    #[must_use]
    pub fn new(
        firewall: Arc<FirewallManager>,
        tracker: Arc<SetTracker>,
        lan_ifaces: Vec<String>,
        ipv6_enabled: bool,
    ) -> Self {
        let mut ifaces: Vec<String> = lan_ifaces
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();
        if ifaces.is_empty() {
            ifaces.push("br0".into());
        }
        Self {
            firewall,
            tracker,
            lan_ifaces: ifaces,
            ipv6_enabled,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Install redirect diversion for a proxy chain
    ///
    /// # Errors
    ///
    /// Fails when the runtime info lacks an inbound port or the adapters
    /// report a tool failure.
    pub async fn apply(&self, chain: &str, info: &ChainInfo) -> Result<(), VpnerError> {
        if info.inbound_port == 0 {
            return Err(FirewallError::Tool {
                command: format!("apply {chain}"),
                output: "missing inbound port".into(),
            }
            .into());
        }
        self.apply_family(EgressType::Xray, chain, info.inbound_port, "", true, true)
            .await
    }

    /// Install mark diversion for a VPN chain routed out of `device`
    pub async fn apply_device(
        &self,
        egress: EgressType,
        chain: &str,
        device: &str,
    ) -> Result<(), VpnerError> {
        self.apply_family(egress, chain, 0, device, true, true).await
    }

    async fn apply_family(
        &self,
        egress: EgressType,
        chain: &str,
        port: u16,
        device: &str,
        apply_v4: bool,
        apply_v6: bool,
    ) -> Result<(), VpnerError> {
        let apply_v6 = apply_v6 && self.v6_active();
        if !apply_v4 && !apply_v6 {
            return Ok(());
        }

        let name_v4 = set_name(egress, chain)?;
        if apply_v4 {
            self.tracker.obtain(&name_v4, IpFamily::V4).await?;
        }
        let name_v6 = set_name6(egress, chain)?;
        if apply_v6 {
            self.tracker.obtain(&name_v6, IpFamily::V6).await?;
        }

        let mut applied = self.applied.lock().await;
        let state = applied.entry(applied_key(egress, chain)).or_default();
        let do_v4 = apply_v4 && !state.v4;
        let do_v6 = apply_v6 && !state.v6;
        if !do_v4 && !do_v6 {
            return Ok(());
        }

        for iface in &self.lan_ifaces {
            if do_v4 {
                self.firewall
                    .add_rules(egress, IpFamily::V4, &name_v4, port, iface, device)
                    .await?;
            }
            if do_v6 {
                self.firewall
                    .add_rules(egress, IpFamily::V6, &name_v6, port, iface, device)
                    .await?;
            }
        }
        if do_v4 {
            state.v4 = true;
        }
        if do_v6 {
            state.v6 = true;
        }
        info!("egress applied for [{egress}/{chain}] (v4={} v6={})", state.v4, state.v6);
        Ok(())
    }

    /// Tear down a chain's diversion rules and forget its record
    pub async fn remove(&self, egress: EgressType, chain: &str) -> Result<(), VpnerError> {
        let mut applied = self.applied.lock().await;
        let Some(state) = applied.remove(&applied_key(egress, chain)) else {
            return Ok(());
        };
        if state.v4 {
            self.firewall.remove_rules(&set_name(egress, chain)?).await?;
        }
        if state.v6 {
            self.firewall
                .remove_rules(&set_name6(egress, chain)?)
                .await?;
        }
        info!("egress removed for [{egress}/{chain}]");
        Ok(())
    }

    /// Re-apply every running proxy chain, optionally filtered by family
    ///
    /// Chains the supervisor reports as not running are skipped; individual
    /// failures are logged and do not stop the pass.
    pub async fn restore<F>(
        &self,
        chains: &[(String, ChainInfo)],
        is_running: F,
        restore_v4: bool,
        restore_v6: bool,
    ) where
        F: Fn(&str) -> bool,
    {
        let restore_v6 = restore_v6 && self.v6_active();
        if !restore_v4 && !restore_v6 {
            return;
        }
        for (chain, info) in chains {
            if !is_running(chain) {
                continue;
            }
            if info.inbound_port == 0 {
                warn!("skipping restore of {chain}: missing inbound port");
                continue;
            }
            if let Err(e) = self
                .apply_family(
                    EgressType::Xray,
                    chain,
                    info.inbound_port,
                    "",
                    restore_v4,
                    restore_v6,
                )
                .await
            {
                error!("restore routing for {chain}: {e}");
            }
        }
    }

    /// Remove all rules and purge every applied record
    pub async fn reset_state(&self) {
        self.reset_state_family(true, true).await;
    }

    /// Remove rules and records for the selected families only
    pub async fn reset_state_family(&self, reset_v4: bool, reset_v6: bool) {
        let mut applied = self.applied.lock().await;
        let keys: Vec<String> = applied.keys().cloned().collect();
        for key in keys {
            let Some(mut state) = applied.get(&key).copied() else {
                continue;
            };
            let Some((egress, chain)) = parse_applied_key(&key) else {
                continue;
            };
            if reset_v4 && state.v4 {
                self.remove_family_rules(egress, &chain, IpFamily::V4).await;
                state.v4 = false;
            }
            if reset_v6 && state.v6 {
                self.remove_family_rules(egress, &chain, IpFamily::V6).await;
                state.v6 = false;
            }
            if state.v4 || state.v6 {
                applied.insert(key, state);
            } else {
                applied.remove(&key);
            }
        }
    }

    /// Disable all egress routing; used on shutdown
    pub async fn shutdown(&self) {
        self.reset_state().await;
    }

    async fn remove_family_rules(&self, egress: EgressType, chain: &str, family: IpFamily) {
        let name = match family {
            IpFamily::V4 => set_name(egress, chain),
            IpFamily::V6 => set_name6(egress, chain),
        };
        let Ok(name) = name else {
            return;
        };
        if let Err(e) = self.firewall.remove_rules(&name).await {
            // Externally flushed state may already be gone
            if !matches!(e, FirewallError::NotTracked(_)) {
                warn!("failed to remove rules for {name}: {e}");
            }
            self.firewall.forget(&name);
        }
    }

    fn v6_active(&self) -> bool {
        self.ipv6_enabled && self.firewall.ipv6_available()
    }
}

fn applied_key(egress: EgressType, chain: &str) -> String {
    format!("{egress}/{chain}")
}

fn parse_applied_key(key: &str) -> Option<(EgressType, String)> {
    let (egress, chain) = key.split_once('/')?;
    let egress: EgressType = egress.parse().ok()?;
    Some((egress, chain.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::runner::mock::ScriptedRunner;
    use crate::ipset::CommandRunner;

    fn fixture(ipv6: bool) -> (Arc<ScriptedRunner>, EgressRouter) {
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        let firewall = Arc::new(FirewallManager::new(Arc::clone(&dynamic)));
        let tracker = Arc::new(SetTracker::new(dynamic, ipv6, false, 0));
        let router = EgressRouter::new(firewall, tracker, vec!["br0".into()], ipv6);
        (scripted, router)
    }

    fn info(port: u16) -> ChainInfo {
        ChainInfo {
            protocol: "vless".into(),
            host: "h.example".into(),
            port: 443,
            auto_run: false,
            inbound_port: port,
        }
    }

    #[tokio::test]
    async fn test_apply_creates_set_and_rules() {
        let (scripted, router) = fixture(false);
        scripted.script("-q list vpner-Xray-xray1", 1, "");
        router.apply("xray1", &info(10800)).await.unwrap();

        assert!(scripted.saw("create vpner-Xray-xray1 hash:net family inet"));
        assert!(scripted.saw("REDIRECT --to-ports 10800"));
        // IPv6 disabled: no companion set, no ip6tables
        assert!(!scripted.saw("vpner-Xray-xray1-6"));
        assert!(!scripted.saw("ip6tables -t nat -A"));
    }

    #[tokio::test]
    async fn test_apply_missing_port_rejected() {
        let (_, router) = fixture(false);
        assert!(router.apply("xray1", &info(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_records_state_and_skips_repeat() {
        let (scripted, router) = fixture(false);
        router.apply("xray1", &info(10800)).await.unwrap();
        let redirects = scripted.count("REDIRECT --to-ports 10800");

        router.apply("xray1", &info(10800)).await.unwrap();
        // Second apply short-circuits on the applied record
        assert_eq!(scripted.count("REDIRECT --to-ports 10800"), redirects);
    }

    #[tokio::test]
    async fn test_dual_stack_apply() {
        let (scripted, router) = fixture(true);
        scripted.script("-q list vpner-Xray-xray1-6", 1, "");
        scripted.script("-q list vpner-Xray-xray1", 1, "");
        // ip6tables probe succeeds under the scripted runner
        router.firewall.init(true).await;
        router.apply("xray1", &info(10800)).await.unwrap();

        assert!(scripted.saw("create vpner-Xray-xray1 hash:net family inet "));
        assert!(scripted.saw("create vpner-Xray-xray1-6 hash:net family inet6"));
        assert!(scripted.saw("ip6tables -t nat"));
    }

    #[tokio::test]
    async fn test_remove_clears_both_families() {
        let (scripted, router) = fixture(true);
        router.firewall.init(true).await;
        router.apply("xray1", &info(10800)).await.unwrap();

        router.remove(EgressType::Xray, "xray1").await.unwrap();
        let chain_v4 = FirewallManager::chain_name_for("vpner-Xray-xray1");
        let chain_v6 = FirewallManager::chain_name_for("vpner-Xray-xray1-6");
        assert!(scripted.saw(&format!("iptables -t nat -X {chain_v4}")));
        assert!(scripted.saw(&format!("ip6tables -t nat -X {chain_v6}")));

        // Removing an unapplied chain is a no-op
        router.remove(EgressType::Xray, "xray1").await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_skips_stopped_chains() {
        let (scripted, router) = fixture(false);
        let chains = vec![
            ("xray1".to_string(), info(10800)),
            ("xray2".to_string(), info(10801)),
        ];
        router
            .restore(&chains, |name| name == "xray1", true, false)
            .await;

        assert!(scripted.saw("REDIRECT --to-ports 10800"));
        assert!(!scripted.saw("REDIRECT --to-ports 10801"));
    }

    #[tokio::test]
    async fn test_reset_state_forces_full_reapply() {
        let (scripted, router) = fixture(false);
        router.apply("xray1", &info(10800)).await.unwrap();
        let before = scripted.count("REDIRECT --to-ports 10800");

        router.reset_state().await;
        // Applied record purged: the next apply installs rules again
        router.apply("xray1", &info(10800)).await.unwrap();
        assert_eq!(scripted.count("REDIRECT --to-ports 10800"), before * 2);
    }

    #[tokio::test]
    async fn test_restore_idempotent_when_state_intact() {
        let (scripted, router) = fixture(false);
        router.apply("xray1", &info(10800)).await.unwrap();
        let before = scripted.count("iptables -t nat -A");

        // Nothing was flushed and the applied record is intact: restore
        // changes nothing
        let chains = vec![("xray1".to_string(), info(10800))];
        router.restore(&chains, |_| true, true, false).await;
        assert_eq!(scripted.count("iptables -t nat -A"), before);
    }
}
