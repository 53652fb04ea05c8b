//! iptables / policy-routing manager
//!
//! Per managed chain binding the manager maintains a private firewall chain
//! named `VPN_<8 hex digits>`, derived from the kernel set name. Redirect
//! rules live in the NAT table's private chain; mark rules live in the
//! mangle table's private chain, guarded by RETURN rules for the local
//! exception networks, together with an `ip rule` fwmark entry and a default
//! route in a numbered table.
//!
//! Mark and table id are a pure function of the set name (a SHA-256 fold
//! into [100, 100+0xFFF]), so they survive restarts without persistence.
//! Every apply step probes the observed state first, making apply
//! idempotent; removal and startup cleanup are scoped to the `VPN_` prefix
//! and the owned mark range so operator rules survive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::egress::{EgressKind, EgressType};
use crate::error::FirewallError;
use crate::ipset::runner::{command_line, output_text};
use crate::ipset::{CommandRunner, IpFamily};

/// Prefix of the private chains this system owns
pub const PRIVATE_CHAIN_PREFIX: &str = "VPN_";

/// Lowest mark/table id this system allocates
const MARK_BASE: u32 = 100;

/// Width of the mark/table id range
const MARK_SPAN: u32 = 0xFFF;

const TABLE_NAT: &str = "nat";
const TABLE_MANGLE: &str = "mangle";
const CHAIN_PREROUTING: &str = "PREROUTING";

/// Destinations that must never be diverted into a tunnel (IPv4)
const LOCAL_EXCEPTIONS_V4: [&str; 8] = [
    "0.0.0.0/8",
    "127.0.0.0/8",
    "10.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// Destinations that must never be diverted into a tunnel (IPv6)
const LOCAL_EXCEPTIONS_V6: [&str; 4] = ["::1/128", "fe80::/10", "fc00::/7", "ff00::/8"];

/// In-memory routing state for one (set, family)
#[derive(Debug, Clone)]
struct RoutingInfo {
    family: IpFamily,
    kind: EgressKind,
    chain: String,
    /// Jump rule specs, stored verbatim for deletion and restore
    jump_rules: Vec<String>,
    mark: u32,
    table: u32,
    device: String,
}

/// The firewall/routing adapter
pub struct FirewallManager {
    runner: Arc<dyn CommandRunner>,
    ipv6_available: AtomicBool,
    routing: Mutex<HashMap<String, RoutingInfo>>,
}

impl FirewallManager {
    /// Create a manager over the given tool runner
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ipv6_available: AtomicBool::new(false),
            routing: Mutex::new(HashMap::new()),
        }
    }

    /// Probe the v6 toolchain and clean leftovers from a prior crash
    ///
    /// Absence of ip6tables downgrades IPv6 to disabled at runtime, even if
    /// the configuration requested it.
    pub async fn init(&self, want_ipv6: bool) {
        let have_v6 = self.probe_ipv6().await;
        if want_ipv6 && !have_v6 {
            warn!("ip6tables not available; IPv6 diversion disabled at runtime");
        }
        self.ipv6_available.store(have_v6, Ordering::Relaxed);

        self.startup_cleanup(IpFamily::V4).await;
        if have_v6 {
            self.startup_cleanup(IpFamily::V6).await;
        }
    }

    /// Whether the v6 toolchain was detected
    #[must_use]
    pub fn ipv6_available(&self) -> bool {
        self.ipv6_available.load(Ordering::Relaxed)
    }

    /// Derive the private chain name for a set name
    #[must_use]
    pub fn chain_name_for(set_name: &str) -> String {
        format!("{PRIVATE_CHAIN_PREFIX}{:08x}", name_fold(set_name))
    }

    /// Derive the fwmark and routing-table id for a set name
    #[must_use]
    pub fn mark_and_table(set_name: &str) -> (u32, u32) {
        let value = (name_fold(set_name) & MARK_SPAN) + MARK_BASE;
        (value, value)
    }

    /// Install the diversion rules for one (set, family)
    ///
    /// For the redirect kind `port` is the proxy's local inbound port; for
    /// mark kinds `device` is the VPN interface the routing table points at.
    pub async fn add_rules(
        &self,
        egress: EgressType,
        family: IpFamily,
        set_name: &str,
        port: u16,
        lan_iface: &str,
        device: &str,
    ) -> Result<(), FirewallError> {
        let chain = Self::chain_name_for(set_name);
        let kind = egress.kind();
        let table = match kind {
            EgressKind::Redirect => TABLE_NAT,
            EgressKind::Mark => TABLE_MANGLE,
        };

        self.ensure_chain(family, table, &chain).await?;
        let jump = format!("-A {CHAIN_PREROUTING} -i {lan_iface} -j {chain}");
        self.append_if_missing(family, table, &jump).await?;

        let (mark, table_id) = match kind {
            EgressKind::Redirect => {
                self.add_redirect_rules(family, &chain, set_name, port, lan_iface)
                    .await?;
                (0, 0)
            }
            EgressKind::Mark => {
                if device.is_empty() {
                    return Err(FirewallError::MissingDevice(set_name.to_string()));
                }
                let (mark, table_id) = Self::mark_and_table(set_name);
                self.add_mark_rules(family, &chain, set_name, mark, lan_iface)
                    .await?;
                self.add_policy_route(family, mark, table_id, device).await?;
                (mark, table_id)
            }
        };

        let mut routing = self.routing.lock();
        let entry = routing
            .entry(set_name.to_string())
            .or_insert_with(|| RoutingInfo {
                family,
                kind,
                chain: chain.clone(),
                jump_rules: Vec::new(),
                mark,
                table: table_id,
                device: device.to_string(),
            });
        if !entry.jump_rules.contains(&jump) {
            entry.jump_rules.push(jump);
        }
        Ok(())
    }

    /// Tear down everything attributable to one set name
    pub async fn remove_rules(&self, set_name: &str) -> Result<(), FirewallError> {
        let Some(info) = self.routing.lock().remove(set_name) else {
            return Err(FirewallError::NotTracked(set_name.to_string()));
        };
        let table = match info.kind {
            EgressKind::Redirect => TABLE_NAT,
            EgressKind::Mark => TABLE_MANGLE,
        };

        for jump in &info.jump_rules {
            let del = jump.replacen("-A ", "-D ", 1);
            self.run_rule_unchecked(info.family, table, &del).await;
        }
        self.run_tool_unchecked(info.family, &["-t", table, "-F", &info.chain])
            .await;
        self.run_tool_unchecked(info.family, &["-t", table, "-X", &info.chain])
            .await;

        if info.mark != 0 && info.table != 0 {
            let mark = info.mark.to_string();
            let table_id = info.table.to_string();
            self.run_ip_unchecked(
                info.family,
                &["rule", "del", "fwmark", &mark, "table", &table_id],
            )
            .await;
            self.run_ip_unchecked(info.family, &["route", "flush", "table", &table_id])
                .await;
        }
        debug!("firewall rules removed for {set_name}");
        Ok(())
    }

    /// Reinstall jump/policy/route elements lost to an external flush
    ///
    /// Per-chain match rules are NOT recreated here; the egress router
    /// re-applies those from the current runtime info.
    pub async fn restore_links(&self, family_filter: Option<IpFamily>) {
        let snapshot: Vec<RoutingInfo> = self.routing.lock().values().cloned().collect();
        for info in snapshot {
            if family_filter.is_some_and(|f| f != info.family) {
                continue;
            }
            let table = match info.kind {
                EgressKind::Redirect => TABLE_NAT,
                EgressKind::Mark => TABLE_MANGLE,
            };
            if let Err(e) = self.ensure_chain(info.family, table, &info.chain).await {
                warn!("restore: failed to ensure chain {}: {e}", info.chain);
                continue;
            }
            for jump in &info.jump_rules {
                if let Err(e) = self.append_if_missing(info.family, table, jump).await {
                    warn!("restore: failed to reinstall jump {jump}: {e}");
                }
            }
            if info.kind == EgressKind::Mark {
                if let Err(e) = self
                    .add_policy_route(info.family, info.mark, info.table, &info.device)
                    .await
                {
                    warn!("restore: failed to reinstall routing for {}: {e}", info.chain);
                }
            }
        }
    }

    /// Forget all in-memory routing state without touching the kernel
    ///
    /// Used together with rule removal when the egress router resets its
    /// applied records after an external flush.
    pub fn forget(&self, set_name: &str) {
        self.routing.lock().remove(set_name);
    }

    /// Remove leftovers of a prior crash: every `VPN_` chain with its
    /// PREROUTING jumps, and every fwmark rule in the owned range.
    async fn startup_cleanup(&self, family: IpFamily) {
        for table in [TABLE_NAT, TABLE_MANGLE] {
            let Ok(save) = self.save_table(family, table).await else {
                continue;
            };
            let mut chains = Vec::new();
            let mut jumps = Vec::new();
            for line in save.lines() {
                if let Some(rest) = line.strip_prefix(':') {
                    if rest.starts_with(PRIVATE_CHAIN_PREFIX) {
                        if let Some(chain) = rest.split_whitespace().next() {
                            chains.push(chain.to_string());
                        }
                    }
                }
                if line.starts_with("-A PREROUTING")
                    && line.contains(&format!("-j {PRIVATE_CHAIN_PREFIX}"))
                {
                    jumps.push(line.to_string());
                }
            }
            for jump in jumps {
                let del = jump.replacen("-A ", "-D ", 1);
                info!("cleaning stale jump in {table}: {del}");
                self.run_rule_unchecked(family, table, &del).await;
            }
            for chain in chains {
                info!("cleaning stale chain in {table}: {chain}");
                self.run_tool_unchecked(family, &["-t", table, "-F", &chain])
                    .await;
                self.run_tool_unchecked(family, &["-t", table, "-X", &chain])
                    .await;
            }
        }

        let Ok(output) = self.run_ip(family, &["rule"]).await else {
            return;
        };
        for line in output.lines() {
            if !line.contains("fwmark") || !line.contains("lookup") {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let mut fwmark = None;
            let mut table_id = None;
            for (idx, token) in tokens.iter().enumerate() {
                if *token == "fwmark" {
                    fwmark = tokens.get(idx + 1).and_then(|t| parse_mark_token(t));
                }
                if *token == "lookup" {
                    table_id = tokens.get(idx + 1).and_then(|t| parse_mark_token(t));
                }
            }
            if let (Some(mark), Some(table)) = (fwmark, table_id) {
                if mark == table && (MARK_BASE..=MARK_BASE + MARK_SPAN).contains(&mark) {
                    info!("cleaning stale ip rule: fwmark {mark} table {table}");
                    let mark_str = mark.to_string();
                    let table_str = table.to_string();
                    self.run_ip_unchecked(
                        family,
                        &["rule", "del", "fwmark", &mark_str, "table", &table_str],
                    )
                    .await;
                    self.run_ip_unchecked(family, &["route", "flush", "table", &table_str])
                        .await;
                }
            }
        }
    }

    async fn add_redirect_rules(
        &self,
        family: IpFamily,
        chain: &str,
        set_name: &str,
        port: u16,
        lan_iface: &str,
    ) -> Result<(), FirewallError> {
        for proto in ["tcp", "udp"] {
            let rule = format!(
                "-A {chain} -i {lan_iface} -p {proto} -m set --match-set {set_name} dst \
                 -j REDIRECT --to-ports {port}"
            );
            self.append_if_missing(family, TABLE_NAT, &rule).await?;
        }
        Ok(())
    }

    async fn add_mark_rules(
        &self,
        family: IpFamily,
        chain: &str,
        set_name: &str,
        mark: u32,
        lan_iface: &str,
    ) -> Result<(), FirewallError> {
        let exceptions: &[&str] = match family {
            IpFamily::V4 => &LOCAL_EXCEPTIONS_V4,
            IpFamily::V6 => &LOCAL_EXCEPTIONS_V6,
        };
        for cidr in exceptions {
            let rule = format!("-A {chain} -i {lan_iface} -d {cidr} -j RETURN");
            self.append_if_missing(family, TABLE_MANGLE, &rule).await?;
        }
        for proto in ["tcp", "udp"] {
            let rule = format!(
                "-A {chain} -i {lan_iface} -p {proto} -m set --match-set {set_name} dst \
                 -j MARK --set-mark {mark}"
            );
            self.append_if_missing(family, TABLE_MANGLE, &rule).await?;
        }
        Ok(())
    }

    async fn add_policy_route(
        &self,
        family: IpFamily,
        mark: u32,
        table: u32,
        device: &str,
    ) -> Result<(), FirewallError> {
        let mark_str = mark.to_string();
        let table_str = table.to_string();
        // del-then-add keeps the rule unique without a reliable probe
        self.run_ip_unchecked(
            family,
            &["rule", "del", "fwmark", &mark_str, "table", &table_str],
        )
        .await;
        self.run_ip_checked(
            family,
            &["rule", "add", "fwmark", &mark_str, "table", &table_str],
        )
        .await?;
        self.run_ip_checked(
            family,
            &[
                "route", "replace", "default", "dev", device, "table", &table_str,
            ],
        )
        .await?;
        Ok(())
    }

    /// Create a chain unless the table already has it
    async fn ensure_chain(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
    ) -> Result<(), FirewallError> {
        let save = self.save_table(family, table).await?;
        let marker = format!(":{chain} ");
        if save.lines().any(|l| l.starts_with(&marker)) {
            return Ok(());
        }
        self.run_tool_checked(family, &["-t", table, "-N", chain])
            .await
    }

    /// Append a rule spec (starting with `-A <chain>`) unless present
    async fn append_if_missing(
        &self,
        family: IpFamily,
        table: &str,
        spec: &str,
    ) -> Result<(), FirewallError> {
        if self.rule_exists(family, table, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table];
        args.extend(spec.split_whitespace());
        self.run_tool_checked(family, &args).await
    }

    async fn rule_exists(
        &self,
        family: IpFamily,
        table: &str,
        spec: &str,
    ) -> Result<bool, FirewallError> {
        let save = self.save_table(family, table).await?;
        Ok(save.lines().any(|l| l.trim() == spec))
    }

    async fn save_table(&self, family: IpFamily, table: &str) -> Result<String, FirewallError> {
        let tool = save_tool(family);
        let output = self.runner.run(tool, &["-t", table]).await?;
        if !output.status.success() {
            return Err(FirewallError::tool(
                format!("{tool} -t {table}"),
                output_text(&output),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe_ipv6(&self) -> bool {
        match self.runner.run(tool(IpFamily::V6), &["--version"]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn run_tool_checked(&self, family: IpFamily, args: &[&str]) -> Result<(), FirewallError> {
        let program = tool(family);
        let output = self.runner.run(program, args).await?;
        if !output.status.success() {
            return Err(FirewallError::tool(
                command_line(program, args),
                output_text(&output),
            ));
        }
        Ok(())
    }

    async fn run_tool_unchecked(&self, family: IpFamily, args: &[&str]) {
        let program = tool(family);
        match self.runner.run(program, args).await {
            Ok(output) if !output.status.success() => {
                debug!(
                    "{} exited nonzero: {}",
                    command_line(program, args),
                    output_text(&output)
                );
            }
            Ok(_) => {}
            Err(e) => debug!("{} failed to run: {e}", command_line(program, args)),
        }
    }

    async fn run_rule_unchecked(&self, family: IpFamily, table: &str, spec: &str) {
        let mut args = vec!["-t", table];
        args.extend(spec.split_whitespace());
        self.run_tool_unchecked(family, &args).await;
    }

    async fn run_ip(&self, family: IpFamily, args: &[&str]) -> Result<String, FirewallError> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        if family == IpFamily::V6 {
            full.push("-6");
        }
        full.extend(args);
        let output = self.runner.run("ip", &full).await?;
        if !output.status.success() {
            return Err(FirewallError::tool(
                command_line("ip", &full),
                output_text(&output),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ip_checked(&self, family: IpFamily, args: &[&str]) -> Result<(), FirewallError> {
        self.run_ip(family, args).await.map(|_| ())
    }

    async fn run_ip_unchecked(&self, family: IpFamily, args: &[&str]) {
        if let Err(e) = self.run_ip(family, args).await {
            debug!("{e}");
        }
    }
}

const fn tool(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables",
        IpFamily::V6 => "ip6tables",
    }
}

const fn save_tool(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables-save",
        IpFamily::V6 => "ip6tables-save",
    }
}

/// Fold a set name into 32 bits (first four bytes of its SHA-256)
fn name_fold(set_name: &str) -> u32 {
    let digest = Sha256::digest(set_name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn parse_mark_token(token: &str) -> Option<u32> {
    if let Some(hex) = token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::runner::mock::ScriptedRunner;

    fn manager() -> (Arc<ScriptedRunner>, FirewallManager) {
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        (scripted, FirewallManager::new(dynamic))
    }

    #[test]
    fn test_derived_names_deterministic() {
        let chain_a = FirewallManager::chain_name_for("vpner-Xray-xray1");
        let chain_b = FirewallManager::chain_name_for("vpner-Xray-xray1");
        assert_eq!(chain_a, chain_b);
        assert!(chain_a.starts_with("VPN_"));
        assert_eq!(chain_a.len(), 4 + 8);

        let (mark, table) = FirewallManager::mark_and_table("vpner-Wireguard-wg0");
        assert_eq!(mark, table);
        assert!((100..=100 + 0xFFF).contains(&mark));

        // Different set names land on different chains
        assert_ne!(
            FirewallManager::chain_name_for("vpner-Xray-xray1"),
            FirewallManager::chain_name_for("vpner-Xray-xray1-6")
        );
    }

    #[tokio::test]
    async fn test_redirect_apply_shape() {
        let (scripted, mgr) = manager();
        mgr.add_rules(
            EgressType::Xray,
            IpFamily::V4,
            "vpner-Xray-xray1",
            10800,
            "br0",
            "",
        )
        .await
        .unwrap();

        let chain = FirewallManager::chain_name_for("vpner-Xray-xray1");
        assert!(scripted.saw(&format!("iptables -t nat -N {chain}")));
        assert!(scripted.saw(&format!("-t nat -A PREROUTING -i br0 -j {chain}")));
        assert!(scripted.saw(&format!(
            "-A {chain} -i br0 -p tcp -m set --match-set vpner-Xray-xray1 dst \
             -j REDIRECT --to-ports 10800"
        )));
        assert!(scripted.saw(&format!(
            "-A {chain} -i br0 -p udp -m set --match-set vpner-Xray-xray1 dst \
             -j REDIRECT --to-ports 10800"
        )));
        // Redirect kind touches neither policy rules nor routes
        assert!(!scripted.saw("ip rule add"));
    }

    #[tokio::test]
    async fn test_mark_apply_shape() {
        let (scripted, mgr) = manager();
        mgr.add_rules(
            EgressType::Wireguard,
            IpFamily::V4,
            "vpner-Wireguard-wg0",
            0,
            "br0",
            "nwg0",
        )
        .await
        .unwrap();

        let chain = FirewallManager::chain_name_for("vpner-Wireguard-wg0");
        let (mark, table) = FirewallManager::mark_and_table("vpner-Wireguard-wg0");

        assert!(scripted.saw(&format!("iptables -t mangle -N {chain}")));
        // Local exceptions precede the mark rules
        assert!(scripted.saw(&format!("-A {chain} -i br0 -d 192.168.0.0/16 -j RETURN")));
        assert!(scripted.saw(&format!(
            "-A {chain} -i br0 -p tcp -m set --match-set vpner-Wireguard-wg0 dst \
             -j MARK --set-mark {mark}"
        )));
        assert!(scripted.saw(&format!("ip rule add fwmark {mark} table {table}")));
        assert!(scripted.saw(&format!(
            "ip route replace default dev nwg0 table {table}"
        )));
    }

    #[tokio::test]
    async fn test_mark_requires_device() {
        let (_, mgr) = manager();
        let err = mgr
            .add_rules(
                EgressType::Wireguard,
                IpFamily::V4,
                "vpner-Wireguard-wg0",
                0,
                "br0",
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::MissingDevice(_)));
    }

    #[tokio::test]
    async fn test_apply_idempotent() {
        let (scripted, mgr) = manager();
        let chain = FirewallManager::chain_name_for("vpner-Xray-xray1");
        // The table already holds the chain and all of its rules
        scripted.script(
            "iptables-save -t nat",
            0,
            format!(
                ":{chain} - [0:0]\n\
                 -A PREROUTING -i br0 -j {chain}\n\
                 -A {chain} -i br0 -p tcp -m set --match-set vpner-Xray-xray1 dst -j REDIRECT --to-ports 10800\n\
                 -A {chain} -i br0 -p udp -m set --match-set vpner-Xray-xray1 dst -j REDIRECT --to-ports 10800\n"
            ),
        );

        mgr.add_rules(
            EgressType::Xray,
            IpFamily::V4,
            "vpner-Xray-xray1",
            10800,
            "br0",
            "",
        )
        .await
        .unwrap();

        // Nothing is inserted twice
        assert_eq!(scripted.count("iptables -t nat -N"), 0);
        assert_eq!(scripted.count("iptables -t nat -A"), 0);
    }

    #[tokio::test]
    async fn test_remove_tears_everything_down() {
        let (scripted, mgr) = manager();
        mgr.add_rules(
            EgressType::Wireguard,
            IpFamily::V4,
            "vpner-Wireguard-wg0",
            0,
            "br0",
            "nwg0",
        )
        .await
        .unwrap();

        mgr.remove_rules("vpner-Wireguard-wg0").await.unwrap();

        let chain = FirewallManager::chain_name_for("vpner-Wireguard-wg0");
        let (mark, table) = FirewallManager::mark_and_table("vpner-Wireguard-wg0");
        assert!(scripted.saw(&format!("-t mangle -D PREROUTING -i br0 -j {chain}")));
        assert!(scripted.saw(&format!("-t mangle -F {chain}")));
        assert!(scripted.saw(&format!("-t mangle -X {chain}")));
        assert!(scripted.saw(&format!("ip rule del fwmark {mark} table {table}")));
        assert!(scripted.saw(&format!("ip route flush table {table}")));

        // Second removal has nothing to track
        assert!(matches!(
            mgr.remove_rules("vpner-Wireguard-wg0").await.unwrap_err(),
            FirewallError::NotTracked(_)
        ));
    }

    #[tokio::test]
    async fn test_restore_reinstalls_missing_jumps_only() {
        let (scripted, mgr) = manager();
        mgr.add_rules(
            EgressType::Xray,
            IpFamily::V4,
            "vpner-Xray-xray1",
            10800,
            "br0",
            "",
        )
        .await
        .unwrap();
        let before = scripted.count("iptables -t nat -A PREROUTING");

        // External flush wiped the table; saves now come back empty
        mgr.restore_links(Some(IpFamily::V4)).await;

        let chain = FirewallManager::chain_name_for("vpner-Xray-xray1");
        assert!(scripted.count(&format!("iptables -t nat -N {chain}")) >= 1);
        assert_eq!(
            scripted.count("iptables -t nat -A PREROUTING"),
            before + 1
        );
        // Match rules are left to the egress router
        assert_eq!(scripted.count("REDIRECT --to-ports"), 2);
    }

    #[tokio::test]
    async fn test_startup_cleanup_scoped_to_prefix() {
        let (scripted, mgr) = manager();
        scripted.script(
            "iptables-save -t nat",
            0,
            ":VPN_deadbeef - [0:0]\n\
             :OPERATOR_CHAIN - [0:0]\n\
             -A PREROUTING -i br0 -j VPN_deadbeef\n\
             -A PREROUTING -i br0 -j OPERATOR_CHAIN\n",
        );
        scripted.script(
            "ip rule",
            0,
            "0:\tfrom all lookup local\n\
             32765:\tfrom all fwmark 0xa7 lookup 167\n\
             32766:\tfrom all lookup main\n",
        );

        mgr.init(false).await;

        assert!(scripted.saw("-t nat -D PREROUTING -i br0 -j VPN_deadbeef"));
        assert!(scripted.saw("-t nat -F VPN_deadbeef"));
        assert!(scripted.saw("-t nat -X VPN_deadbeef"));
        assert!(!scripted.saw("-D PREROUTING -i br0 -j OPERATOR_CHAIN"));
        assert!(!scripted.saw("-X OPERATOR_CHAIN"));

        // 0xa7 == 167 and inside the owned range
        assert!(scripted.saw("ip rule del fwmark 167 table 167"));
        assert!(scripted.saw("ip route flush table 167"));
    }

    #[test]
    fn test_parse_mark_token() {
        assert_eq!(parse_mark_token("167"), Some(167));
        assert_eq!(parse_mark_token("0xa7"), Some(167));
        assert_eq!(parse_mark_token("main"), None);
    }
}
