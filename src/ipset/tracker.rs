//! Shared kernel-set state: cached adapter handles and stale-miss counters
//!
//! One `SetTracker` instance is constructed by the runtime and threaded into
//! the rule store and the resolver-observer. It owns the per-set adapter
//! cache and the per-(set, comment) counters of consecutive resolution
//! misses. The counters are a heuristic, not an invariant: they are not
//! persisted and self-heal on the next observation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::adapter::{
    entries_by_comment_prefix, list_entries_with_comments, remove_entries, Ipset, SetOptions,
};
use super::name::{set_name, set_name6};
use super::runner::CommandRunner;
use super::IpFamily;
use crate::egress::EgressType;
use crate::error::IpsetError;
use crate::rules::pattern;

/// Comment carried by dynamic entries: `rule=<pattern>|domain=<domain>`
pub const COMMENT_RULE_KEY: &str = "rule=";
const COMMENT_DOMAIN_KEY: &str = "|domain=";

/// Build the provenance comment for a dynamic entry
#[must_use]
pub fn rule_comment(rule: &str, domain: &str) -> String {
    format!("{COMMENT_RULE_KEY}{rule}{COMMENT_DOMAIN_KEY}{domain}")
}

/// Comment prefix shared by all entries of one rule
#[must_use]
pub fn rule_comment_prefix(rule: &str) -> String {
    format!("{COMMENT_RULE_KEY}{rule}{COMMENT_DOMAIN_KEY}")
}

/// Cached set handles plus stale-miss bookkeeping
pub struct SetTracker {
    runner: Arc<dyn CommandRunner>,
    ipv6_enabled: bool,
    debug: bool,
    stale_threshold: u32,
    sets: tokio::sync::Mutex<HashMap<String, Ipset>>,
    stale: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl SetTracker {
    /// Create a tracker over the given tool runner
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ipv6_enabled: bool,
        debug: bool,
        stale_threshold: u32,
    ) -> Self {
        Self {
            runner,
            ipv6_enabled,
            debug,
            stale_threshold,
            sets: tokio::sync::Mutex::new(HashMap::new()),
            stale: Mutex::new(HashMap::new()),
        }
    }

    /// The tool runner this tracker drives
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Whether IPv6 companion sets are maintained
    #[must_use]
    pub const fn ipv6_enabled(&self) -> bool {
        self.ipv6_enabled
    }

    /// Whether per-entry decisions are logged
    #[must_use]
    pub const fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Consecutive misses before a dynamic entry is evicted (0 = immediate)
    #[must_use]
    pub const fn stale_threshold(&self) -> u32 {
        self.stale_threshold
    }

    /// Get or create the cached adapter handle for a set
    ///
    /// Sets are created with comment support and no default timeout.
    pub async fn obtain(&self, name: &str, family: IpFamily) -> Result<Ipset, IpsetError> {
        let mut sets = self.sets.lock().await;
        if let Some(set) = sets.get(name) {
            return Ok(set.clone());
        }
        let set = Ipset::ensure(
            Arc::clone(&self.runner),
            name,
            SetOptions::dynamic(family),
        )
        .await?;
        sets.insert(name.to_string(), set.clone());
        Ok(set)
    }

    /// Add a literal IP/CIDR rule to its chain's set with no timeout
    ///
    /// IPv6 literals are skipped when IPv6 is disabled.
    pub async fn add_static(
        &self,
        egress: EgressType,
        chain: &str,
        entry: &str,
    ) -> Result<(), IpsetError> {
        let (name, family) = match self.static_target(egress, chain, entry)? {
            Some(target) => target,
            None => return Ok(()),
        };
        let set = self.obtain(&name, family).await?;
        if self.debug {
            info!("ipset add: set={name} entry={entry} reason=static-rule");
        }
        set.add(entry, 0).await
    }

    /// Remove a literal IP/CIDR rule's entry from its chain's set
    pub async fn remove_static(
        &self,
        egress: EgressType,
        chain: &str,
        entry: &str,
    ) -> Result<(), IpsetError> {
        let (name, _) = match self.static_target(egress, chain, entry)? {
            Some(target) => target,
            None => return Ok(()),
        };
        if self.debug {
            info!("ipset del: set={name} entry={entry} reason=static-rule-delete");
        }
        remove_entries(&self.runner, &name, &[entry.to_string()]).await
    }

    /// Sweep all dynamic entries attributable to a deleted domain rule
    ///
    /// Removes entries whose comment starts with `rule=<pattern>|domain=`,
    /// then a legacy pass removing entries whose bare comment the pattern
    /// matches. Stale counters for the rule are dropped.
    pub async fn sweep_rule(
        &self,
        egress: EgressType,
        chain: &str,
        rule: &str,
    ) -> Result<(), IpsetError> {
        self.sweep_rule_family(egress, chain, rule, IpFamily::V4)
            .await?;
        match self.sweep_rule_family(egress, chain, rule, IpFamily::V6).await {
            Ok(()) => Ok(()),
            Err(e) if !self.ipv6_enabled => {
                debug!("ignoring v6 sweep failure with ipv6 disabled: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sweep_rule_family(
        &self,
        egress: EgressType,
        chain: &str,
        rule: &str,
        family: IpFamily,
    ) -> Result<(), IpsetError> {
        let name = match family {
            IpFamily::V4 => set_name(egress, chain)?,
            IpFamily::V6 => set_name6(egress, chain)?,
        };
        self.clear_stale_for_rule(&name, rule);

        let prefixed = entries_by_comment_prefix(&self.runner, &name, &rule_comment_prefix(rule))
            .await?;
        if self.debug {
            for entry in &prefixed {
                info!("ipset del: set={name} entry={entry} reason=rule-delete rule={rule}");
            }
        }
        remove_entries(&self.runner, &name, &prefixed).await?;

        // Legacy schema: the bare domain as the comment
        let entries = list_entries_with_comments(&self.runner, &name).await?;
        let legacy: Vec<String> = entries
            .into_iter()
            .filter(|e| {
                e.comment.as_deref().is_some_and(|c| {
                    !c.is_empty()
                        && !c.starts_with(COMMENT_RULE_KEY)
                        && pattern::matches(rule, c)
                })
            })
            .map(|e| e.entry)
            .collect();
        if self.debug {
            for entry in &legacy {
                info!("ipset del: set={name} entry={entry} reason=rule-delete-legacy rule={rule}");
            }
        }
        remove_entries(&self.runner, &name, &legacy).await
    }

    /// Flush both family sets of a chain and drop their counters
    pub async fn drop_chain(&self, egress: EgressType, chain: &str) -> Result<(), IpsetError> {
        for family in [IpFamily::V4, IpFamily::V6] {
            let name = match family {
                IpFamily::V4 => set_name(egress, chain)?,
                IpFamily::V6 => set_name6(egress, chain)?,
            };
            self.stale.lock().retain(|key, _| !key.starts_with(&format!("{name}|")));
            let probe = self.runner.run("ipset", &["-q", "list", &name]).await?;
            if !probe.status.success() {
                continue;
            }
            let set = self.obtain(&name, family).await?;
            if self.debug {
                info!("ipset flush: set={name} reason=chain-delete");
            }
            set.flush().await?;
        }
        Ok(())
    }

    /// Update miss counters for one (set, comment) and return the entries
    /// that crossed the threshold.
    ///
    /// Counters reset to zero for entries present in `resolved`; counters for
    /// entries gone from both `existing` and `resolved` are garbage-collected.
    /// With a zero threshold this is a no-op returning nothing.
    pub fn collect_stale(
        &self,
        set_name: &str,
        comment: &str,
        existing: &[String],
        resolved: &HashSet<String>,
    ) -> Vec<String> {
        if self.stale_threshold == 0 {
            return Vec::new();
        }
        let key = stale_key(set_name, comment);
        let mut stale_map = self.stale.lock();
        let counts = stale_map.entry(key.clone()).or_default();

        for ip in resolved {
            counts.insert(ip.clone(), 0);
        }

        let existing_set: HashSet<&String> = existing.iter().collect();
        let mut stale = Vec::new();
        for entry in existing {
            if resolved.contains(entry) {
                counts.insert(entry.clone(), 0);
                continue;
            }
            let misses = counts.entry(entry.clone()).or_insert(0);
            *misses += 1;
            if *misses >= self.stale_threshold {
                stale.push(entry.clone());
                counts.remove(entry);
            }
        }

        counts.retain(|ip, _| existing_set.contains(ip) || resolved.contains(ip));
        if counts.is_empty() {
            stale_map.remove(&key);
        }
        stale
    }

    /// Drop every counter belonging to one rule in one set
    pub fn clear_stale_for_rule(&self, set_name: &str, rule: &str) {
        let prefix = stale_key(set_name, &rule_comment_prefix(rule));
        self.stale.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    fn static_target(
        &self,
        egress: EgressType,
        chain: &str,
        entry: &str,
    ) -> Result<Option<(String, IpFamily)>, IpsetError> {
        let v6 = entry.contains(':');
        if v6 && !self.ipv6_enabled {
            debug!("skipping v6 static entry {entry} with ipv6 disabled");
            return Ok(None);
        }
        let target = if v6 {
            (set_name6(egress, chain)?, IpFamily::V6)
        } else {
            (set_name(egress, chain)?, IpFamily::V4)
        };
        Ok(Some(target))
    }
}

fn stale_key(set_name: &str, comment: &str) -> String {
    format!("{set_name}|{comment}")
}
