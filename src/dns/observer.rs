//! Resolver-observer: reconciles DNS answers into kernel sets
//!
//! For every observed (domain, addresses) pair whose domain matches a rule,
//! the observer ensures the chain's set, classifies existing entries by
//! their provenance comment, purges the legacy schema, adds newly resolved
//! addresses and evicts entries that stopped resolving (immediately, or
//! after the configured number of consecutive misses).
//!
//! The observer never propagates errors into the DNS path: a single bad
//! domain must not poison the server.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::IpsetError;
use crate::ipset::tracker::{rule_comment, SetTracker};
use crate::ipset::{set_name, set_name6, IpFamily};
use crate::rules::{RuleMatch, RuleStore};

/// The resolver-observer
pub struct ResolverObserver {
    rules: Arc<RuleStore>,
    tracker: Arc<SetTracker>,
}

impl ResolverObserver {
    /// Create an observer over the given store and set tracker
    #[must_use]
    pub fn new(rules: Arc<RuleStore>, tracker: Arc<SetTracker>) -> Self {
        Self { rules, tracker }
    }

    /// Reconcile one observed answer; errors are logged, never returned
    pub async fn observe(&self, domain: &str, ips: &[IpAddr]) {
        if domain.is_empty() || ips.is_empty() {
            return;
        }
        let Some(matched) = self.rules.match_domain(domain).await else {
            return;
        };

        let v4: Vec<String> = ips
            .iter()
            .filter(|ip| ip.is_ipv4())
            .map(ToString::to_string)
            .collect();
        if !v4.is_empty() {
            if let Err(e) = self
                .reconcile_family(&matched, domain, &v4, IpFamily::V4)
                .await
            {
                error!("ipset reconciliation failed for {domain}: {e}");
            }
        }

        if self.tracker.ipv6_enabled() {
            let v6: Vec<String> = ips
                .iter()
                .filter(|ip| ip.is_ipv6())
                .map(ToString::to_string)
                .collect();
            if !v6.is_empty() {
                if let Err(e) = self
                    .reconcile_family(&matched, domain, &v6, IpFamily::V6)
                    .await
                {
                    error!("ipv6 ipset reconciliation failed for {domain}: {e}");
                }
            }
        }
    }

    async fn reconcile_family(
        &self,
        matched: &RuleMatch,
        domain: &str,
        resolved: &[String],
        family: IpFamily,
    ) -> Result<(), IpsetError> {
        let name = match family {
            IpFamily::V4 => set_name(matched.egress, &matched.chain)?,
            IpFamily::V6 => set_name6(matched.egress, &matched.chain)?,
        };
        let set = self.tracker.obtain(&name, family).await?;
        let comment = rule_comment(&matched.pattern, domain);
        let debug = self.tracker.debug_enabled();

        let entries = set.list_with_comments().await?;
        let mut existing = Vec::new();
        let mut legacy = Vec::new();
        for entry in entries {
            match entry.comment.as_deref() {
                Some(c) if c == comment => existing.push(entry.entry),
                Some(c) if c == domain => legacy.push(entry.entry),
                _ => {}
            }
        }

        for entry in &legacy {
            if debug {
                info!(
                    "ipset del: set={name} entry={entry} reason=legacy-comment \
                     domain={domain} rule={}",
                    matched.pattern
                );
            }
            set.del(entry).await?;
        }

        let resolved_set: HashSet<String> = resolved.iter().cloned().collect();
        let existing_set: HashSet<&String> = existing.iter().collect();

        for ip in &resolved_set {
            if existing_set.contains(ip) {
                continue;
            }
            if debug {
                info!(
                    "ipset add: set={name} entry={ip} reason=resolved \
                     domain={domain} rule={}",
                    matched.pattern
                );
            }
            set.add_with_comment(ip, &comment, 0).await?;
        }

        if self.tracker.stale_threshold() > 0 {
            let stale = self
                .tracker
                .collect_stale(&name, &comment, &existing, &resolved_set);
            for entry in stale {
                if debug {
                    info!(
                        "ipset del: set={name} entry={entry} reason=stale-miss \
                         threshold={} domain={domain} rule={}",
                        self.tracker.stale_threshold(),
                        matched.pattern
                    );
                }
                set.del(&entry).await?;
            }
        } else {
            for entry in &existing {
                if resolved_set.contains(entry) {
                    continue;
                }
                if debug {
                    info!(
                        "ipset del: set={name} entry={entry} reason=stale-resolve \
                         domain={domain} rule={}",
                        matched.pattern
                    );
                }
                set.del(entry).await?;
            }
        }

        Ok(())
    }
}
