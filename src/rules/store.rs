//! Persisted rule store
//!
//! A YAML file maps each egress type to operator-chosen chains, each holding
//! an ordered list of patterns. Mutations are write-through: the file is
//! rewritten under the store lock, and literal IP/CIDR rules are synced into
//! their chain's kernel set in the same operation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::egress::EgressType;
use crate::error::StoreError;
use crate::ipset::SetTracker;

use super::pattern;

/// Ordered rules per chain; `BTreeMap` keeps serialization stable
pub type ChainRules = BTreeMap<String, Vec<String>>;

/// The persisted shape of the rule store
///
/// Fixed top-level keys, one per egress type; absent keys are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(rename = "Xray", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xray: ChainRules,
    #[serde(rename = "OpenVPN", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub open_vpn: ChainRules,
    #[serde(rename = "Wireguard", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wireguard: ChainRules,
    #[serde(rename = "IKE", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ike: ChainRules,
    #[serde(rename = "SSTP", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sstp: ChainRules,
    #[serde(rename = "PPPOE", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pppoe: ChainRules,
    #[serde(rename = "L2TP", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub l2tp: ChainRules,
    #[serde(rename = "PPTP", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pptp: ChainRules,
}

impl RulesFile {
    /// Chains of one egress type
    #[must_use]
    pub fn chains(&self, egress: EgressType) -> &ChainRules {
        match egress {
            EgressType::Xray => &self.xray,
            EgressType::OpenVPN => &self.open_vpn,
            EgressType::Wireguard => &self.wireguard,
            EgressType::IKE => &self.ike,
            EgressType::SSTP => &self.sstp,
            EgressType::PPPOE => &self.pppoe,
            EgressType::L2TP => &self.l2tp,
            EgressType::PPTP => &self.pptp,
        }
    }

    fn chains_mut(&mut self, egress: EgressType) -> &mut ChainRules {
        match egress {
            EgressType::Xray => &mut self.xray,
            EgressType::OpenVPN => &mut self.open_vpn,
            EgressType::Wireguard => &mut self.wireguard,
            EgressType::IKE => &mut self.ike,
            EgressType::SSTP => &mut self.sstp,
            EgressType::PPPOE => &mut self.pppoe,
            EgressType::L2TP => &mut self.l2tp,
            EgressType::PPTP => &mut self.pptp,
        }
    }

    /// Iterate every (egress, chain, patterns) triple
    pub fn iter(&self) -> impl Iterator<Item = (EgressType, &str, &[String])> {
        EgressType::ALL.into_iter().flat_map(move |egress| {
            self.chains(egress)
                .iter()
                .map(move |(chain, patterns)| (egress, chain.as_str(), patterns.as_slice()))
        })
    }
}

/// A successful domain match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Egress type of the matching chain
    pub egress: EgressType,
    /// Chain name
    pub chain: String,
    /// The pattern that matched
    pub pattern: String,
}

/// The persisted rule store
pub struct RuleStore {
    path: PathBuf,
    tracker: Arc<SetTracker>,
    inner: RwLock<RulesFile>,
}

impl RuleStore {
    /// Create a store over the given file; call [`RuleStore::init`] before use
    #[must_use]
    pub fn new(path: PathBuf, tracker: Arc<SetTracker>) -> Self {
        Self {
            path,
            tracker,
            inner: RwLock::new(RulesFile::default()),
        }
    }

    /// Load the persisted state and re-add every static entry to its set
    ///
    /// A missing file is an empty store. Static re-add failures are logged
    /// and do not abort startup.
    pub async fn init(&self) -> Result<(), StoreError> {
        let loaded = self.load_file()?;
        {
            let mut inner = self.inner.write().await;
            *inner = loaded;
        }

        let snapshot = self.inner.read().await.clone();
        let mut statics = 0usize;
        for (egress, chain, patterns) in snapshot.iter() {
            for p in patterns {
                if !pattern::is_network(p) {
                    continue;
                }
                statics += 1;
                if let Err(e) = self.tracker.add_static(egress, chain, p).await {
                    warn!("failed to re-add static entry {p} to [{egress}/{chain}]: {e}");
                }
            }
        }
        if statics > 0 {
            info!("re-added {statics} static entries to kernel sets");
        }
        Ok(())
    }

    /// Add a rule to a chain
    ///
    /// Rejects an identical pattern anywhere in the store as a duplicate and
    /// any overlapping pattern as a conflict; on success persists and, for a
    /// literal IP/CIDR, adds the no-timeout kernel entry.
    pub async fn add(
        &self,
        egress: EgressType,
        chain: &str,
        new_pattern: &str,
    ) -> Result<(), StoreError> {
        pattern::validate(new_pattern)?;
        if chain.is_empty() {
            return Err(StoreError::ChainNotFound(String::new()));
        }

        let mut inner = self.inner.write().await;

        for (existing_egress, existing_chain, patterns) in inner.iter() {
            for existing in patterns {
                if existing == new_pattern {
                    return Err(StoreError::Duplicate(
                        new_pattern.to_string(),
                        existing_egress.to_string(),
                        existing_chain.to_string(),
                    ));
                }
                if pattern::overlap(existing, new_pattern) {
                    return Err(StoreError::Overlap {
                        new: new_pattern.to_string(),
                        existing: existing.clone(),
                        egress: existing_egress.to_string(),
                        chain: existing_chain.to_string(),
                    });
                }
            }
        }

        inner
            .chains_mut(egress)
            .entry(chain.to_string())
            .or_default()
            .push(new_pattern.to_string());
        self.persist(&inner)?;
        drop(inner);

        if pattern::is_network(new_pattern) {
            self.tracker.add_static(egress, chain, new_pattern).await?;
        }
        debug!("rule added: [{egress}/{chain}] {new_pattern}");
        Ok(())
    }

    /// Delete a rule from a chain
    ///
    /// Removes the chain entry when it becomes empty. Static rules are
    /// removed from the kernel set; domain rules trigger the dynamic sweep.
    pub async fn delete(
        &self,
        egress: EgressType,
        chain: &str,
        target: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        let chains = inner.chains_mut(egress);
        let Some(patterns) = chains.get_mut(chain) else {
            return Err(StoreError::ChainNotFound(chain.to_string()));
        };
        let before = patterns.len();
        patterns.retain(|p| p != target);
        if patterns.len() == before {
            return Err(StoreError::PatternNotFound(chain.to_string()));
        }
        if patterns.is_empty() {
            chains.remove(chain);
        }
        self.persist(&inner)?;
        drop(inner);

        if pattern::is_network(target) {
            self.tracker.remove_static(egress, chain, target).await?;
        } else {
            self.tracker.sweep_rule(egress, chain, target).await?;
        }
        debug!("rule deleted: [{egress}/{chain}] {target}");
        Ok(())
    }

    /// Remove a whole chain and every kernel entry belonging to it
    pub async fn delete_chain(&self, egress: EgressType, chain: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        // Deleting a chain that holds no rules is a no-op, not an error:
        // callers cascade this from proxy/interface deletion.
        if inner.chains_mut(egress).remove(chain).is_some() {
            self.persist(&inner)?;
        }
        drop(inner);

        self.tracker.drop_chain(egress, chain).await?;
        info!("rule chain removed: [{egress}/{chain}]");
        Ok(())
    }

    /// Clear the whole store and flush every dependent kernel entry
    pub async fn clear(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.read().await.clone();
        for (egress, chain, _) in snapshot.iter() {
            self.tracker.drop_chain(egress, chain).await?;
        }

        let mut inner = self.inner.write().await;
        *inner = RulesFile::default();
        self.persist(&inner)?;
        Ok(())
    }

    /// First-match lookup of a domain across all chains
    pub async fn match_domain(&self, domain: &str) -> Option<RuleMatch> {
        let inner = self.inner.read().await;
        for (egress, chain, patterns) in inner.iter() {
            for p in patterns {
                if pattern::matches(p, domain) {
                    return Some(RuleMatch {
                        egress,
                        chain: chain.to_string(),
                        pattern: p.clone(),
                    });
                }
            }
        }
        None
    }

    /// Locate the chain holding an exact pattern
    pub async fn find_pattern(&self, target: &str) -> Option<(EgressType, String)> {
        let inner = self.inner.read().await;
        for (egress, chain, patterns) in inner.iter() {
            if patterns.iter().any(|p| p == target) {
                return Some((egress, chain.to_string()));
            }
        }
        None
    }

    /// Snapshot of the whole store for listing
    pub async fn get_all(&self) -> RulesFile {
        self.inner.read().await.clone()
    }

    fn load_file(&self) -> Result<RulesFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                if contents.trim().is_empty() {
                    return Ok(RulesFile::default());
                }
                serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RulesFile::default()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn persist(&self, data: &RulesFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let yaml = serde_yaml::to_string(data).map_err(|e| StoreError::Parse(e.to_string()))?;
        std::fs::write(&self.path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::runner::mock::ScriptedRunner;
    use crate::ipset::CommandRunner;
    use tempfile::TempDir;

    fn store_with_runner(dir: &TempDir) -> (Arc<ScriptedRunner>, RuleStore) {
        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        let tracker = Arc::new(SetTracker::new(dynamic, true, false, 0));
        let store = RuleStore::new(dir.path().join("rules.yaml"), tracker);
        (scripted, store)
    }

    #[tokio::test]
    async fn test_add_and_match() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        store
            .add(EgressType::Xray, "xray1", "*.example.test")
            .await
            .unwrap();
        store
            .add(EgressType::Wireguard, "wg0", "other.test")
            .await
            .unwrap();

        let m = store.match_domain("a.example.test").await.unwrap();
        assert_eq!(m.egress, EgressType::Xray);
        assert_eq!(m.chain, "xray1");
        assert_eq!(m.pattern, "*.example.test");

        assert!(store.match_domain("unmatched.test").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_and_overlap_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        store
            .add(EgressType::Xray, "xray1", "*.example.com")
            .await
            .unwrap();
        let before = store.get_all().await;

        let err = store
            .add(EgressType::Xray, "xray2", "*.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(..)));

        let err = store
            .add(EgressType::Wireguard, "wg0", "sub.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Overlap { .. }));

        let err = store
            .add(EgressType::Xray, "xray1", "*example*")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Overlap { .. }));

        // Failed adds leave the store unchanged
        assert_eq!(store.get_all().await, before);
    }

    #[tokio::test]
    async fn test_static_rule_syncs_kernel_set() {
        let dir = TempDir::new().unwrap();
        let (scripted, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        store
            .add(EgressType::Xray, "xray1", "203.0.113.0/24")
            .await
            .unwrap();
        assert!(scripted.saw("add vpner-Xray-xray1 203.0.113.0/24 -exist"));

        store
            .delete(EgressType::Xray, "xray1", "203.0.113.0/24")
            .await
            .unwrap();
        assert!(scripted.saw("del vpner-Xray-xray1 203.0.113.0/24"));
    }

    #[tokio::test]
    async fn test_delete_sweeps_dynamic_entries() {
        let dir = TempDir::new().unwrap();
        let (scripted, store) = store_with_runner(&dir);
        store.init().await.unwrap();
        scripted.script(
            "save vpner-Xray-xray1",
            0,
            "create vpner-Xray-xray1 hash:net family inet comment\n\
             add vpner-Xray-xray1 198.51.100.7 comment \"rule=*.example.test|domain=a.example.test\"\n",
        );
        scripted.script("-q list vpner-Xray-xray1-6", 1, "");

        store
            .add(EgressType::Xray, "xray1", "*.example.test")
            .await
            .unwrap();
        store
            .delete(EgressType::Xray, "xray1", "*.example.test")
            .await
            .unwrap();

        assert!(scripted.saw("del vpner-Xray-xray1 198.51.100.7"));
    }

    #[tokio::test]
    async fn test_add_delete_round_trip_is_bytewise_identical() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        store
            .add(EgressType::Xray, "xray1", "*.keep.test")
            .await
            .unwrap();
        let before = std::fs::read(dir.path().join("rules.yaml")).unwrap();

        store
            .add(EgressType::Wireguard, "wg0", "*.transient.test")
            .await
            .unwrap();
        store
            .delete(EgressType::Wireguard, "wg0", "*.transient.test")
            .await
            .unwrap();

        let after = std::fs::read(dir.path().join("rules.yaml")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        let err = store
            .delete(EgressType::Xray, "nochain", "x.test")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ChainNotFound(_)));

        store.add(EgressType::Xray, "xray1", "a.test").await.unwrap();
        let err = store
            .delete(EgressType::Xray, "xray1", "b.test")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PatternNotFound(_)));
    }

    #[tokio::test]
    async fn test_init_readds_static_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "Xray:\n  xray1:\n  - '*.example.test'\n  - 203.0.113.0/24\n",
        )
        .unwrap();

        let scripted = Arc::new(ScriptedRunner::new());
        let dynamic: Arc<dyn CommandRunner> = scripted.clone() as Arc<dyn CommandRunner>;
        let tracker = Arc::new(SetTracker::new(dynamic, true, false, 0));
        let store = RuleStore::new(path, tracker);
        store.init().await.unwrap();

        assert!(scripted.saw("add vpner-Xray-xray1 203.0.113.0/24 -exist"));
        // Domain patterns are not statically synced
        assert_eq!(scripted.count("add vpner-Xray-xray1 "), 1);
    }

    #[tokio::test]
    async fn test_find_pattern_and_chain_delete() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_with_runner(&dir);
        store.init().await.unwrap();

        store.add(EgressType::Xray, "xray1", "a.test").await.unwrap();
        store.add(EgressType::Xray, "xray1", "b.test").await.unwrap();

        let (egress, chain) = store.find_pattern("b.test").await.unwrap();
        assert_eq!(egress, EgressType::Xray);
        assert_eq!(chain, "xray1");

        store.delete_chain(EgressType::Xray, "xray1").await.unwrap();
        assert!(store.match_domain("a.test").await.is_none());
        assert!(store.get_all().await.xray.is_empty());
    }
}
