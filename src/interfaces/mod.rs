//! Tracked VPN interface registry
//!
//! The router OS exposes its interface table over a local RCI HTTP endpoint.
//! Scanning filters that table down to the VPN types this system can bind
//! rules to; adding an interface copies its descriptor into a persisted YAML
//! registry, which is what rule validation consults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::egress::EgressType;
use crate::error::InterfaceError;

/// Default RCI endpoint of the router firmware
pub const DEFAULT_STATUS_URL: &str = "http://127.0.0.1:79/rci/show/interface";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// One interface descriptor, as reported by the router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// VPN type string (matches the egress-type enum for mark kinds)
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Link state as reported ("up"/"down")
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub defaultgw: bool,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    interfaces: BTreeMap<String, InterfaceInfo>,
}

/// Persisted registry of operator-tracked interfaces
pub struct InterfaceRegistry {
    path: PathBuf,
    status_url: String,
    client: reqwest::Client,
    lock: RwLock<()>,
}

impl InterfaceRegistry {
    /// Open the registry at the given path against the default RCI endpoint
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::with_status_url(path, DEFAULT_STATUS_URL)
    }

    /// Open the registry against an explicit RCI endpoint
    #[must_use]
    pub fn with_status_url(path: PathBuf, status_url: impl Into<String>) -> Self {
        Self {
            path,
            status_url: status_url.into(),
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            lock: RwLock::new(()),
        }
    }

    /// Tracked interfaces from the registry file
    pub fn list(&self) -> Result<BTreeMap<String, InterfaceInfo>, InterfaceError> {
        let _guard = self.lock.read();
        Ok(self.read_file()?.interfaces)
    }

    /// Live interfaces from the router, filtered to VPN types
    pub async fn scan(&self) -> Result<BTreeMap<String, InterfaceInfo>, InterfaceError> {
        let response = self
            .client
            .get(&self.status_url)
            .send()
            .await
            .map_err(|e| InterfaceError::Scan(e.to_string()))?;
        let table: BTreeMap<String, InterfaceInfo> = response
            .json()
            .await
            .map_err(|e| InterfaceError::Scan(e.to_string()))?;

        Ok(table
            .into_iter()
            .filter(|(_, iface)| is_vpn_type(&iface.kind))
            .collect())
    }

    /// Track a live interface by id
    ///
    /// # Errors
    ///
    /// `NotFound` when the router does not report the id as a VPN interface,
    /// `AlreadyAdded` when it is tracked already.
    pub async fn add(&self, id: &str) -> Result<(), InterfaceError> {
        let live = self.scan().await?;
        let Some(iface) = live.get(id) else {
            return Err(InterfaceError::NotFound(id.to_string()));
        };

        let _guard = self.lock.write();
        let mut file = self.read_file()?;
        if file.interfaces.contains_key(id) {
            return Err(InterfaceError::AlreadyAdded(id.to_string()));
        }
        file.interfaces.insert(id.to_string(), iface.clone());
        self.write_file(&file)?;
        info!("interface tracked: {id} ({})", iface.kind);
        Ok(())
    }

    /// Stop tracking an interface, returning its descriptor
    pub fn remove(&self, id: &str) -> Result<InterfaceInfo, InterfaceError> {
        let _guard = self.lock.write();
        let mut file = self.read_file()?;
        let Some(iface) = file.interfaces.remove(id) else {
            return Err(InterfaceError::NotFound(id.to_string()));
        };
        self.write_file(&file)?;
        info!("interface untracked: {id}");
        Ok(iface)
    }

    /// The tracked type of an interface, if it is tracked
    pub fn tracked_type(&self, id: &str) -> Result<Option<EgressType>, InterfaceError> {
        let _guard = self.lock.read();
        Ok(self
            .read_file()?
            .interfaces
            .get(id)
            .and_then(|iface| iface.kind.parse().ok()))
    }

    fn read_file(&self) -> Result<RegistryFile, InterfaceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                if contents.trim().is_empty() {
                    return Ok(RegistryFile::default());
                }
                serde_yaml::from_str(&contents)
                    .map_err(|e| InterfaceError::Parse(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(InterfaceError::Io(e)),
        }
    }

    fn write_file(&self, file: &RegistryFile) -> Result<(), InterfaceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let yaml =
            serde_yaml::to_string(file).map_err(|e| InterfaceError::Parse(e.to_string()))?;
        std::fs::write(&self.path, yaml)?;
        Ok(())
    }
}

/// VPN types the registry accepts: every mark-kind egress type
fn is_vpn_type(kind: &str) -> bool {
    kind.parse::<EgressType>()
        .map_or(false, |t| t != EgressType::Xray)
}
