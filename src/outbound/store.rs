//! Persisted proxy chain config store
//!
//! One YAML file per chain under the base directory, named `<name>.yaml`.
//! The store allocates unique `xray<n>` names, samples a free inbound port
//! from the configured range (skipping ports claimed by sibling configs and
//! ports not actually bindable), and rejects links whose outbound section is
//! byte-identical to an existing config.

use std::net::{TcpListener, UdpSocket};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::OutboundError;

use super::document::{ChainFile, ChainInfo};
use super::link::parse_link;

/// Prefix of managed chain names
pub const CHAIN_NAME_PREFIX: &str = "xray";

/// Sampling budget for port allocation
const PORT_SAMPLE_ATTEMPTS: u32 = 1000;

/// The proxy chain config store
pub struct OutboundStore {
    base_dir: PathBuf,
    port_range: (u16, u16),
    // Serializes create/delete/update against each other; reads go straight
    // to disk and only take the shared side.
    lock: RwLock<()>,
}

impl OutboundStore {
    /// Open the store, creating the base directory if needed
    ///
    /// # Errors
    ///
    /// Returns `OutboundError::Io` when the directory cannot be created.
    pub fn new(base_dir: PathBuf, port_range: (u16, u16)) -> Result<Self, OutboundError> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            port_range,
            lock: RwLock::new(()),
        })
    }

    /// Path of a chain's config file
    #[must_use]
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.yaml"))
    }

    /// Import a subscription link as a new chain
    ///
    /// Allocates an inbound port and a unique name, rejects duplicates by
    /// outbound identity, persists and returns the new chain name.
    pub fn create(&self, link: &str, auto_run: bool) -> Result<String, OutboundError> {
        let _guard = self.lock.write();

        let port = self.find_free_port()?;
        let mut config = parse_link(link, port)?;

        if self.is_duplicate(&config) {
            return Err(OutboundError::Duplicate);
        }

        config.auto_run = auto_run;
        config.metadata.socks_port = port;

        let name = self.generate_unique_name();
        self.write_config(&name, &config)?;
        info!("proxy chain created: {name} (inbound port {port})");
        Ok(name)
    }

    /// Delete a chain's config file
    pub fn delete(&self, name: &str) -> Result<(), OutboundError> {
        let _guard = self.lock.write();
        let path = self.config_path(name);
        if !path.exists() {
            return Err(OutboundError::NotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        info!("proxy chain deleted: {name}");
        Ok(())
    }

    /// Read one chain's document
    pub fn read(&self, name: &str) -> Result<ChainFile, OutboundError> {
        let _guard = self.lock.read();
        self.read_config(&self.config_path(name))
            .map_err(|e| match e {
                OutboundError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                    OutboundError::NotFound(name.to_string())
                }
                other => other,
            })
    }

    /// Names of every stored chain, sorted
    pub fn list(&self) -> Result<Vec<String>, OutboundError> {
        let _guard = self.lock.read();
        let mut names = self.scan_names()?;
        names.sort();
        Ok(names)
    }

    /// Names of chains marked auto-run
    pub fn list_auto_run(&self) -> Result<Vec<String>, OutboundError> {
        let _guard = self.lock.read();
        let mut names = Vec::new();
        for name in self.scan_names()? {
            match self.read_config(&self.config_path(&name)) {
                Ok(cfg) if cfg.auto_run => names.push(name),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable config {name}: {e}"),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Listing summary for one chain
    pub fn info(&self, name: &str) -> Result<ChainInfo, OutboundError> {
        Ok(self.read(name)?.to_info())
    }

    /// Listing summaries for every chain; unreadable files are skipped
    pub fn list_info(&self) -> Result<Vec<(String, ChainInfo)>, OutboundError> {
        let _guard = self.lock.read();
        let mut result = Vec::new();
        for name in self.scan_names()? {
            match self.read_config(&self.config_path(&name)) {
                Ok(cfg) => result.push((name, cfg.to_info())),
                Err(e) => warn!("skipping unreadable config {name}: {e}"),
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// Flip a chain's auto-run flag
    pub fn set_auto_run(&self, name: &str, auto_run: bool) -> Result<(), OutboundError> {
        let _guard = self.lock.write();
        let path = self.config_path(name);
        let mut config = self.read_config(&path).map_err(|e| match e {
            OutboundError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                OutboundError::NotFound(name.to_string())
            }
            other => other,
        })?;
        if config.auto_run == auto_run {
            return Ok(());
        }
        config.auto_run = auto_run;
        self.write_config(name, &config)?;
        debug!("proxy chain {name} auto_run set to {auto_run}");
        Ok(())
    }

    /// Whether a name is one of ours: managed prefix plus a file on disk
    #[must_use]
    pub fn is_managed_chain(&self, name: &str) -> bool {
        if !name.starts_with(CHAIN_NAME_PREFIX) {
            return false;
        }
        let _guard = self.lock.read();
        self.config_path(name).exists()
    }

    fn scan_names(&self) -> Result<Vec<String>, OutboundError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(".yaml") {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn read_config(&self, path: &Path) -> Result<ChainFile, OutboundError> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| OutboundError::Parse {
            name: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn write_config(&self, name: &str, config: &ChainFile) -> Result<(), OutboundError> {
        let yaml = serde_yaml::to_string(config).map_err(|e| OutboundError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(self.config_path(name), yaml)?;
        Ok(())
    }

    fn is_duplicate(&self, config: &ChainFile) -> bool {
        let identity = config.outbound_identity();
        let Ok(names) = self.scan_names() else {
            return false;
        };
        for name in names {
            if let Ok(existing) = self.read_config(&self.config_path(&name)) {
                if existing.outbound_identity() == identity {
                    return true;
                }
            }
        }
        false
    }

    fn generate_unique_name(&self) -> String {
        for i in 1.. {
            let name = format!("{CHAIN_NAME_PREFIX}{i}");
            if !self.config_path(&name).exists() {
                return name;
            }
        }
        unreachable!()
    }

    /// Ports already promised to sibling configs
    fn used_inbound_ports(&self) -> Vec<u16> {
        let mut used = Vec::new();
        let Ok(names) = self.scan_names() else {
            return used;
        };
        for name in names {
            if let Ok(cfg) = self.read_config(&self.config_path(&name)) {
                if cfg.metadata.socks_port != 0 {
                    used.push(cfg.metadata.socks_port);
                } else {
                    used.extend(cfg.inbounds.iter().map(|i| i.port));
                }
            }
        }
        used
    }

    fn find_free_port(&self) -> Result<u16, OutboundError> {
        let (min, max) = self.port_range;
        let used = self.used_inbound_ports();
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_SAMPLE_ATTEMPTS {
            let port = rng.gen_range(min..max);
            if used.contains(&port) {
                continue;
            }
            if port_is_free(port) {
                return Ok(port);
            }
        }
        Err(OutboundError::NoFreePort { min, max })
    }
}

/// A port is free when it binds for both TCP and UDP on localhost
fn port_is_free(port: u16) -> bool {
    let tcp = TcpListener::bind(("127.0.0.1", port));
    if tcp.is_err() {
        return false;
    }
    UdpSocket::bind(("127.0.0.1", port)).is_ok()
}
