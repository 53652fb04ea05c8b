//! Configuration structures for the vpner daemon
//!
//! Configuration is loaded from YAML and validated at startup. Every section
//! has serde defaults so absent keys behave like the documented defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default location of the persisted rule store
pub const DEFAULT_RULES_PATH: &str = "/opt/etc/vpner/vpner_unblock.yaml";

/// Default base directory for proxy chain configs
pub const DEFAULT_OUTBOUND_DIR: &str = "/opt/etc/vpner/xray";

/// Default location of the tracked-interface registry
pub const DEFAULT_INTERFACES_PATH: &str = "/opt/etc/vpner/vpn_interfaces.yaml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Embedded DNS server
    #[serde(rename = "dns-server", default)]
    pub dns_server: DnsServerConfig,

    /// Secure-DNS upstream resolver
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// RPC listeners and auth
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Persisted file locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// LAN/ipset/network knobs
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dns_server.port == 0 {
            return Err(ConfigError::ValidationError(
                "dns-server.port must be greater than 0".into(),
            ));
        }
        if self.dns_server.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "dns-server.max-concurrent must be greater than 0".into(),
            ));
        }

        if self.rpc.tcp.enabled {
            self.rpc.tcp.address.parse::<SocketAddr>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "rpc.tcp.address is not a valid socket address: {}",
                    self.rpc.tcp.address
                ))
            })?;
            if self.rpc.tcp.auth && self.rpc.auth.password.is_empty() {
                return Err(ConfigError::ValidationError(
                    "rpc.tcp.auth requires rpc.auth.password".into(),
                ));
            }
        }
        if self.rpc.unix.enabled && self.rpc.unix.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "rpc.unix.path must not be empty".into(),
            ));
        }

        if self.outbound_port_range().0 >= self.outbound_port_range().1 {
            return Err(ConfigError::ValidationError(
                "network.port-min must be below network.port-max".into(),
            ));
        }

        Ok(())
    }

    /// Inbound port allocation range for proxy chains
    #[must_use]
    pub const fn outbound_port_range(&self) -> (u16, u16) {
        (self.network.port_min, self.network.port_max)
    }
}

/// Embedded DNS server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DnsServerConfig {
    /// Listen port (UDP and TCP)
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Maximum concurrently in-flight handler tasks
    #[serde(rename = "max-concurrent", default = "default_dns_concurrency")]
    pub max_concurrent: usize,

    /// Log every query and response
    #[serde(default)]
    pub verbose: bool,

    /// Upstream endpoint -> domain patterns resolved through it directly
    #[serde(rename = "custom-resolve", default)]
    pub custom_resolve: HashMap<String, Vec<String>>,

    /// Auto-start the server on daemon startup
    #[serde(default)]
    pub running: bool,
}

impl Default for DnsServerConfig {
    fn default() -> Self {
        Self {
            port: default_dns_port(),
            max_concurrent: default_dns_concurrency(),
            verbose: false,
            custom_resolve: HashMap::new(),
            running: false,
        }
    }
}

/// Secure-DNS upstream resolver configuration
///
/// The transport behind `servers` is an external collaborator; `resolvers`
/// are plain DNS endpoints used to bootstrap upstream hostnames and as a
/// fallback forwarding path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Ordered upstream URLs
    #[serde(default)]
    pub servers: Vec<String>,

    /// Ordered plain resolvers for bootstrapping
    #[serde(default)]
    pub resolvers: Vec<String>,

    /// Cache TTL for typed-query results, in seconds
    #[serde(rename = "cache-ttl", default = "default_cache_ttl")]
    pub cache_ttl: u64,

    /// Log upstream selection and failures
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            resolvers: Vec::new(),
            cache_ttl: default_cache_ttl(),
            verbose: false,
        }
    }
}

/// RPC configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    /// TCP listener
    #[serde(default)]
    pub tcp: RpcTcpConfig,

    /// Unix-socket listener
    #[serde(default)]
    pub unix: RpcUnixConfig,

    /// Shared-secret auth
    #[serde(default)]
    pub auth: RpcAuthConfig,
}

/// TCP RPC listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcTcpConfig {
    /// Enable the TCP listener
    #[serde(default)]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_rpc_address")]
    pub address: String,

    /// Require the shared password on this listener
    #[serde(default)]
    pub auth: bool,
}

impl Default for RpcTcpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_rpc_address(),
            auth: false,
        }
    }
}

/// Unix-socket RPC listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcUnixConfig {
    /// Enable the Unix listener
    #[serde(default)]
    pub enabled: bool,

    /// Socket path
    #[serde(default = "default_rpc_socket")]
    pub path: PathBuf,
}

impl Default for RpcUnixConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_rpc_socket(),
        }
    }
}

/// RPC shared-secret configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcAuthConfig {
    /// Password checked on auth-required listeners
    #[serde(default)]
    pub password: String,
}

/// Persisted file locations
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Rule store file
    #[serde(rename = "unblock-rules", default = "default_rules_path")]
    pub unblock_rules: PathBuf,

    /// Proxy chain config directory
    #[serde(rename = "outbound-dir", default = "default_outbound_dir")]
    pub outbound_dir: PathBuf,

    /// Tracked-interface registry file
    #[serde(rename = "interfaces", default = "default_interfaces_path")]
    pub interfaces: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            unblock_rules: default_rules_path(),
            outbound_dir: default_outbound_dir(),
            interfaces: default_interfaces_path(),
        }
    }
}

/// LAN / kernel-set behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// LAN interface the diversion rules match on
    #[serde(rename = "lan-interface", default = "default_lan_interface")]
    pub lan_interface: String,

    /// Mirror rules and sets for IPv6
    #[serde(rename = "enable-ipv6", default)]
    pub enable_ipv6: bool,

    /// Log every set add/delete with its reason
    #[serde(rename = "ipset-debug", default)]
    pub ipset_debug: bool,

    /// Consecutive resolution misses before evicting a dynamic entry.
    /// Zero evicts immediately.
    #[serde(rename = "stale-queries", default)]
    pub stale_queries: u32,

    /// Lower bound of the proxy inbound port range
    #[serde(rename = "port-min", default = "default_port_min")]
    pub port_min: u16,

    /// Upper bound of the proxy inbound port range
    #[serde(rename = "port-max", default = "default_port_max")]
    pub port_max: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            lan_interface: default_lan_interface(),
            enable_ipv6: false,
            ipset_debug: false,
            stale_queries: 0,
            port_min: default_port_min(),
            port_max: default_port_max(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_concurrency() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_rpc_address() -> String {
    "0.0.0.0:50051".into()
}

fn default_rpc_socket() -> PathBuf {
    PathBuf::from("/opt/var/run/vpnerd.sock")
}

fn default_rules_path() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

fn default_outbound_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTBOUND_DIR)
}

fn default_interfaces_path() -> PathBuf {
    PathBuf::from(DEFAULT_INTERFACES_PATH)
}

fn default_lan_interface() -> String {
    "br0".into()
}

fn default_port_min() -> u16 {
    1080
}

fn default_port_max() -> u16 {
    20000
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dns_server.port, 53);
        assert_eq!(config.dns_server.max_concurrent, 100);
        assert_eq!(config.resolver.cache_ttl, 300);
        assert_eq!(config.network.lan_interface, "br0");
        assert!(!config.network.enable_ipv6);
        assert_eq!(config.outbound_port_range(), (1080, 20000));
        config.validate().unwrap();
    }

    #[test]
    fn test_tcp_auth_requires_password() {
        let mut config = Config::default();
        config.rpc.tcp.enabled = true;
        config.rpc.tcp.auth = true;
        assert!(config.validate().is_err());

        config.rpc.auth.password = "secret".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_tcp_address() {
        let mut config = Config::default();
        config.rpc.tcp.enabled = true;
        config.rpc.tcp.address = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = Config::default();
        config.network.port_min = 5000;
        config.network.port_max = 5000;
        assert!(config.validate().is_err());
    }
}
