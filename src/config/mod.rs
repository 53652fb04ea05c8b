//! Configuration types and loading
//!
//! The daemon is configured from a single YAML file (path selectable via
//! `-c`). Missing fields are populated with defaults so a minimal config
//! stays minimal.

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub use types::{
    Config, DnsServerConfig, LogConfig, NetworkConfig, PathsConfig, ResolverConfig,
    RpcAuthConfig, RpcConfig, RpcTcpConfig, RpcUnixConfig,
};
