//! vpner: router-resident control plane for selective tunneling
//!
//! The daemon answers local DNS queries via secure upstreams, watches the
//! answers and populates kernel IP sets with addresses of rule-matching
//! domains, and programs the firewall and policy routing so matching traffic
//! is diverted into a locally supervised proxy process or a VPN interface.
//!
//! # Architecture
//!
//! ```text
//! DNS query → embedded server → secure resolver → response to client
//!                                    ↓ (observer task)
//!                         rule match → kernel set membership
//!
//! RPC request → handler → rule store / outbound store / supervisor
//!                              ↓
//!                  ipset + iptables + policy routing
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration types and loading
//! - [`error`]: error types
//! - [`rules`]: pattern engine and the persisted rule store
//! - [`ipset`]: kernel set adapter, name derivation, shared set state
//! - [`firewall`]: iptables/policy-routing adapter
//! - [`outbound`]: subscription links, typed documents, config store
//! - [`supervisor`]: managed proxy child processes
//! - [`dns`]: embedded DNS server, resolver seam, resolver-observer
//! - [`egress`]: egress types and the egress router
//! - [`interfaces`]: tracked VPN interface registry
//! - [`rpc`]: protocol, listeners, stateless handler
//! - [`runtime`]: composition root and lifecycle

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod dns;
pub mod egress;
pub mod error;
pub mod firewall;
pub mod interfaces;
pub mod ipset;
pub mod outbound;
pub mod rpc;
pub mod rules;
pub mod runtime;
pub mod supervisor;

// Re-export commonly used types at the crate root
pub use config::{load_config, Config};
pub use egress::{EgressKind, EgressRouter, EgressType};
pub use error::{
    ConfigError, DnsError, FirewallError, InterfaceError, IpsetError, OutboundError,
    PatternError, Result, RpcError, StoreError, SupervisorError, VpnerError,
};
pub use firewall::FirewallManager;
pub use interfaces::InterfaceRegistry;
pub use ipset::{CommandRunner, IpFamily, Ipset, SetTracker, SystemRunner};
pub use outbound::{ChainFile, ChainInfo, OutboundStore};
pub use rpc::{Request, Response, RpcClient, RpcHandler, RpcServer};
pub use rules::{RuleMatch, RuleStore, RulesFile};
pub use runtime::Runtime;
pub use supervisor::ProxySupervisor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
