//! Firewall and policy-routing adapter
//!
//! Programs iptables/ip6tables chains and `ip rule`/`ip route` objects that
//! divert set-matching traffic into a proxy port or a VPN device.

pub mod manager;

pub use manager::{FirewallManager, PRIVATE_CHAIN_PREFIX};
