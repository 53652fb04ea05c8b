//! Embedded DNS server, resolver seam and the resolver-observer
//!
//! The server answers local queries through the secure upstream resolver
//! (or a per-pattern custom upstream), writes the response, and only then
//! hands the observed answers to the observer, which keeps the kernel sets
//! of rule-matching domains current.

pub mod observer;
pub mod resolver;
pub mod server;
pub mod service;

pub use observer::ResolverObserver;
pub use resolver::{plain_exchange, BootstrapResolver, SecureResolver};
pub use server::DnsServer;
pub use service::DnsService;
