//! Proxy chain configuration: documents, link parsing and the config store
//!
//! A proxy chain is described by a per-chain YAML file holding the inbound
//! the child process listens on, the outbound parsed from a subscription
//! link, an auto-run flag and a metadata summary. The store owns the base
//! directory, allocates unique names and inbound ports, and rejects
//! duplicate outbounds by canonical serialization.

pub mod document;
pub mod link;
pub mod store;

pub use document::{
    BlackholeResponse, BlackholeSettings, ChainFile, ChainInfo, ChainMetadata, FreedomSettings,
    GrpcSettings, HeaderEntry, HttpUpgradeSettings, Inbound, InboundSettings, KcpHeader,
    KcpSettings, Outbound, Proxy, ProxyUser, RealitySettings, ServerEntry, ShadowsocksSettings,
    Sniffing, SplitHttpSettings, StreamSettings, TcpHeader, TcpRequest, TcpSettings, TlsSettings,
    VnextServer, VnextSettings, WsSettings,
};
pub use link::parse_link;
pub use store::{OutboundStore, CHAIN_NAME_PREFIX};
