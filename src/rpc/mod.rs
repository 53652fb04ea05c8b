//! RPC surface: protocol, listeners and the stateless handler
//!
//! Requests and responses are serde-tagged enums carried in length-prefixed
//! JSON frames over TCP and/or a Unix socket. The TCP listener can require a
//! shared-secret auth frame before the first request; the Unix listener
//! trusts the socket permissions.

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::RpcHandler;
pub use protocol::{
    decode_frame_payload, encode_frame, GenericResult, InterfaceEntry, ManageAction,
    OutboundEntry, Request, Response, RuleEntry, RuleSpec, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{RpcClient, RpcServer};
