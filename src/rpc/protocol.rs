//! RPC protocol definitions and frame codec
//!
//! Every frame is a 4-byte big-endian length followed by a JSON document.
//! Mutating operations answer with the generic `{success|error}` result;
//! listings are typed responses of their own.

use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::ipset::IpFamily;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted frame payload
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// RPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Authenticate this connection (required first on auth-enabled
    /// listeners)
    Auth {
        password: String,
    },

    /// Manage the DNS server lifecycle
    DnsManage {
        action: ManageAction,
    },

    /// List every rule chain
    RuleList,

    /// Add a rule to a chain
    RuleAdd {
        chain: String,
        pattern: String,
    },

    /// Delete a rule by its exact pattern
    RuleDel {
        pattern: String,
    },

    /// Clear the whole rule store
    RuleDeleteFile,

    /// Bulk-import rules
    RuleImportFile {
        rules: Vec<RuleSpec>,
    },

    /// List tracked interfaces
    InterfaceList,

    /// Scan the router for VPN interfaces
    InterfaceScan,

    /// Track an interface by id
    InterfaceAdd {
        id: String,
    },

    /// Untrack an interface, cascading its rule chain
    InterfaceDel {
        id: String,
    },

    /// List proxy chains
    OutboundList,

    /// Import a subscription link as a new proxy chain
    OutboundCreate {
        link: String,
        #[serde(default)]
        auto_run: bool,
    },

    /// Delete a proxy chain and everything attached to it
    OutboundDelete {
        name: String,
    },

    /// Manage a proxy chain's child process
    OutboundManage {
        name: String,
        action: ManageAction,
    },

    /// Flip a proxy chain's auto-run flag
    OutboundSetAutorun {
        name: String,
        auto_run: bool,
    },

    /// Reset and re-apply egress state after an external firewall rebuild
    HookRestore {
        #[serde(default)]
        family: Option<IpFamily>,
    },
}

/// Lifecycle actions shared by DNS and proxy management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageAction {
    Start,
    Stop,
    Status,
    Restart,
}

/// One rule in a bulk import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub egress: String,
    pub chain: String,
    pub pattern: String,
}

/// RPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Result of a mutating operation
    Result(GenericResult),

    /// Rule store listing
    RuleList {
        rules: Vec<RuleEntry>,
    },

    /// Interface listing (tracked or scanned)
    InterfaceList {
        interfaces: Vec<InterfaceEntry>,
    },

    /// Proxy chain listing
    OutboundList {
        chains: Vec<OutboundEntry>,
    },
}

impl Response {
    /// Success result with a message
    pub fn success(message: impl Into<String>) -> Self {
        Self::Result(GenericResult::Success {
            message: message.into(),
        })
    }

    /// Error result with a message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Result(GenericResult::Error {
            message: message.into(),
        })
    }

    /// Whether this is an error result
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Result(GenericResult::Error { .. }))
    }
}

/// Discriminated result of a mutating operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GenericResult {
    Success { message: String },
    Error { message: String },
}

/// One rule chain in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    pub egress: String,
    pub chain: String,
    pub patterns: Vec<String>,
}

/// One interface in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub state: String,
    pub added: bool,
}

/// One proxy chain in a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEntry {
    pub chain: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub auto_run: bool,
    pub running: bool,
    pub inbound_port: u16,
}

/// Encode a message into a length-prefixed frame
///
/// # Errors
///
/// `RpcError::Serialization` when JSON encoding fails,
/// `RpcError::MessageTooLarge` when the payload exceeds the frame limit.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, RpcError> {
    let payload =
        serde_json::to_vec(message).map_err(|e| RpcError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(RpcError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| RpcError::MessageTooLarge {
        size: payload.len(),
        max: MAX_MESSAGE_SIZE,
    })?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload (after the length prefix was consumed)
///
/// # Errors
///
/// `RpcError::Protocol` when the payload is not valid JSON for `T`.
pub fn decode_frame_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, RpcError> {
    serde_json::from_slice(payload).map_err(|e| RpcError::protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let requests = vec![
            Request::Auth {
                password: "secret".into(),
            },
            Request::DnsManage {
                action: ManageAction::Restart,
            },
            Request::RuleAdd {
                chain: "xray1".into(),
                pattern: "*.example.test".into(),
            },
            Request::OutboundCreate {
                link: "vless://u@h:443".into(),
                auto_run: true,
            },
            Request::HookRestore {
                family: Some(IpFamily::V4),
            },
            Request::HookRestore { family: None },
        ];
        for request in requests {
            let frame = encode_frame(&request).unwrap();
            let decoded: Request =
                decode_frame_payload(&frame[LENGTH_PREFIX_SIZE..]).unwrap();
            let a = serde_json::to_string(&request).unwrap();
            let b = serde_json::to_string(&decoded).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_response_envelope() {
        let ok = Response::success("done");
        assert!(!ok.is_error());
        let err = Response::error("nope");
        assert!(err.is_error());

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"result\":\"error\""));
        assert!(json.contains("nope"));
    }

    #[test]
    fn test_frame_length_prefix() {
        let frame = encode_frame(&Response::success("x")).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<Request, _> = decode_frame_payload(b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_auto_run_defaults_false() {
        let decoded: Request =
            serde_json::from_str(r#"{"type":"outbound_create","link":"ss://x"}"#).unwrap();
        let Request::OutboundCreate { auto_run, .. } = decoded else {
            panic!("wrong variant");
        };
        assert!(!auto_run);
    }
}
