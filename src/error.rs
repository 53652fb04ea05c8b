//! Error types for vpner
//!
//! This module defines the error hierarchy for the control plane. All errors
//! are categorized by subsystem; RPC handlers translate them into the generic
//! response envelope, the runtime aborts only on startup-class errors.

use std::io;

use thiserror::Error;

/// Top-level error type for vpner
#[derive(Debug, Error)]
pub enum VpnerError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pattern validation errors
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Rule store errors
    #[error("Rule store error: {0}")]
    Store(#[from] StoreError),

    /// Kernel set adapter errors
    #[error("ipset error: {0}")]
    Ipset(#[from] IpsetError),

    /// Firewall/routing adapter errors
    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// Outbound-config store errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// Interface registry errors
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// Process supervisor errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// DNS server / resolver errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// RPC transport errors
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VpnerError {
    /// Check whether this error must abort startup.
    ///
    /// Only missing/unsupported external tools and unreadable configuration
    /// are fatal; everything else is surfaced to the caller and the process
    /// keeps running.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Ipset(e) => e.is_startup_fatal(),
            _ => false,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Pattern engine errors
///
/// All of these are validation failures and never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// Empty pattern string
    #[error("pattern cannot be empty")]
    Empty,

    /// Domain pattern contains a path separator
    #[error("invalid domain pattern: contains '/'")]
    ContainsSlash,

    /// Domain pattern contains glob characters other than '*'
    #[error("invalid characters: only '*' allowed")]
    InvalidCharacters,

    /// More than two wildcards
    #[error("maximum two '*' allowed")]
    TooManyWildcards,

    /// Two wildcards not at both ends
    #[error("two '*' must be only at start and end")]
    WildcardPlacementPair,

    /// Single wildcard in the middle
    #[error("single '*' can be only at start or end")]
    WildcardPlacementSingle,
}

/// Rule store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid pattern
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Unknown egress type key
    #[error("unknown egress type: {0}")]
    UnknownType(String),

    /// Chain does not exist
    #[error("no rules found for chain: {0}")]
    ChainNotFound(String),

    /// Pattern does not exist in the chain
    #[error("pattern not found in chain: {0}")]
    PatternNotFound(String),

    /// The exact pattern is already present
    #[error("rule '{0}' already exists in [{1}/{2}]")]
    Duplicate(String, String, String),

    /// New pattern overlaps an existing one
    #[error("new rule '{new}' overlaps with existing rule '{existing}' in [{egress}/{chain}]")]
    Overlap {
        new: String,
        existing: String,
        egress: String,
        chain: String,
    },

    /// Kernel set sync failed while mutating the store
    #[error(transparent)]
    Ipset(#[from] IpsetError),

    /// Persistence failure
    #[error("failed to persist rules: {0}")]
    Io(#[from] io::Error),

    /// Persisted file is not valid YAML
    #[error("failed to parse rules file: {0}")]
    Parse(String),
}

/// Kernel set adapter errors
#[derive(Debug, Error)]
pub enum IpsetError {
    /// The ipset binary is not on PATH
    #[error("ipset utility not found")]
    ToolMissing,

    /// The installed ipset is older than the minimum supported version
    #[error("ipset version must be >= {minimum} (found {found})")]
    UnsupportedVersion { minimum: String, found: String },

    /// A set name would exceed the kernel limit or an input was empty
    #[error("invalid set name: {0}")]
    InvalidName(String),

    /// An ipset invocation failed; carries the combined command output
    #[error("ipset {command} failed: {output}")]
    Tool { command: String, output: String },

    /// Failed to spawn the external tool
    #[error("failed to run ipset: {0}")]
    Spawn(#[from] io::Error),
}

impl IpsetError {
    /// Tool discovery and version errors abort startup
    #[must_use]
    pub const fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::ToolMissing | Self::UnsupportedVersion { .. })
    }

    /// Create a tool-invocation error from a command line and its output
    pub fn tool(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Tool {
            command: command.into(),
            output: output.into(),
        }
    }
}

/// Firewall/routing adapter errors
#[derive(Debug, Error)]
pub enum FirewallError {
    /// Unsupported egress type string
    #[error("unsupported egress type: {0}")]
    UnsupportedType(String),

    /// No routing state recorded for the given set
    #[error("no routing info found for set: {0}")]
    NotTracked(String),

    /// VPN-mark egress requires a device to route through
    #[error("missing VPN device for set: {0}")]
    MissingDevice(String),

    /// An iptables/ip invocation failed
    #[error("{command} failed: {output}")]
    Tool { command: String, output: String },

    /// Failed to spawn the external tool
    #[error("failed to run firewall tool: {0}")]
    Spawn(#[from] io::Error),
}

impl FirewallError {
    /// Create a tool-invocation error from a command line and its output
    pub fn tool(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Tool {
            command: command.into(),
            output: output.into(),
        }
    }
}

/// Outbound-config store errors
#[derive(Debug, Error)]
pub enum OutboundError {
    /// The subscription link could not be parsed
    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// The link scheme is not one of vless/vmess/ss
    #[error("unsupported link scheme")]
    UnsupportedScheme,

    /// A config with an identical outbound section already exists
    #[error("duplicate configuration exists")]
    Duplicate,

    /// No config with that name
    #[error("no such proxy config: {0}")]
    NotFound(String),

    /// Inbound port allocation exhausted the sampling budget
    #[error("no free port found in {min}..{max}")]
    NoFreePort { min: u16, max: u16 },

    /// File I/O on the config directory
    #[error("config store I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted config is not valid YAML
    #[error("failed to parse config {name}: {reason}")]
    Parse { name: String, reason: String },
}

/// Interface registry errors
#[derive(Debug, Error)]
pub enum InterfaceError {
    /// Interface not known to the router
    #[error("interface {0} not found")]
    NotFound(String),

    /// Interface already tracked
    #[error("interface {0} already added")]
    AlreadyAdded(String),

    /// Router RCI endpoint unreachable or returned garbage
    #[error("failed to scan interfaces: {0}")]
    Scan(String),

    /// Registry file I/O
    #[error("interface registry I/O error: {0}")]
    Io(#[from] io::Error),

    /// Registry file is not valid YAML
    #[error("failed to parse interface registry: {0}")]
    Parse(String),
}

/// Process supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Chain already has a running child
    #[error("chain {0} already started")]
    AlreadyRunning(String),

    /// Chain has no running child
    #[error("{0} not running")]
    NotRunning(String),

    /// The config backing the chain does not exist
    #[error("no such proxy config: {0}")]
    ConfigMissing(String),

    /// Child exited within the settle window
    #[error("child for {name} exited during settle window: {reason}")]
    ExitedEarly { name: String, reason: String },

    /// Failed to spawn the child process
    #[error("failed to start child for {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Aggregate of per-chain failures from a start-all pass
    #[error("failed to start chains: {}", format_failures(.0))]
    Aggregate(Vec<(String, String)>),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// DNS server and resolver errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// Server is already running
    #[error("DNS server already running")]
    AlreadyRunning,

    /// Failed to bind the listening sockets
    #[error("failed to bind DNS server on port {port}: {reason}")]
    BindError { port: u16, reason: String },

    /// Malformed DNS message
    #[error("failed to decode DNS message: {0}")]
    DecodeError(String),

    /// Failed to encode a DNS message
    #[error("failed to encode DNS message: {0}")]
    EncodeError(String),

    /// Every configured upstream failed
    #[error("all upstream resolvers failed")]
    AllUpstreamsFailed,

    /// A single upstream exchange failed
    #[error("upstream {upstream} failed: {reason}")]
    UpstreamFailed { upstream: String, reason: String },

    /// Resolution produced no usable records
    #[error("no A/AAAA records found for {0}")]
    NoRecords(String),

    /// I/O on the server sockets
    #[error("DNS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// RPC transport errors
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to bind a listener
    #[error("failed to bind RPC listener on {address}: {reason}")]
    BindError { address: String, reason: String },

    /// Frame exceeds the maximum message size
    #[error("RPC message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Invalid frame payload
    #[error("RPC protocol error: {0}")]
    Protocol(String),

    /// Client did not authenticate
    #[error("authentication required")]
    AuthRequired,

    /// Wrong password
    #[error("invalid password")]
    AuthFailed,

    /// Serialization failure
    #[error("RPC serialization error: {0}")]
    Serialization(String),

    /// I/O on a connection
    #[error("RPC I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Type alias for Result with `VpnerError`
pub type Result<T> = std::result::Result<T, VpnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_fatal_classification() {
        let err: VpnerError = IpsetError::ToolMissing.into();
        assert!(err.is_startup_fatal());

        let err: VpnerError = IpsetError::tool("ipset add", "kernel says no").into();
        assert!(!err.is_startup_fatal());

        let err: VpnerError = ConfigError::ValidationError("bad".into()).into();
        assert!(err.is_startup_fatal());

        let err: VpnerError = SupervisorError::NotRunning("xray1".into()).into();
        assert!(!err.is_startup_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = IpsetError::UnsupportedVersion {
            minimum: "6.0".into(),
            found: "4.5".into(),
        };
        assert!(err.to_string().contains("6.0"));
        assert!(err.to_string().contains("4.5"));

        let err = StoreError::Overlap {
            new: "*example*".into(),
            existing: "*.example.com".into(),
            egress: "Xray".into(),
            chain: "xray1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("*example*"));
        assert!(msg.contains("[Xray/xray1]"));
    }

    #[test]
    fn test_aggregate_formatting() {
        let err = SupervisorError::Aggregate(vec![
            ("xray1".into(), "boom".into()),
            ("xray2".into(), "bang".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("xray1: boom"));
        assert!(msg.contains("xray2: bang"));
    }
}
