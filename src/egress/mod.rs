//! Egress model and the egress router
//!
//! An egress type names the diversion mechanism for a chain: the proxy kind
//! redirects matching traffic to a local inbound port, the VPN kinds mark
//! packets and policy-route them out of a device.

pub mod router;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use router::EgressRouter;

use crate::error::FirewallError;

/// The fixed set of supported egress types
///
/// The names double as rule-store keys and as the middle component of kernel
/// set names, so they are stable strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgressType {
    /// Local proxy process, diverted by NAT redirect to its inbound port
    Xray,
    /// VPN tunnel kinds, diverted by fwmark + policy routing
    OpenVPN,
    Wireguard,
    IKE,
    SSTP,
    PPPOE,
    L2TP,
    PPTP,
}

/// How an egress type diverts traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressKind {
    /// NAT REDIRECT to a local port
    Redirect,
    /// Mangle MARK plus a dedicated routing table
    Mark,
}

impl EgressType {
    /// All supported types, in rule-store key order
    pub const ALL: [Self; 8] = [
        Self::Xray,
        Self::OpenVPN,
        Self::Wireguard,
        Self::IKE,
        Self::SSTP,
        Self::PPPOE,
        Self::L2TP,
        Self::PPTP,
    ];

    /// The diversion mechanism for this type
    #[must_use]
    pub const fn kind(self) -> EgressKind {
        match self {
            Self::Xray => EgressKind::Redirect,
            _ => EgressKind::Mark,
        }
    }

    /// Stable string form, used in set names and rule-store keys
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xray => "Xray",
            Self::OpenVPN => "OpenVPN",
            Self::Wireguard => "Wireguard",
            Self::IKE => "IKE",
            Self::SSTP => "SSTP",
            Self::PPPOE => "PPPOE",
            Self::L2TP => "L2TP",
            Self::PPTP => "PPTP",
        }
    }
}

impl fmt::Display for EgressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EgressType {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FirewallError::UnsupportedType(s.to_string()))
    }
}
