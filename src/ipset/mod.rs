//! Kernel IP set adapter
//!
//! Wraps the `ipset` command-line tool behind a typed interface: set
//! create-or-reconcile, entry add/delete with comments and timeouts, listing
//! with comments, atomic contents swap, destroy. The tool invocation goes
//! through the [`CommandRunner`] seam so tests never need the real binary.

pub mod adapter;
pub mod name;
pub mod runner;
pub mod tracker;

pub use adapter::{check_tool, Ipset, SetEntry, SetOptions};
pub use name::{set_name, set_name6, SET_NAME_TAG};
pub use runner::{CommandRunner, SystemRunner};
pub use tracker::SetTracker;

use serde::{Deserialize, Serialize};

/// Address family of a kernel set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    /// IPv4 (`family inet`)
    V4,
    /// IPv6 (`family inet6`)
    V6,
}

impl IpFamily {
    /// The `family` argument value for ipset
    #[must_use]
    pub const fn as_ipset_arg(self) -> &'static str {
        match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
        }
    }
}
