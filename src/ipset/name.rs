//! Deterministic kernel set names
//!
//! A chain binding (egress type, chain name) maps to `vpner-<egress>-<chain>`
//! for IPv4 and the same with a `-6` suffix for the IPv6 companion set. The
//! kernel caps set names at 32 characters.

use crate::egress::EgressType;
use crate::error::IpsetError;

/// Name prefix owned by this system
pub const SET_NAME_TAG: &str = "vpner";

/// Kernel limit on set name length
const MAX_SET_NAME_LEN: usize = 32;

/// Derive the IPv4 set name for a chain binding
///
/// # Errors
///
/// Returns `IpsetError::InvalidName` when the chain name is empty or the
/// derived name exceeds 32 characters.
pub fn set_name(egress: EgressType, chain: &str) -> Result<String, IpsetError> {
    if chain.is_empty() {
        return Err(IpsetError::InvalidName(
            "chain name cannot be empty".into(),
        ));
    }
    let name = format!("{SET_NAME_TAG}-{egress}-{chain}");
    if name.len() > MAX_SET_NAME_LEN {
        return Err(IpsetError::InvalidName(format!(
            "ipset name is too long: {name}"
        )));
    }
    Ok(name)
}

/// Derive the IPv6 companion set name (`-6` suffix)
///
/// # Errors
///
/// Same conditions as [`set_name`], with the suffix counted against the
/// 32-character limit.
pub fn set_name6(egress: EgressType, chain: &str) -> Result<String, IpsetError> {
    if chain.is_empty() {
        return Err(IpsetError::InvalidName(
            "chain name cannot be empty".into(),
        ));
    }
    let name = format!("{SET_NAME_TAG}-{egress}-{chain}-6");
    if name.len() > MAX_SET_NAME_LEN {
        return Err(IpsetError::InvalidName(format!(
            "ipset name is too long: {name}"
        )));
    }
    Ok(name)
}
