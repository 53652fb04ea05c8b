//! Pattern classification, validation, matching and overlap testing
//!
//! Patterns come in three kinds. A string that parses as a CIDR is a CIDR,
//! else a string that parses as an IP literal is an IP, everything else is a
//! domain pattern. Domain patterns support a `*` wildcard at the beginning,
//! the end, or both.
//!
//! `overlap` deliberately over-approximates for wildcard pairs: two wildcard
//! patterns overlap when either `*`-stripped core contains the other. This is
//! conservative on purpose, to forbid easily confused rules.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::PatternError;

/// Pattern classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Domain name, optionally wildcarded
    Domain,
    /// Literal IP address
    Ip,
    /// CIDR network
    Cidr,
}

/// Classify a pattern string
#[must_use]
pub fn kind_of(pattern: &str) -> PatternKind {
    if pattern.parse::<IpNet>().is_ok() {
        PatternKind::Cidr
    } else if pattern.parse::<IpAddr>().is_ok() {
        PatternKind::Ip
    } else {
        PatternKind::Domain
    }
}

/// Check whether a pattern is a literal IP or CIDR ("static" rule)
#[must_use]
pub fn is_network(pattern: &str) -> bool {
    matches!(kind_of(pattern), PatternKind::Ip | PatternKind::Cidr)
}

/// Validate a pattern string
///
/// Network patterns are always valid. Domain patterns must not contain `/`,
/// `?`, `[` or `]`, may carry at most two `*`, and wildcards are only allowed
/// at the ends.
///
/// # Errors
///
/// Returns the specific `PatternError` describing the violation.
pub fn validate(pattern: &str) -> Result<(), PatternError> {
    if pattern.trim().is_empty() {
        return Err(PatternError::Empty);
    }
    if is_network(pattern) {
        return Ok(());
    }
    if pattern.contains('/') {
        return Err(PatternError::ContainsSlash);
    }
    if pattern.contains(['?', '[', ']']) {
        return Err(PatternError::InvalidCharacters);
    }
    let stars = pattern.matches('*').count();
    if stars > 2 {
        return Err(PatternError::TooManyWildcards);
    }
    if stars == 2 && !(pattern.starts_with('*') && pattern.ends_with('*')) {
        return Err(PatternError::WildcardPlacementPair);
    }
    if stars == 1 && !(pattern.starts_with('*') || pattern.ends_with('*')) {
        return Err(PatternError::WildcardPlacementSingle);
    }
    Ok(())
}

/// Match a domain against a domain pattern
///
/// Exact equality when there is no wildcard; contains for `*x*`; suffix for
/// `*x`; prefix for `x*`. Network patterns never match a domain.
#[must_use]
pub fn matches(pattern: &str, domain: &str) -> bool {
    if !pattern.contains('*') {
        return domain == pattern;
    }
    if pattern.starts_with('*') && pattern.ends_with('*') {
        return domain.contains(pattern.trim_matches('*'));
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return domain.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return domain.starts_with(prefix);
    }
    false
}

/// Test whether two patterns overlap
///
/// Identical patterns overlap trivially; callers distinguish that case as a
/// duplicate before calling this.
#[must_use]
pub fn overlap(a: &str, b: &str) -> bool {
    let kind_a = kind_of(a);
    let kind_b = kind_of(b);

    if kind_a != PatternKind::Domain || kind_b != PatternKind::Domain {
        return network_overlap(a, kind_a, b, kind_b);
    }

    let wild_a = a.contains('*');
    let wild_b = b.contains('*');

    match (wild_a, wild_b) {
        (false, false) => a == b,
        (false, true) => matches(b, a),
        (true, false) => matches(a, b),
        (true, true) => {
            let core_a = a.replace('*', "");
            let core_b = b.replace('*', "");
            core_a.contains(&core_b) || core_b.contains(&core_a)
        }
    }
}

fn network_overlap(a: &str, kind_a: PatternKind, b: &str, kind_b: PatternKind) -> bool {
    match kind_a {
        PatternKind::Ip => {
            let Ok(ip_a) = a.parse::<IpAddr>() else {
                return false;
            };
            match kind_b {
                PatternKind::Ip => b.parse::<IpAddr>().is_ok_and(|ip_b| ip_a == ip_b),
                PatternKind::Cidr => b.parse::<IpNet>().is_ok_and(|net_b| net_b.contains(&ip_a)),
                PatternKind::Domain => false,
            }
        }
        PatternKind::Cidr => {
            let Ok(net_a) = a.parse::<IpNet>() else {
                return false;
            };
            match kind_b {
                PatternKind::Ip => b.parse::<IpAddr>().is_ok_and(|ip_b| net_a.contains(&ip_b)),
                PatternKind::Cidr => b.parse::<IpNet>().is_ok_and(|net_b| {
                    net_a.contains(&net_b.network()) || net_b.contains(&net_a.network())
                }),
                PatternKind::Domain => false,
            }
        }
        PatternKind::Domain => false,
    }
}
