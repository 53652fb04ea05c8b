//! Rule model: pattern engine and the persisted rule store
//!
//! A rule is a pattern (domain wildcard, IP literal or CIDR) filed under an
//! egress type and an operator-chosen chain. The store keeps the persisted
//! mapping coherent with the kernel sets that realize it.

pub mod pattern;
pub mod store;

pub use pattern::{kind_of, matches, overlap, validate, PatternKind};
pub use store::{ChainRules, RuleMatch, RuleStore, RulesFile};
