//! Lookup structures shared by the dataplane modules: the byte-keyed LPM
//! trie, the TTL hash map used for flow state, and the rule filter
//! compiler that builds VS lookup tables.

pub mod filter;
pub mod lpm;
pub mod ttlmap;

pub use filter::{Filter, FilterRule, compile_filter};
pub use lpm::{LPM_VALUE_INVALID, Lpm};
pub use ttlmap::{TtlKey, TtlMap, TtlSlot, TtlStatus};

#[cfg(test)]
mod tests_lpm;
