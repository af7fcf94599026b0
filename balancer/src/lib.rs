//! L4 load balancer: virtual-service lookup, source filtering, weighted
//! real selection, 5-tuple session tracking in a resizable TTL map, and
//! tunnel encapsulation toward the selected real.

pub mod config;
pub mod dataplane;
pub mod meta;
pub mod ring;
pub mod select;
pub mod session;
pub mod session_table;
pub mod stats;
pub mod tunnel;

pub use config::{BalancerConfig, Real, RealFlags, RealSpec, VirtualService, VsFlags, VsSpec};
pub use dataplane::BalancerHandler;
pub use ring::{RING_VALUE_INVALID, Ring};
pub use session::{SessionId, SessionState, SessionTimeouts};
pub use session_table::SessionTable;

#[cfg(test)]
mod tests_balancer;
#[cfg(test)]
mod tests_sessions;
