//! Collective communication
//!
//! The harness needs only two collectives from a transport: a barrier to keep ranks in
//! lockstep and a gather of variable-length byte buffers to collect per-rank outcomes at the
//! group leader. Both are blocking and must be issued by every member of the group, in the same
//! relative order, before any member's call returns.
//!
//! No timeouts are offered. A collective that one member never enters blocks forever.

use crate::error::Result;
use crate::topology::Rank;

/// Collective communication traits
pub mod traits {
    pub use super::{Barrier, GatherInto};
}

/// Barrier synchronization
pub trait Barrier {
    /// Partake in a barrier synchronization across all members of `&self`.
    ///
    /// Blocks until every member of the group has entered the barrier.
    ///
    /// # Examples
    ///
    /// See `tests/lockstep.rs`
    fn barrier(&self) -> Result<()>;
}

/// Gathering of variable-length byte buffers at a root
pub trait GatherInto {
    /// Gather `bytes` from every member of `&self` at member `root`.
    ///
    /// Returns `Some` with one buffer per member, ordered by rank, on `root` and `None` on
    /// every other member. Buffers may differ in length between members.
    fn gather_bytes(&self, root: Rank, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>>;
}
