//! Organizing ranks as groups
//!
//! All ranks initially partaking in a run form the 'world' group. For each test the harness
//! derives a sub-group of exactly the requested size from the world by a collective split:
//! ranks whose world rank is below the requested size land in the active group, every other
//! rank lands in the complementary group, which only serves to keep it in lockstep.
//!
//! Group handles are freed with an explicit, collective `Communicator::free`. The call
//! consumes the handle, so a handle cannot be freed twice.
use std::fmt;

use conv::ValueFrom;
use tracing::debug;

use crate::collective::{Barrier, GatherInto};
use crate::error::{Error, Result};

/// Topology traits
pub mod traits {
    pub use super::Communicator;
}

/// Identifies a certain rank within a group.
pub type Rank = i32;

/// A key used when determining the rank order of processes after a group split.
pub type Key = i32;

/// A color used in a group split
///
/// All ranks passing the same color end up in the same group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Color(i32);

impl Color {
    /// A color of a certain value
    ///
    /// Valid values are non-negative.
    pub fn with_value(value: i32) -> Color {
        if value < 0 {
            panic!("Value of color must be non-negative.")
        }
        Color(value)
    }

    /// The color of the active (`true`) or complementary (`false`) partition
    pub fn participation(active: bool) -> Color {
        Color(i32::from(active))
    }

    /// The raw value understood by the transport
    pub fn value(&self) -> i32 {
        self.0
    }
}

/// Communication groups provided by a transport
///
/// Every method documented as collective must be called by all members of the group.
pub trait Communicator: Barrier + GatherInto + Sized {
    /// Number of ranks in this group
    fn size(&self) -> Rank;

    /// The `Rank` that identifies the calling process within this group
    fn rank(&self) -> Rank;

    /// Split the group by color.
    ///
    /// Creates as many new groups as distinct values of `color` are given. Within each new group
    /// ranks are ordered by `key`, ties broken by the rank in `&self`.
    ///
    /// This is a collective operation on `&self`.
    fn split_by_color_with_key(&self, color: Color, key: Key) -> Result<Self>;

    /// Release the group.
    ///
    /// This is a collective operation on `self`; every member frees its handle exactly once.
    /// Predefined groups fail with `Error::PredefinedGroup`.
    fn free(self) -> Result<()>;
}

/// Responsibilities of a rank within a group
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Rank 0: gathers outcomes, computes and reports the verdict
    Leader,
    /// Every other rank: contributes its outcome
    Contributor,
}

impl Role {
    /// The role of `rank` within its group
    pub fn of(rank: Rank) -> Role {
        if rank == 0 {
            Role::Leader
        } else {
            Role::Contributor
        }
    }
}

/// Whether `global_rank` holds the authoritative verdicts of a run.
///
/// Reporting layers use this to decide which rank renders output.
pub fn is_leader(global_rank: Rank) -> bool {
    Role::of(global_rank) == Role::Leader
}

/// Checks that a group of `requested` ranks can be derived from `available` ranks.
pub fn check_group_size(requested: i64, available: Rank) -> Result<Rank> {
    match Rank::value_from(requested) {
        Ok(size) if size >= 1 && size <= available => Ok(size),
        _ => Err(Error::InvalidGroupSize {
            requested,
            available,
        }),
    }
}

/// A communication group together with this rank's view of it
pub struct GroupHandle<C> {
    comm: C,
    size: Rank,
    rank: Rank,
    role: Role,
}

impl<C: Communicator> GroupHandle<C> {
    /// Wraps a communicator, caching its size, rank and role.
    pub fn new(comm: C) -> GroupHandle<C> {
        let size = comm.size();
        let rank = comm.rank();
        debug_assert!(0 <= rank && rank < size);
        GroupHandle {
            comm,
            size,
            rank,
            role: Role::of(rank),
        }
    }

    /// Number of ranks in this group
    pub fn size(&self) -> Rank {
        self.size
    }

    /// The rank of the calling process within this group
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The role of the calling process within this group
    pub fn role(&self) -> Role {
        self.role
    }

    /// The underlying transport communicator
    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Release the group, see `Communicator::free`.
    pub fn free(self) -> Result<()> {
        self.comm.free()
    }
}

impl<C: Communicator> Barrier for GroupHandle<C> {
    fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }
}

impl<C: Communicator> GatherInto for GroupHandle<C> {
    fn gather_bytes(&self, root: Rank, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        self.comm.gather_bytes(root, bytes)
    }
}

impl<C> fmt::Debug for GroupHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHandle")
            .field("size", &self.size)
            .field("rank", &self.rank)
            .field("role", &self.role)
            .finish()
    }
}

/// Derives fixed-size sub-groups from a parent group
pub struct GroupFactory<'p, C> {
    parent: &'p C,
}

impl<'p, C: Communicator> GroupFactory<'p, C> {
    /// A factory splitting `parent`
    pub fn new(parent: &'p C) -> GroupFactory<'p, C> {
        GroupFactory { parent }
    }

    /// Checks that `requested` lies in `1..=parent.size()`.
    ///
    /// The check depends only on the parent size, so every rank reaches the same answer.
    pub fn check_size(&self, requested: i64) -> Result<Rank> {
        check_group_size(requested, self.parent.size())
    }

    /// Split the parent into the first `requested` ranks and the rest.
    ///
    /// Ranks with a parent rank below `requested` receive the active group, in which their rank
    /// equals their parent rank. All other ranks receive the complementary group.
    ///
    /// This is a collective operation on the parent; it must be called by every member even
    /// if it will not participate in the test.
    pub fn split(&self, requested: Rank) -> Result<GroupHandle<C>> {
        let size = self.check_size(i64::from(requested))?;
        let parent_rank = self.parent.rank();
        let active = parent_rank < size;
        let comm = self
            .parent
            .split_by_color_with_key(Color::participation(active), parent_rank)?;
        let handle = GroupHandle::new(comm);
        debug!(
            parent_rank,
            active,
            group_size = handle.size(),
            group_rank = handle.rank(),
            "split parent group"
        );
        Ok(handle)
    }
}
