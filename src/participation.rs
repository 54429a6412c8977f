//! Deciding which ranks run a test
//!
//! A test asking for `k` ranks runs on the `k` ranks with the lowest world rank. Every other
//! rank is a spectator: it still takes part in the split and in every world barrier of the
//! test, but reports `skipped` instead of running the body.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::topology::{check_group_size, Communicator, GroupHandle, Rank};

/// Reason reported by spectator ranks
pub const SPECTATOR_REASON: &str = "MPI-rank not required";

/// Whether this rank runs the test
pub enum Decision<'g, C> {
    /// Run the body with this group as communication context
    Active(&'g GroupHandle<C>),
    /// Keep in lockstep, do not run the body
    Inactive,
}

impl<'g, C> Decision<'g, C> {
    /// The active group, if any
    pub fn group(&self) -> Option<&'g GroupHandle<C>> {
        match *self {
            Decision::Active(group) => Some(group),
            Decision::Inactive => None,
        }
    }
}

/// Participation of this rank in one test invocation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationRecord {
    /// Group size declared by the test, `None` for the whole world
    pub requested_size: Option<i64>,
    /// Resolved group size
    pub size: Rank,
    /// Whether this rank runs the test body
    pub is_active: bool,
}

/// Per-process participation rules
#[derive(Copy, Clone, Debug)]
pub struct ParticipationGate {
    global_rank: Rank,
    world_size: Rank,
}

impl ParticipationGate {
    /// The gate of world rank `global_rank` in a world of `world_size` ranks
    pub fn new(global_rank: Rank, world_size: Rank) -> ParticipationGate {
        ParticipationGate {
            global_rank,
            world_size,
        }
    }

    /// The group size for a declared size, defaulting to the whole world.
    pub fn resolve(&self, requested: Option<i64>) -> Result<Rank> {
        match requested {
            None => Ok(self.world_size),
            Some(requested) => check_group_size(requested, self.world_size),
        }
    }

    /// Whether this rank falls inside a group of `size` ranks
    pub fn is_active(&self, size: Rank) -> bool {
        self.global_rank < size
    }

    /// Decide participation once the group for `size` ranks has been split off.
    pub fn enter<'g, C: Communicator>(
        &self,
        requested: Option<i64>,
        size: Rank,
        group: &'g GroupHandle<C>,
    ) -> (Decision<'g, C>, ParticipationRecord) {
        let is_active = self.is_active(size);
        debug!(global_rank = self.global_rank, size, is_active, "entered gate");
        let record = ParticipationRecord {
            requested_size: requested,
            size,
            is_active,
        };
        let decision = if is_active {
            Decision::Active(group)
        } else {
            Decision::Inactive
        };
        (decision, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::local::LocalUniverse;
    use crate::topology::GroupFactory;
    use test_case::test_case;

    #[test_case(None => Some(4) ; "absent uses the world")]
    #[test_case(Some(1) => Some(1) ; "single rank")]
    #[test_case(Some(4) => Some(4) ; "whole world")]
    #[test_case(Some(5) => None ; "larger than the world")]
    #[test_case(Some(0) => None ; "zero")]
    #[test_case(Some(-1) => None ; "negative")]
    fn resolve(requested: Option<i64>) -> Option<Rank> {
        ParticipationGate::new(0, 4).resolve(requested).ok()
    }

    #[test]
    fn resolve_reports_invalid_size() {
        let err = ParticipationGate::new(2, 3).resolve(Some(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidGroupSize {
                requested: 5,
                available: 3
            }
        ));
    }

    #[test]
    fn lowest_ranks_are_active() {
        let active: Vec<Rank> = (0..4)
            .filter(|&rank| ParticipationGate::new(rank, 4).is_active(2))
            .collect();
        assert_eq!(active, vec![0, 1]);
    }

    #[test]
    fn only_active_ranks_see_the_group() {
        let views = LocalUniverse::new(3)
            .run(|world| {
                let gate = ParticipationGate::new(world.rank(), world.size());
                let group = GroupFactory::new(&world).split(2).unwrap();
                let (decision, record) = gate.enter(Some(2), 2, &group);
                let view = (decision.group().map(GroupHandle::size), record.is_active);
                group.free().unwrap();
                view
            })
            .unwrap();
        assert_eq!(views, vec![(Some(2), true), (Some(2), true), (None, false)]);
    }
}
