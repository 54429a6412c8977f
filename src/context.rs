//! What a running test body gets to see
use thiserror::Error;

use crate::error::{Error, Result};
use crate::topology::{Communicator, GroupHandle, Rank};

/// Marker error a test body returns to skip itself on this rank
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct Skip {
    reason: String,
}

impl Skip {
    /// Skip with `reason`
    pub fn new(reason: impl Into<String>) -> Skip {
        Skip {
            reason: reason.into(),
        }
    }

    /// Why the test was skipped
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Context handed to a test body for one invocation
pub struct TestContext<'g, C: Communicator> {
    group: Option<&'g GroupHandle<C>>,
    taken: bool,
    global_rank: Rank,
    world_size: Rank,
}

impl<'g, C: Communicator> TestContext<'g, C> {
    pub(crate) fn new(
        group: Option<&'g GroupHandle<C>>,
        global_rank: Rank,
        world_size: Rank,
    ) -> TestContext<'g, C> {
        TestContext {
            group,
            taken: false,
            global_rank,
            world_size,
        }
    }

    /// The communication group of this invocation.
    ///
    /// Can be retrieved once per invocation. Fails with `Error::NoActiveGroup` for tests run
    /// outside of MPI mode and with `Error::GroupAlreadyTaken` on a second call.
    pub fn communicator(&mut self) -> Result<&'g GroupHandle<C>> {
        let group = self.group.ok_or(Error::NoActiveGroup)?;
        if self.taken {
            return Err(Error::GroupAlreadyTaken);
        }
        self.taken = true;
        Ok(group)
    }

    /// Rank of this process in the world group
    pub fn global_rank(&self) -> Rank {
        self.global_rank
    }

    /// Number of ranks in the world group
    pub fn world_size(&self) -> Rank {
        self.world_size
    }

    /// An error that skips the test on this rank when returned from the body.
    pub fn skip(&self, reason: impl Into<String>) -> anyhow::Error {
        Skip::new(reason).into()
    }
}
