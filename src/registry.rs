//! Ownership of per-test groups
//!
//! Every group a test splits off is leased from a `GroupRegistry` under the test's identity.
//! The lease is a `GroupGuard`; releasing it frees the group. `release` consumes the guard and
//! the guard frees on drop if it was never released, so each group is freed exactly once on
//! every exit path.
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::topology::{Communicator, GroupHandle};

/// Identity of a test within a suite
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// The identity of the test named `name`
    pub fn new(name: impl Into<String>) -> TestId {
        TestId(name.into())
    }

    /// The test name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct Leases {
    held: HashSet<TestId>,
    released: usize,
}

/// Leases of communication groups, keyed by test
#[derive(Default)]
pub struct GroupRegistry {
    leases: RefCell<Leases>,
}

impl GroupRegistry {
    /// An empty registry
    pub fn new() -> GroupRegistry {
        GroupRegistry::default()
    }

    /// Lease `handle` to test `id`.
    ///
    /// Fails with `Error::GroupAlreadyHeld` if the test still holds a group. The handle is
    /// freed before returning the error, so it is not leaked either way.
    pub fn acquire<C: Communicator>(
        &self,
        id: TestId,
        handle: GroupHandle<C>,
    ) -> Result<GroupGuard<'_, C>> {
        {
            let mut leases = self.leases.borrow_mut();
            if leases.held.insert(id.clone()) {
                debug!(test = %id, "acquired group lease");
                return Ok(GroupGuard {
                    registry: self,
                    id,
                    handle: Some(handle),
                });
            }
        }
        handle.free()?;
        Err(Error::GroupAlreadyHeld(id.0))
    }

    fn mark_released(&self, id: &TestId) {
        let mut leases = self.leases.borrow_mut();
        leases.held.remove(id);
        leases.released += 1;
    }

    /// Whether test `id` currently holds a group
    pub fn is_held(&self, id: &TestId) -> bool {
        self.leases.borrow().held.contains(id)
    }

    /// Number of leases currently held
    pub fn outstanding(&self) -> usize {
        self.leases.borrow().held.len()
    }

    /// Number of leases released so far
    pub fn released(&self) -> usize {
        self.leases.borrow().released
    }
}

/// A leased group, freed exactly once
pub struct GroupGuard<'r, C: Communicator> {
    registry: &'r GroupRegistry,
    id: TestId,
    handle: Option<GroupHandle<C>>,
}

impl<'r, C: Communicator> GroupGuard<'r, C> {
    /// The leased group
    pub fn handle(&self) -> &GroupHandle<C> {
        // Only `release` and `drop` take the handle, both consume the guard.
        self.handle
            .as_ref()
            .expect("group guard accessed after release")
    }

    /// Free the group and end the lease.
    ///
    /// This is a collective operation on the leased group.
    pub fn release(mut self) -> Result<()> {
        self.free_now()
    }

    fn free_now(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                self.registry.mark_released(&self.id);
                debug!(test = %self.id, "freeing group");
                handle.free()
            }
            None => Ok(()),
        }
    }
}

impl<'r, C: Communicator> Drop for GroupGuard<'r, C> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(test = %self.id, "group released on an early exit path");
            if let Err(err) = self.free_now() {
                warn!(test = %self.id, %err, "could not free group");
            }
        }
    }
}
