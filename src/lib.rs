//! Lockstep test execution across the ranks of an MPI job
//!
//! An MPI test suite runs as one process per rank. Each test declares how many ranks it needs;
//! the harness derives a group of exactly that size from the world group, runs the test body on
//! the ranks inside it, keeps the remaining ranks synchronized as spectators and reduces the
//! per-rank outcomes to one verdict on rank 0.
//!
//! # Usage
//!
//! ```no_run
//! use mpi_harness::environment::{HarnessConfig, RunMode};
//! use mpi_harness::local::LocalUniverse;
//! use mpi_harness::suite::{Harness, TestCase};
//!
//! let reports = LocalUniverse::new(4)
//!     .run(|world| {
//!         let harness = Harness::new(world, HarnessConfig::new(RunMode::Mpi));
//!         let tests = vec![TestCase::new("test_pair", |ctx| {
//!             let group = ctx.communicator()?;
//!             anyhow::ensure!(group.size() == 2);
//!             Ok(())
//!         })
//!         .mpi_np(2)];
//!         harness.run(&tests).unwrap()
//!     })
//!     .unwrap();
//! assert_eq!(reports[0].passed(), 1);
//! ```
//!
//! # Protocol
//!
//! Every collective (barrier, split, gather, free) blocks until all members of its group have
//! issued the matching call. The coordinator therefore issues the same sequence of world
//! collectives on every rank for every test, and confines gathers to the active group. See
//! `lifecycle` for the exact sequence.
//!
//! # Transports
//!
//! - `local`: ranks as threads of one process, used by the crate's own tests.
//! - `native` (feature `mpi`): an MPI library through the `mpi` crate.

pub mod collective;
pub mod context;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod local;
#[cfg(feature = "mpi")]
pub mod native;
pub mod outcome;
pub mod participation;
pub mod registry;
pub mod suite;
pub mod topology;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::topology::traits::*;
}

pub use error::{Error, Result};
pub use topology::{is_leader, Rank};
