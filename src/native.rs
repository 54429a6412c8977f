//! MPI transport
//!
//! Implements the harness traits on top of an MPI library through the `mpi` crate. Run the
//! test binary under the MPI launcher, e.g. `mpiexec -n 4 target/debug/deps/suite-...`.
//!
//! Freeing a split group is `MPI_Comm_free`, issued when the wrapped `SimpleCommunicator` is
//! dropped inside `free`.
use conv::ConvUtil;
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Root as _};
use mpi::Count;
use tracing::debug;

use crate::collective::{Barrier, GatherInto};
use crate::error::{Error, Result};
use crate::topology::{Color, Communicator, Key, Rank};

/// An initialized MPI environment
///
/// MPI is finalized when this is dropped; every group must be freed before.
pub struct NativeUniverse {
    universe: Universe,
}

/// Initialize MPI.
///
/// Fails if MPI has already been initialized in this process.
pub fn initialize() -> Result<NativeUniverse> {
    let universe = mpi::initialize()
        .ok_or_else(|| Error::Transport("MPI has already been initialized".into()))?;
    Ok(NativeUniverse { universe })
}

impl NativeUniverse {
    /// The world group
    pub fn world(&self) -> NativeCommunicator {
        NativeCommunicator {
            comm: self.universe.world(),
            predefined: true,
        }
    }
}

/// An MPI communicator
pub struct NativeCommunicator {
    comm: SimpleCommunicator,
    predefined: bool,
}

fn count_of(len: usize) -> Result<Count> {
    len.value_as::<Count>()
        .map_err(|_| Error::Transport(format!("buffer of {len} bytes exceeds the range of a Count")))
}

fn index_of(count: Count) -> Result<usize> {
    count
        .value_as::<usize>()
        .map_err(|_| Error::Transport(format!("negative count {count}")))
}

impl Barrier for NativeCommunicator {
    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }
}

impl GatherInto for NativeCommunicator {
    fn gather_bytes(&self, root: Rank, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if root < 0 || root >= self.comm.size() {
            return Err(Error::Transport(format!("invalid root rank {root}")));
        }
        let root_process = self.comm.process_at_rank(root);
        let len = count_of(bytes.len())?;

        if self.comm.rank() != root {
            root_process.gather_into(&len);
            root_process.gather_varcount_into(bytes);
            return Ok(None);
        }

        let mut counts = vec![0 as Count; index_of(self.comm.size())?];
        root_process.gather_into_root(&len, &mut counts[..]);

        let mut displs = Vec::with_capacity(counts.len());
        let mut total: Count = 0;
        for &count in &counts {
            displs.push(total);
            total = total
                .checked_add(count)
                .ok_or_else(|| Error::Transport("gathered outcomes exceed a Count".into()))?;
        }

        let mut buffer = vec![0u8; index_of(total)?];
        {
            let mut partition = PartitionMut::new(&mut buffer[..], &counts[..], &displs[..]);
            root_process.gather_varcount_into_root(bytes, &mut partition);
        }

        let mut gathered = Vec::with_capacity(counts.len());
        for (&count, &displ) in counts.iter().zip(&displs) {
            let start = index_of(displ)?;
            gathered.push(buffer[start..start + index_of(count)?].to_vec());
        }
        Ok(Some(gathered))
    }
}

impl Communicator for NativeCommunicator {
    fn size(&self) -> Rank {
        self.comm.size()
    }

    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    fn split_by_color_with_key(&self, color: Color, key: Key) -> Result<Self> {
        let comm = self
            .comm
            .split_by_color_with_key(mpi::topology::Color::with_value(color.value()), key)
            .ok_or_else(|| Error::Transport("split returned the null communicator".into()))?;
        debug!(color = color.value(), key, size = comm.size(), "MPI split");
        Ok(NativeCommunicator {
            comm,
            predefined: false,
        })
    }

    fn free(self) -> Result<()> {
        if self.predefined {
            return Err(Error::PredefinedGroup);
        }
        drop(self.comm);
        Ok(())
    }
}
