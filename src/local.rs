//! In-process transport
//!
//! A `LocalUniverse` runs every rank as an OS thread of the current process. Collectives are
//! rendezvous on a shared exchange buffer: each member deposits its contribution, the last
//! member to arrive publishes the round and wakes the others.
//!
//! The universe keeps a `FreeLedger` of every group created by a split, recording how many
//! members freed it. A rank that panics aborts the universe: every collective blocked in it
//! returns `Error::Transport` instead of waiting forever.
//!
//! # Examples
//!
//! ```
//! use mpi_harness::local::LocalUniverse;
//! use mpi_harness::traits::*;
//!
//! let sizes = LocalUniverse::new(3)
//!     .run(|world| {
//!         world.barrier().unwrap();
//!         world.size()
//!     })
//!     .unwrap();
//! assert_eq!(sizes, vec![3, 3, 3]);
//! ```
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use conv::ConvUtil;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::collective::{Barrier, GatherInto};
use crate::error::{Error, Result};
use crate::topology::{Color, Communicator, Key, Rank};

/// Identifies a group within a `LocalUniverse`
pub type GroupId = u64;

const WORLD_ID: GroupId = 0;

/// Free accounting of one split-created group
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Number of ranks in the group
    pub members: usize,
    /// Number of members that freed their handle
    pub frees: usize,
}

/// Record of group creation and release within a universe
#[derive(Debug, Default)]
pub struct FreeLedger {
    entries: Mutex<BTreeMap<GroupId, LedgerEntry>>,
}

impl FreeLedger {
    fn record_created(&self, id: GroupId, members: usize) {
        self.entries.lock().insert(id, LedgerEntry { members, frees: 0 });
    }

    fn record_free(&self, id: GroupId) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.frees += 1;
        }
    }

    /// All groups created so far, by id
    pub fn entries(&self) -> Vec<(GroupId, LedgerEntry)> {
        self.entries.lock().iter().map(|(id, entry)| (*id, *entry)).collect()
    }

    /// Number of groups created by splits
    pub fn created(&self) -> usize {
        self.entries.lock().len()
    }

    /// Groups not yet freed by all of their members
    pub fn outstanding(&self) -> Vec<GroupId> {
        self.entries.lock()
            .iter()
            .filter(|(_, entry)| entry.frees != entry.members)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether every group was freed exactly once by each of its members
    pub fn is_balanced(&self) -> bool {
        self.entries.lock()
            .values()
            .all(|entry| entry.frees == entry.members)
    }
}

/// State shared by all ranks of a universe
#[derive(Default)]
struct Fabric {
    next_id: AtomicU64,
    aborted: AtomicBool,
    groups: Mutex<Vec<Weak<Shared>>>,
    ledger: FreeLedger,
}

impl Fabric {
    fn create_group(&self, size: usize) -> Arc<Shared> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::new(Shared::new(id, size));
        self.ledger.record_created(id, size);
        self.track(&shared);
        shared
    }

    fn track(&self, shared: &Arc<Shared>) {
        let mut groups = self.groups.lock();
        groups.retain(|group| group.strong_count() > 0);
        groups.push(Arc::downgrade(shared));
    }

    fn abort(&self, rank: usize) {
        error!(rank, "rank panicked, aborting universe");
        self.aborted.store(true, Ordering::SeqCst);
        let groups = self.groups.lock();
        for group in groups.iter().filter_map(Weak::upgrade) {
            let _round = group.round.lock();
            group.wakeup.notify_all();
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// One exchange round of a group
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
}

/// State shared by the members of one group
struct Shared {
    id: GroupId,
    size: usize,
    round: Mutex<Round>,
    wakeup: Condvar,
    children: Mutex<HashMap<(u64, Color), (Arc<Shared>, usize)>>,
}

impl Shared {
    fn new(id: GroupId, size: usize) -> Shared {
        Shared {
            id,
            size,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
            }),
            wakeup: Condvar::new(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

/// A universe of ranks running as threads of this process
pub struct LocalUniverse {
    size: usize,
    fabric: Arc<Fabric>,
}

impl LocalUniverse {
    /// A universe of `size` ranks
    pub fn new(size: usize) -> LocalUniverse {
        assert!(size > 0, "A universe needs at least one rank.");
        assert!(
            size.value_as::<Rank>().is_ok(),
            "Universe size exceeds the range of a Rank."
        );
        LocalUniverse {
            size,
            fabric: Arc::new(Fabric::default()),
        }
    }

    /// Number of ranks in the universe
    pub fn size(&self) -> usize {
        self.size
    }

    /// The free accounting of all groups split off so far
    pub fn ledger(&self) -> &FreeLedger {
        &self.fabric.ledger
    }

    /// Run `f` once per rank, each on its own thread, handing it the world group.
    ///
    /// Returns the per-rank results ordered by rank. If any rank panics, the universe is
    /// aborted and `Error::RankPanicked` names the lowest panicking rank.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(LocalCommunicator) -> T + Sync,
        T: Send,
    {
        let world = Arc::new(Shared::new(WORLD_ID, self.size));
        self.fabric.track(&world);

        let results: Vec<std::result::Result<T, usize>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.size)
                .map(|index| {
                    let comm = LocalCommunicator::new(world.clone(), index, self.fabric.clone());
                    let f = &f;
                    let fabric = &self.fabric;
                    thread::Builder::new()
                        .name(format!("rank-{index}"))
                        .spawn_scoped(scope, move || {
                            panic::catch_unwind(AssertUnwindSafe(|| f(comm))).map_err(|_| {
                                fabric.abort(index);
                                index
                            })
                        })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or(Err(index)),
                    Err(_) => Err(index),
                })
                .collect()
        });

        results
            .into_iter()
            .map(|result| result.map_err(Error::RankPanicked))
            .collect()
    }
}

/// A group handle of the in-process transport
pub struct LocalCommunicator {
    shared: Arc<Shared>,
    index: usize,
    rank: Rank,
    size: Rank,
    splits: Cell<u64>,
    fabric: Arc<Fabric>,
}

impl LocalCommunicator {
    fn new(shared: Arc<Shared>, index: usize, fabric: Arc<Fabric>) -> LocalCommunicator {
        // Bounded by the universe size, checked in `LocalUniverse::new`.
        let rank = index.value_as::<Rank>().unwrap_or(Rank::MAX);
        let size = shared.size.value_as::<Rank>().unwrap_or(Rank::MAX);
        LocalCommunicator {
            shared,
            index,
            rank,
            size,
            splits: Cell::new(0),
            fabric,
        }
    }

    /// Identifier of this group within its universe, `0` for the world
    pub fn id(&self) -> GroupId {
        self.shared.id
    }

    /// Deposit `bytes` and wait until every member did the same.
    fn exchange(&self, bytes: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>> {
        let shared = &*self.shared;
        let mut round = shared.round.lock();
        let generation = round.generation;
        round.slots[self.index] = Some(bytes);
        round.arrived += 1;

        if round.arrived == shared.size {
            let contributions = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            round.published = Arc::new(contributions);
            round.arrived = 0;
            round.generation += 1;
            shared.wakeup.notify_all();
            return Ok(round.published.clone());
        }

        while round.generation == generation {
            if self.fabric.is_aborted() {
                return Err(Error::Transport(format!(
                    "universe aborted while rank {} waited on group {}",
                    self.rank, shared.id
                )));
            }
            shared.wakeup.wait(&mut round);
        }
        Ok(round.published.clone())
    }

    /// Fetch the child group created by split number `seq` for `color`.
    ///
    /// The first member to arrive creates it; the last one to take it removes the entry.
    fn child(&self, seq: u64, color: Color, members: usize) -> Arc<Shared> {
        let mut children = self.shared.children.lock();
        let entry = children
            .entry((seq, color))
            .or_insert_with(|| (self.fabric.create_group(members), members));
        let shared = entry.0.clone();
        entry.1 -= 1;
        if entry.1 == 0 {
            children.remove(&(seq, color));
        }
        shared
    }
}

fn decode_split_entry(bytes: &[u8]) -> Result<(i32, Key)> {
    let field = |range: std::ops::Range<usize>| -> Result<i32> {
        bytes
            .get(range)
            .and_then(|raw| raw.try_into().ok())
            .map(i32::from_le_bytes)
            .ok_or_else(|| Error::Transport("malformed split contribution".into()))
    };
    Ok((field(0..4)?, field(4..8)?))
}

impl Barrier for LocalCommunicator {
    fn barrier(&self) -> Result<()> {
        self.exchange(Vec::new()).map(|_| ())
    }
}

impl GatherInto for LocalCommunicator {
    fn gather_bytes(&self, root: Rank, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if root < 0 || root >= self.size {
            return Err(Error::Transport(format!("invalid root rank {root}")));
        }
        let all = self.exchange(bytes.to_vec())?;
        if root == self.rank {
            Ok(Some(all.as_ref().clone()))
        } else {
            Ok(None)
        }
    }
}

impl Communicator for LocalCommunicator {
    fn size(&self) -> Rank {
        self.size
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn split_by_color_with_key(&self, color: Color, key: Key) -> Result<Self> {
        let seq = self.splits.get();
        self.splits.set(seq + 1);

        let mut contribution = color.value().to_le_bytes().to_vec();
        contribution.extend_from_slice(&key.to_le_bytes());
        let all = self.exchange(contribution)?;

        let mut members = Vec::with_capacity(all.len());
        for (index, bytes) in all.iter().enumerate() {
            let (member_color, member_key) = decode_split_entry(bytes)?;
            if member_color == color.value() {
                members.push((member_key, index));
            }
        }
        members.sort_unstable();
        let index = members
            .iter()
            .position(|&(_, member)| member == self.index)
            .ok_or_else(|| Error::Transport("rank missing from its own split".into()))?;

        let shared = self.child(seq, color, members.len());
        debug!(
            parent = self.shared.id,
            group = shared.id,
            rank = index,
            size = members.len(),
            "local split"
        );
        Ok(LocalCommunicator::new(shared, index, self.fabric.clone()))
    }

    fn free(self) -> Result<()> {
        if self.shared.id == WORLD_ID {
            return Err(Error::PredefinedGroup);
        }
        self.barrier()?;
        self.fabric.ledger.record_free(self.shared.id);
        Ok(())
    }
}

impl std::fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("id", &self.shared.id)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}
