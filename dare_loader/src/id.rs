//! Stable identifiers for assets, independent of any table storage.
//!
//! Kept separate from `bevy_ecs::Entity` because pending handles must be
//! reservable from worker threads that never touch the `World`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A process-unique, generation-counted identifier. Survives table migration;
/// may exist before any table row backs it (a pending handle).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StableId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Debug for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableId({}v{})", self.index, self.generation)
    }
}

/// Thread-safe allocator: `alloc` and `release` may be called concurrently from
/// any thread, including from inside a running importer task.
#[derive(Debug)]
pub struct IdAllocator {
    next_index: AtomicU32,
    recycle_send: crossbeam_channel::Sender<StableId>,
    recycle_recv: crossbeam_channel::Receiver<StableId>,
    /// Ids that have been `alloc`ed but not yet bound to a table row nor
    /// released. Lets the load-state query answer `Loading` for a pending
    /// handle that no row has claimed yet.
    pending: Mutex<HashSet<StableId>>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        let (recycle_send, recycle_recv) = crossbeam_channel::unbounded();
        Self {
            next_index: AtomicU32::new(0),
            recycle_send,
            recycle_recv,
            pending: Mutex::new(HashSet::new()),
        }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh or recycled id. Does not touch any table.
    pub fn alloc(&self) -> StableId {
        let id = match self.recycle_recv.try_recv() {
            Ok(mut id) => {
                id.generation += 1;
                id
            }
            Err(_) => {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                StableId {
                    index,
                    generation: 0,
                }
            }
        };
        self.pending.lock().unwrap().insert(id);
        id
    }

    /// Mark an id as bound to a real table row: it's no longer "pending",
    /// though it's also not released (the row owns it now).
    pub fn claim(&self, id: StableId) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// True if `id` was `alloc`ed and not yet `claim`ed or `release`d.
    pub fn is_pending(&self, id: StableId) -> bool {
        self.pending.lock().unwrap().contains(&id)
    }

    /// Release an id back to the pool. Must only be called once per `alloc`.
    pub fn release(&self, id: StableId) {
        self.pending.lock().unwrap().remove(&id);
        // A full channel send can only fail if every receiver was dropped, which
        // only happens alongside this allocator itself; nothing to reclaim then.
        let _ = self.recycle_send.send(id);
    }

    /// Number of ids reserved via `alloc` but not yet `release`d.
    pub fn outstanding(&self) -> u32 {
        self.next_index.load(Ordering::Relaxed) - self.recycle_recv.len() as u32
    }

    /// Number of ids `alloc`ed but neither `claim`ed nor `release`d. Should be
    /// zero once every in-flight load has settled.
    pub fn outstanding_unclaimed(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// A reservation on a [`StableId`] that has not yet been bound to a table
/// row. Dropping an unclaimed reservation releases the id back to the
/// allocator, so a handle dropped mid-load doesn't leak an index forever.
pub struct PendingId {
    allocator: Arc<IdAllocator>,
    id: StableId,
    claimed: bool,
}

impl PendingId {
    pub fn reserve(allocator: Arc<IdAllocator>) -> Self {
        let id = allocator.alloc();
        Self {
            allocator,
            id,
            claimed: false,
        }
    }

    pub fn id(&self) -> StableId {
        self.id
    }

    /// Bind the reservation to a real row. The id survives past this guard's
    /// drop.
    pub fn claim(mut self) -> StableId {
        self.allocator.claim(self.id);
        self.claimed = true;
        self.id
    }
}

impl Drop for PendingId {
    fn drop(&mut self) {
        if !self.claimed {
            self.allocator.release(self.id);
        }
    }
}
