//! Load tasks and their subtask chains.
//!
//! The scheduler collaborator is `tokio`'s multi-threaded runtime:
//! `spawn_blocking` runs the work, and polling a task's completion without
//! blocking the owning thread is `JoinHandle::is_finished` plus
//! `futures::FutureExt::now_or_never` once finished (`update_progress` runs
//! synchronously on the thread that owns the `World`; it cannot `.await`).
//!
//! A running import closure has no way to reach back into the
//! `AssetLoadTask` that's tracking it, since that value lives as a
//! component in the `World` on the thread running `update_progress`, not on
//! the worker thread. So spawning a child is a message, not a method call:
//! `SubtaskSpawner::spawn` reserves the child's id and pushes its join
//! handle down a `crossbeam_channel`.
//!
//! A composite importer (the scene importer) additionally needs to block on
//! its own children from within its own running closure. `SubtaskSpawner::
//! spawn` hands back a [`SubtaskHandle`] for exactly that: a `Mutex`/
//! `Condvar` pair the worker thread signals once its closure returns,
//! independent of the `JoinHandle` that `update_progress` resolves later
//! from the chain.

use std::sync::{Arc, Condvar, Mutex};

use futures::FutureExt;

use crate::handle::AssetHandle;
use crate::id::{IdAllocator, PendingId, StableId};
use crate::variant::AssetVariant;

struct ResultCell {
    value: Mutex<Option<AssetVariant>>,
    ready: Condvar,
}

impl ResultCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn set(&self, variant: AssetVariant) {
        let mut guard = self.value.lock().unwrap();
        *guard = Some(variant);
        self.ready.notify_all();
    }

    fn wait(&self) -> AssetVariant {
        let guard = self.value.lock().unwrap();
        let mut guard = self
            .ready
            .wait_while(guard, |v| v.is_none())
            .unwrap();
        guard.take().expect("condvar woke with no value")
    }
}

struct RawSubtask {
    pending: PendingId,
    asset_handle: AssetHandle,
    join: tokio::task::JoinHandle<AssetVariant>,
}

/// Handle an importer closure uses to spawn subtasks of its own load.
/// Cheaply `Clone`, so a subtask's closure can spawn further subtasks with
/// the same spawner it was given.
#[derive(Clone)]
pub struct SubtaskSpawner {
    runtime: tokio::runtime::Handle,
    id_allocator: Arc<IdAllocator>,
    sender: crossbeam_channel::Sender<RawSubtask>,
}

/// What a running closure gets back from [`SubtaskSpawner::spawn`]: enough to
/// reference the child asset before it resolves, and to block on its
/// completion from inside the same worker pool.
pub struct SubtaskHandle {
    pub id: StableId,
    pub asset_handle: AssetHandle,
    result: Arc<ResultCell>,
}

impl SubtaskHandle {
    /// Blocks the calling thread (a blocking-pool worker, never the async
    /// runtime itself) until the subtask's closure has returned. Never
    /// awaits the caller's own task, only ever a child's.
    pub fn await_blocking(&self) -> AssetVariant {
        self.result.wait()
    }
}

impl SubtaskSpawner {
    /// Reserve a pending id for the child, schedule `work` on the blocking
    /// pool, and register it onto the owning task's chain. Returns
    /// immediately. The caller doesn't have to wait on it unless it calls
    /// [`SubtaskHandle::await_blocking`].
    pub fn spawn(
        &self,
        work: impl FnOnce(SubtaskSpawner) -> AssetVariant + Send + 'static,
    ) -> SubtaskHandle {
        let pending = PendingId::reserve(self.id_allocator.clone());
        let id = pending.id();
        let asset_handle = AssetHandle::new(id);
        let result = ResultCell::new();

        let spawner = self.clone();
        let handle_for_worker = asset_handle.clone();
        let result_for_worker = result.clone();
        let join = self.runtime.spawn_blocking(move || {
            let _ = &handle_for_worker;
            let variant = work(spawner);
            result_for_worker.set(variant.clone());
            variant
        });
        let _ = self.sender.send(RawSubtask {
            pending,
            asset_handle: asset_handle.clone(),
            join,
        });

        SubtaskHandle {
            id,
            asset_handle,
            result,
        }
    }
}

/// One member of a finished chain, as handed to `update_progress`. The root
/// carries no [`AssetHandle`]/pending id of its own, since its row already
/// exists; subtasks do.
pub enum ChainMember {
    Root {
        id: StableId,
        variant: AssetVariant,
    },
    Pending {
        id: StableId,
        variant: AssetVariant,
        handle: AssetHandle,
        pending: PendingId,
    },
}

impl ChainMember {
    pub fn id(&self) -> StableId {
        match self {
            ChainMember::Root { id, .. } => *id,
            ChainMember::Pending { id, .. } => *id,
        }
    }

    pub fn variant(&self) -> &AssetVariant {
        match self {
            ChainMember::Root { variant, .. } => variant,
            ChainMember::Pending { variant, .. } => variant,
        }
    }
}

/// One scheduled unit of importer work, plus whatever subtasks it or its
/// descendants spawned while running.
pub struct AssetLoadTask {
    target_id: StableId,
    join: tokio::task::JoinHandle<AssetVariant>,
    receiver: crossbeam_channel::Receiver<RawSubtask>,
    chain: Vec<RawSubtask>,
}

impl AssetLoadTask {
    /// Spawn the root task of a load, for a handle that already points at a
    /// real `Loading` row.
    pub fn spawn_root(
        runtime: &tokio::runtime::Handle,
        id_allocator: Arc<IdAllocator>,
        target_id: StableId,
        work: impl FnOnce(SubtaskSpawner) -> AssetVariant + Send + 'static,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let spawner = SubtaskSpawner {
            runtime: runtime.clone(),
            id_allocator,
            sender,
        };
        let join = runtime.spawn_blocking(move || work(spawner));
        Self {
            target_id,
            join,
            receiver,
            chain: Vec::new(),
        }
    }

    pub fn target(&self) -> StableId {
        self.target_id
    }

    fn drain_new_subtasks(&mut self) {
        while let Ok(raw) = self.receiver.try_recv() {
            self.chain.push(raw);
        }
    }

    /// True iff this task's own scheduled work is done *and* every subtask
    /// registered onto its chain so far is done. Picks up newly-registered
    /// subtasks each call, since a running task may still be adding to its
    /// own chain.
    pub fn is_done(&mut self) -> bool {
        self.drain_new_subtasks();
        self.join.is_finished() && self.chain.iter().all(|sub| sub.join.is_finished())
    }

    /// Consume the task and its whole chain once `is_done()`, returning each
    /// node's target id paired with the variant it produced: this task's
    /// own result first, then subtasks in registration order. Panics if
    /// called before `is_done()`.
    pub fn into_results(mut self) -> Vec<ChainMember> {
        self.drain_new_subtasks();
        assert!(
            self.join.is_finished(),
            "into_results called before the task finished"
        );

        let mut out = Vec::with_capacity(self.chain.len() + 1);
        out.push(ChainMember::Root {
            id: self.target_id,
            variant: resolve(self.join),
        });
        for sub in self.chain {
            assert!(
                sub.join.is_finished(),
                "into_results called before a subtask finished"
            );
            let id = sub.pending.id();
            let variant = resolve(sub.join);
            out.push(ChainMember::Pending {
                id,
                variant,
                handle: sub.asset_handle,
                pending: sub.pending,
            });
        }
        out
    }
}

fn resolve(handle: tokio::task::JoinHandle<AssetVariant>) -> AssetVariant {
    handle
        .now_or_never()
        .expect("task reported finished but has no result")
        .unwrap_or_else(|join_err| {
            AssetVariant::LoadFailure(format!("importer task panicked: {join_err}"))
        })
}
