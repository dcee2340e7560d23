//! The table engine: one `bevy_ecs::World`, each asset a single `Entity`,
//! and table membership expressed entirely by which tag component is
//! attached (Requested/Loading/Succeeded/Failed).
//!
//! A `crossbeam_channel` carries `TableEvent`s to threads that need to know
//! about row lifecycle without holding a `&World`. Using an archetype ECS
//! for this means bevy's own storage performs the migration: inserting
//! `SucceededTag` onto an entity that already has `LoadingTag` removed *is*
//! the row moving from one table to another, for free.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bevy_ecs::prelude::*;
use bevy_ecs::world::EntityWorldMut;

use crate::assets::{MaterialAsset, MeshAsset, SceneAsset};
use crate::handle::{AssetHandle, AssetLocation, LoadRequest, LoadStep, UsageTracker};
use crate::id::{IdAllocator, PendingId, StableId};
use crate::task::AssetLoadTask;

#[derive(Component, Debug, Default, Copy, Clone)]
pub struct RequestedTag;
#[derive(Component, Debug, Default, Copy, Clone)]
pub struct LoadingTag;
#[derive(Component, Debug, Default, Copy, Clone)]
pub struct FailedTag;
#[derive(Component, Debug, Default, Copy, Clone)]
pub struct SucceededTag;

#[derive(Component, Debug, Copy, Clone)]
pub struct StableIdRow(pub StableId);

#[derive(Component, Debug, Clone)]
pub struct LoadRequestRow(pub LoadRequest);

#[derive(Component)]
pub struct UsageTrackerRow(pub Weak<UsageTracker>);

#[derive(Component)]
pub struct LoadingTaskRow(pub AssetLoadTask);

#[derive(Component, Debug, Clone)]
pub struct FailureRow(pub String);

#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct MaterialRow(pub MaterialAsset);
#[derive(Component, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshRow(pub MeshAsset);
#[derive(Component, Debug, Clone)]
pub struct SceneRow(pub SceneAsset);

/// A table-row lifecycle event, emitted for anything outside the owning
/// thread that needs to know without polling the `World` directly.
#[derive(Debug, Clone, Copy)]
pub enum TableEvent {
    Created(StableId),
    Destroyed(StableId),
}

/// Owns the `World`, the `StableId <-> Entity` mapping, and the allocator
/// shared with worker threads.
pub struct AssetTables {
    world: World,
    id_allocator: Arc<IdAllocator>,
    forward: HashMap<StableId, Entity>,
    events_tx: crossbeam_channel::Sender<TableEvent>,
    events_rx: crossbeam_channel::Receiver<TableEvent>,
}

impl Default for AssetTables {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetTables {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            world: World::new(),
            id_allocator: Arc::new(IdAllocator::new()),
            forward: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn id_allocator(&self) -> Arc<IdAllocator> {
        self.id_allocator.clone()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn lookup(&self, id: StableId) -> Option<Entity> {
        self.forward.get(&id).copied()
    }

    /// Spawn a brand-new row in the `Requested` table for `location`,
    /// returning the handle a caller should hand back to its own caller.
    pub fn request_load(&mut self, location: AssetLocation, contents: Vec<u8>) -> AssetHandle {
        let id = self.id_allocator.alloc();
        let handle = AssetHandle::new(id);
        let entity = self
            .world
            .spawn((
                StableIdRow(id),
                RequestedTag,
                UsageTrackerRow(handle.downgrade()),
                LoadRequestRow(LoadRequest::from_bytes(location, contents)),
            ))
            .id();
        self.bind(id, entity);
        self.id_allocator.claim(id);
        handle
    }

    /// Record a forward mapping and emit the row's `Created` event. Used
    /// both by `request_load` and by passes that promote a previously
    /// pending subtask id into a real row (e.g. a scene's dependent mesh).
    pub fn bind(&mut self, id: StableId, entity: Entity) {
        self.forward.insert(id, entity);
        let _ = self.events_tx.send(TableEvent::Created(id));
    }

    /// Despawn the row for `id`, drop the forward mapping, and emit
    /// `Destroyed`. No-op if `id` has no row.
    pub fn despawn(&mut self, id: StableId) {
        if let Some(entity) = self.forward.remove(&id) {
            self.world.despawn(entity);
            let _ = self.events_tx.send(TableEvent::Destroyed(id));
        }
    }

    pub fn entity_mut(&mut self, id: StableId) -> Option<EntityWorldMut<'_>> {
        let entity = self.lookup(id)?;
        self.world.get_entity_mut(entity).ok()
    }

    /// Drain all table events queued since the last call.
    pub fn drain_events(&self) -> Vec<TableEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Migrate every row currently in Requests into Loading, returning each
    /// row's id and the request it was spawned with so the caller can pick
    /// an importer and submit the root task. Uses `World::query_filtered`
    /// rather than a swap-remove loop since bevy's own archetype move
    /// already performs the migration; ordering across requests is not
    /// guaranteed.
    pub fn begin_loading_all(&mut self) -> Vec<(StableId, LoadRequest)> {
        let mut query = self
            .world
            .query_filtered::<(Entity, &StableIdRow, &LoadRequestRow), With<RequestedTag>>();
        let rows: Vec<(Entity, StableId, LoadRequest)> = query
            .iter(&self.world)
            .map(|(entity, id, request)| (entity, id.0, request.0.clone()))
            .collect();

        let mut out = Vec::with_capacity(rows.len());
        for (entity, id, request) in rows {
            let mut entity = self.world.entity_mut(entity);
            entity.remove::<(RequestedTag, LoadRequestRow)>();
            entity.insert(LoadingTag);
            out.push((id, request));
        }
        out
    }

    /// Attach the just-submitted root task to its (already real) row.
    pub fn attach_loading_task(&mut self, id: StableId, task: AssetLoadTask) {
        if let Some(mut entity) = self.entity_mut(id) {
            entity.insert(LoadingTaskRow(task));
        }
    }

    /// The identifiers of every row in Loading whose task chain is fully
    /// resolved. Borrows each task mutably only long enough to poll it:
    /// `is_done` drains newly registered subtasks as a side effect, so this
    /// must run even for chains that turn out still-pending.
    pub fn done_loading_ids(&mut self) -> Vec<StableId> {
        let mut query = self
            .world
            .query_filtered::<(&StableIdRow, &mut LoadingTaskRow), With<LoadingTag>>();
        query
            .iter_mut(&mut self.world)
            .filter_map(|(id, mut task)| task.0.is_done().then_some(id.0))
            .collect()
    }

    /// Remove and return the finished task for `id`, for the caller to
    /// consume into its chain results.
    pub fn take_loading_task(&mut self, id: StableId) -> Option<AssetLoadTask> {
        let mut entity = self.entity_mut(id)?;
        entity.take::<LoadingTaskRow>().map(|row| row.0)
    }

    /// Migrate a Loading row into Failed, preserving its identifier and
    /// usage tracker.
    pub fn migrate_root_to_failed(&mut self, id: StableId, reason: String) {
        let Some(mut entity) = self.entity_mut(id) else {
            return;
        };
        entity.remove::<LoadingTag>();
        entity.insert((FailedTag, FailureRow(reason)));
    }

    /// Migrate a Loading row into its typed Succeeded<T> table by running
    /// the classified write closure against it. No `Created` event here:
    /// the row itself isn't new, it was already created (and its one
    /// `Created` emitted) back at `request_load`; this only changes its tag
    /// and attaches the typed payload.
    pub fn migrate_root_to_succeeded(
        &mut self,
        id: StableId,
        write: Box<dyn FnOnce(&mut EntityWorldMut) + Send>,
    ) {
        let Some(mut entity) = self.entity_mut(id) else {
            return;
        };
        entity.remove::<LoadingTag>();
        entity.insert(SucceededTag);
        write(&mut entity);
    }

    /// Turn a still-`PendingId` chain member into a real Succeeded<T> row.
    /// Claims `pending` so its destructor no longer releases the id.
    pub fn insert_pending_as_succeeded(
        &mut self,
        pending: PendingId,
        usage: Weak<UsageTracker>,
        write: Box<dyn FnOnce(&mut EntityWorldMut) + Send>,
    ) {
        let id = pending.claim();
        let mut entity = self
            .world
            .spawn((StableIdRow(id), SucceededTag, UsageTrackerRow(usage)));
        write(&mut entity);
        let entity_id = entity.id();
        self.bind(id, entity_id);
    }

    /// Release a pending chain member that was skipped or folded into a
    /// duplicate's canonical row rather than published. Simply dropping
    /// `pending` returns its reservation to the allocator.
    pub fn release_pending(&self, pending: PendingId) {
        drop(pending);
    }

    /// For every row carrying a `UsageTrackerWeakRef`, despawn it if the
    /// tracker has expired, emitting `Destroyed` via `despawn`.
    pub fn garbage_collect(&mut self) {
        let mut query = self.world.query::<(Entity, &UsageTrackerRow)>();
        let expired: Vec<Entity> = query
            .iter(&self.world)
            .filter(|(_, tracker)| tracker.0.strong_count() == 0)
            .map(|(entity, _)| entity)
            .collect();
        for entity in expired {
            if let Some(id) = self
                .world
                .get::<StableIdRow>(entity)
                .map(|row| row.0)
            {
                self.despawn(id);
            }
        }
    }

    /// The state a handle's load has reached right now.
    pub fn load_state(&self, id: StableId) -> LoadStep {
        let Some(entity) = self.lookup(id) else {
            return if self.id_allocator.is_pending(id) {
                LoadStep::Loading
            } else {
                LoadStep::Invalid
            };
        };
        let Ok(entity) = self.world.get_entity(entity) else {
            return LoadStep::Invalid;
        };
        if entity.contains::<SucceededTag>() {
            LoadStep::Succeeded
        } else if entity.contains::<FailedTag>() {
            LoadStep::Failed
        } else if entity.contains::<LoadingTag>() {
            LoadStep::Loading
        } else if entity.contains::<RequestedTag>() {
            LoadStep::Requested
        } else {
            LoadStep::Invalid
        }
    }
}
