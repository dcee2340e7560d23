//! The asset service: the three scheduled passes, plus the loader/reader
//! contracts consumers drive it through.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::assets::{MaterialAsset, MeshAsset, SceneAsset};
use crate::handle::{AssetHandle, AssetLocation, LoadStep};
use crate::id::StableId;
use crate::importer::{default_importers, Importer};
use crate::tables::{AssetTables, MaterialRow, MeshRow, SceneRow};
use crate::task::{AssetLoadTask, ChainMember};
use crate::variant::AssetOperation;

/// Reportable error kinds; invariant violations that aren't user-facing
/// failure modes stay as `panic!`/`debug_assert!` rather than a variant here.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A row's usage tracker expired before its own load even started, which
    /// can only happen if the row's bookkeeping is broken, since the
    /// consumer still holds the handle at request time.
    #[error("usage tracker for {0:?} expired before its own load even started")]
    TrackerExpiredAtRequestTime(StableId),
}

/// Counter-based token gate: returns `true` exactly once every `every`
/// calls. Deterministic and clock-free, unlike the wall-clock cadence
/// Globals is free to use in production, so tests can drive it by
/// invocation count.
pub struct RateLimiter {
    every: u32,
    calls: std::sync::atomic::AtomicU32,
}

impl RateLimiter {
    pub fn new(every: u32) -> Self {
        assert!(every >= 1, "a rate limiter must grant at least one token eventually");
        Self {
            every,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Try to consume a token for this invocation. Returns `false` without
    /// side effects beyond the counter if the pass should skip this tick.
    pub fn try_consume(&self) -> bool {
        use std::sync::atomic::Ordering;
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        call.is_multiple_of(self.every)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Singletons shared across passes: the two rate limiters and the advisory
/// location→handle index.
///
/// The index is populated on every `request_load` call but is never
/// consulted to short-circuit a new request; it stays purely advisory
/// (readable, never authoritative).
///
/// Entries store only a weak tracker, never a strong `AssetHandle`. The
/// index is a collaborator-facing convenience, not an owner, so it must
/// never be the thing keeping an otherwise-unreferenced asset alive.
pub struct Globals {
    pub update_progress_limiter: RateLimiter,
    pub garbage_collect_limiter: RateLimiter,
    location_index: RwLock<HashMap<AssetLocation, (StableId, std::sync::Weak<crate::handle::UsageTracker>)>>,
}

impl Globals {
    pub fn new(update_progress_every: u32, garbage_collect_every: u32) -> Self {
        Self {
            update_progress_limiter: RateLimiter::new(update_progress_every),
            garbage_collect_limiter: RateLimiter::new(garbage_collect_every),
            location_index: RwLock::new(HashMap::new()),
        }
    }

    /// Advisory lookup: a fresh handle for the location's last-seen asset,
    /// if a consumer still holds a strong reference to it.
    pub fn handle_for_location(&self, location: &AssetLocation) -> Option<AssetHandle> {
        let (id, weak) = self.location_index.read().unwrap().get(location)?.clone();
        AssetHandle::from_weak(id, weak)
    }

    fn record_location(&self, location: AssetLocation, handle: &AssetHandle) {
        self.location_index
            .write()
            .unwrap()
            .insert(location, (handle.id(), handle.downgrade()));
    }
}

impl Default for Globals {
    fn default() -> Self {
        // update_progress and garbage_collect run significantly slower than
        // start_requests; 4:1 and 16:1 are representative, not load-bearing,
        // ratios.
        Self::new(4, 16)
    }
}

pub trait AssetLoader {
    fn request_load(&mut self, location: AssetLocation) -> AssetHandle;
    fn request_load_with_bytes(&mut self, location: AssetLocation, bytes: Vec<u8>) -> AssetHandle;
}

pub trait AssetReader {
    fn get_load_state(&self, handle: &AssetHandle) -> LoadStep;
}

/// Owns the tables, the importer list, and the scheduler handle; runs the
/// three passes.
pub struct AssetService {
    tables: AssetTables,
    runtime: tokio::runtime::Handle,
    importers: Vec<Arc<dyn Importer>>,
    globals: Globals,
}

impl AssetService {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self::with_importers(runtime, default_importers(), Globals::default())
    }

    pub fn with_importers(
        runtime: tokio::runtime::Handle,
        importers: Vec<Arc<dyn Importer>>,
        globals: Globals,
    ) -> Self {
        Self {
            tables: AssetTables::new(),
            runtime,
            importers,
            globals,
        }
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn id_allocator(&self) -> Arc<crate::id::IdAllocator> {
        self.tables.id_allocator()
    }

    pub fn drain_events(&self) -> Vec<crate::tables::TableEvent> {
        self.tables.drain_events()
    }

    pub fn material(&self, handle: &AssetHandle) -> Option<&MaterialAsset> {
        let entity = self.tables.lookup(handle.id())?;
        self.tables.world().get::<MaterialRow>(entity).map(|row| &row.0)
    }

    pub fn mesh(&self, handle: &AssetHandle) -> Option<&MeshAsset> {
        let entity = self.tables.lookup(handle.id())?;
        self.tables.world().get::<MeshRow>(entity).map(|row| &row.0)
    }

    pub fn scene(&self, handle: &AssetHandle) -> Option<&SceneAsset> {
        let entity = self.tables.lookup(handle.id())?;
        self.tables.world().get::<SceneRow>(entity).map(|row| &row.0)
    }

    fn select_importer(&self, location: &AssetLocation) -> Option<Arc<dyn Importer>> {
        let extension = location.extension()?;
        self.importers
            .iter()
            .find(|importer| importer.supports(&extension))
            .cloned()
    }

    /// Migrate every Requests row into Loading and submit its root task.
    pub fn start_requests(&mut self) {
        let _span = tracing::debug_span!("start_requests").entered();
        let ready = self.tables.begin_loading_all();
        for (id, request) in ready {
            tracing::trace!(?id, path = %request.location.filename.display(), "Requested -> Loading");
            let importer = self.select_importer(&request.location);
            if importer.is_none() {
                tracing::warn!(
                    ?id,
                    extension = ?request.location.extension(),
                    "no importer matched this asset's source"
                );
            }
            let request_for_task = request.clone();
            let task = AssetLoadTask::spawn_root(
                &self.runtime,
                self.tables.id_allocator(),
                id,
                move |spawner| match importer {
                    Some(importer) => importer.load(&request_for_task, &spawner),
                    None => crate::variant::AssetVariant::Empty,
                },
            );
            self.tables.attach_loading_task(id, task);
        }
    }

    /// For every finished chain, classify every member and migrate the
    /// whole chain atomically into Succeeded<T> or Failed.
    pub fn update_progress(&mut self) {
        if !self.globals.update_progress_limiter.try_consume() {
            return;
        }
        let _span = tracing::debug_span!("update_progress").entered();
        for id in self.tables.done_loading_ids() {
            let Some(task) = self.tables.take_loading_task(id) else {
                continue;
            };
            self.finish_chain(task);
        }
    }

    fn finish_chain(&mut self, task: AssetLoadTask) {
        let root_id = task.target();
        let chain = task.into_results();

        // A scene's dedup pass marks its redundant sibling subtasks for
        // skipping; union across the whole chain since more than one scene
        // could in principle appear in it.
        let mut skip_ids: HashSet<StableId> = HashSet::new();
        for member in &chain {
            skip_ids.extend(member.variant().skip_ids());
        }

        let failure = chain.iter().find_map(|member| {
            if skip_ids.contains(&member.id()) {
                return None;
            }
            match member.variant() {
                crate::variant::AssetVariant::Empty => {
                    Some("no importer matched this asset's source".to_string())
                }
                crate::variant::AssetVariant::LoadFailure(reason) => Some(reason.clone()),
                _ => None,
            }
        });

        if let Some(reason) = failure {
            tracing::debug!(id = ?root_id, %reason, "chain failed");
            self.tables.migrate_root_to_failed(root_id, reason);
            for member in chain {
                if let ChainMember::Pending { pending, .. } = member {
                    self.tables.release_pending(pending);
                }
            }
            return;
        }

        for member in chain {
            let id = member.id();
            if skip_ids.contains(&id) {
                if let ChainMember::Pending { pending, .. } = member {
                    self.tables.release_pending(pending);
                }
                continue;
            }
            match member {
                ChainMember::Root { variant, .. } => match variant.classify() {
                    AssetOperation::Write(write) => {
                        self.tables.migrate_root_to_succeeded(id, write);
                        tracing::trace!(?id, "Loading -> Succeeded");
                    }
                    AssetOperation::Skip => {
                        // The root itself resolved to "deliberately
                        // nothing"; there is no Succeeded<T> to put it in,
                        // so it's surfaced as a Failed row with an
                        // explanatory reason rather than left stranded in
                        // Loading.
                        self.tables.migrate_root_to_failed(
                            id,
                            "importer produced no content for this request".to_string(),
                        );
                    }
                    AssetOperation::Failure(reason) => {
                        self.tables.migrate_root_to_failed(id, reason);
                    }
                },
                ChainMember::Pending {
                    variant,
                    handle,
                    pending,
                    ..
                } => match variant.classify() {
                    AssetOperation::Write(write) => {
                        let usage = handle.downgrade();
                        self.tables.insert_pending_as_succeeded(pending, usage, write);
                        tracing::trace!(?id, "pending subtask -> Succeeded");
                    }
                    AssetOperation::Skip => self.tables.release_pending(pending),
                    AssetOperation::Failure(_) => {
                        unreachable!("a chain-wide failure would have returned above")
                    }
                },
            }
        }
    }

    /// Despawn any row whose usage tracker has expired.
    pub fn garbage_collect(&mut self) {
        if !self.globals.garbage_collect_limiter.try_consume() {
            return;
        }
        let _span = tracing::debug_span!("garbage_collect").entered();
        self.tables.garbage_collect();
    }
}

impl AssetLoader for AssetService {
    fn request_load(&mut self, location: AssetLocation) -> AssetHandle {
        self.request_load_with_bytes(location, Vec::new())
    }

    fn request_load_with_bytes(&mut self, location: AssetLocation, bytes: Vec<u8>) -> AssetHandle {
        let handle = self.tables.request_load(location.clone(), bytes);
        self.globals.record_location(location, &handle);
        handle
    }
}

impl AssetReader for AssetService {
    fn get_load_state(&self, handle: &AssetHandle) -> LoadStep {
        self.tables.load_state(handle.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn png_bytes() -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn drain_until(service: &mut AssetService, handle: &AssetHandle, terminal: &[LoadStep]) {
        for _ in 0..10_000 {
            service.start_requests();
            service.update_progress();
            if terminal.contains(&service.get_load_state(handle)) {
                return;
            }
            std::thread::yield_now();
        }
        panic!("load never reached a terminal state");
    }

    #[test]
    fn single_image_happy_path() {
        let rt = runtime();
        let mut service = AssetService::with_importers(
            rt.handle().clone(),
            default_importers(),
            Globals::new(1, 1),
        );
        let handle = service.request_load_with_bytes(AssetLocation::new("a.png"), png_bytes());
        drain_until(&mut service, &handle, &[LoadStep::Succeeded, LoadStep::Failed]);

        assert_eq!(service.get_load_state(&handle), LoadStep::Succeeded);
        let material = service.material(&handle).expect("material row");
        assert_eq!(material.texture.width, 2);
        assert_eq!(material.texture.height, 2);
        assert!(matches!(
            material.texture.format,
            crate::assets::TextureFormat::Rgba8
        ));

        let events = service.drain_events();
        let creates = events
            .iter()
            .filter(|e| matches!(e, crate::tables::TableEvent::Created(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn unsupported_extension_fails() {
        let rt = runtime();
        let mut service = AssetService::new(rt.handle().clone());
        let handle = service.request_load(AssetLocation::new("a.xyz"));
        drain_until(&mut service, &handle, &[LoadStep::Succeeded, LoadStep::Failed]);
        assert_eq!(service.get_load_state(&handle), LoadStep::Failed);
        assert!(service.material(&handle).is_none());
    }

    #[test]
    fn rate_limiter_holds_a_finished_chain_in_loading_until_a_token_is_granted() {
        // A chain whose work is already done must stay `Loading` through
        // every `update_progress` call the limiter denies, then transition
        // on the first one it grants.
        let rt = runtime();
        let mut service = AssetService::with_importers(
            rt.handle().clone(),
            default_importers(),
            Globals::new(2, 1),
        );
        let handle = service.request_load_with_bytes(AssetLocation::new("a.png"), png_bytes());
        service.start_requests();

        for _ in 0..10_000 {
            if service.tables.done_loading_ids().contains(&handle.id()) {
                break;
            }
            std::thread::yield_now();
        }

        service.update_progress(); // 1st call: denied (1 % 2 != 0)
        assert_eq!(service.get_load_state(&handle), LoadStep::Loading);

        service.update_progress(); // 2nd call: granted (2 % 2 == 0)
        assert_eq!(service.get_load_state(&handle), LoadStep::Succeeded);
    }

    #[test]
    fn dropping_a_handle_before_completion_still_lets_the_load_finish_then_gcs_it() {
        let rt = runtime();
        let mut service = AssetService::with_importers(
            rt.handle().clone(),
            default_importers(),
            Globals::new(1, 1),
        );
        let handle = service.request_load_with_bytes(AssetLocation::new("a.png"), png_bytes());
        let id = handle.id();
        drop(handle);

        for _ in 0..10_000 {
            service.start_requests();
            service.update_progress();
            if service.tables.load_state(id) == LoadStep::Succeeded {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(service.tables.load_state(id), LoadStep::Succeeded);

        service.garbage_collect();
        assert_eq!(service.tables.load_state(id), LoadStep::Invalid);
        let events = service.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, crate::tables::TableEvent::Destroyed(d) if *d == id)));
    }
}
