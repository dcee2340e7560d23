//! The tagged-union payload an importer task produces, and how it gets
//! written into a table row.
//!
//! `Empty` is the seed value a task starts in, so an unmatched extension
//! leaves it in place and it classifies as a failure; `EmptyAsset` is the
//! distinct "the importer deliberately produced no content" case.

use std::collections::HashSet;

use bevy_ecs::world::EntityWorldMut;

use crate::assets::{MaterialAsset, MeshAsset, SceneAsset};
use crate::id::StableId;

/// What a finished (sub)task produced.
#[derive(Clone)]
pub enum AssetVariant {
    /// Initial value; also what's left behind when no importer matched the
    /// location's extension. Classifies as a failure.
    Empty,
    /// Terminal: invalidates the whole chain.
    LoadFailure(String),
    /// Terminal, not a failure: the importer deliberately produced no typed
    /// output (e.g. a material with no texture assigned). No destination row.
    EmptyAsset,
    Material(MaterialAsset),
    Mesh(MeshAsset),
    /// A scene, plus the set of sibling subtask ids (in the same chain) whose
    /// payload was a redundant duplicate the scene's own remapper folded
    /// away. Those members should not get a row of their own even though
    /// their own variant is otherwise a plain `Write`.
    Scene(SceneAsset, HashSet<StableId>),
}

/// What `update_progress` should do with a finished variant once a task's
/// whole chain is done.
pub enum AssetOperation {
    /// Move the row into the `Failed` table with this message.
    Failure(String),
    /// Nothing to migrate. Either an `EmptyAsset`, or a sibling the scene's
    /// dedup pass folded away.
    Skip,
    /// Move the row into `Succeeded<T>`, running this closure against the
    /// freshly-migrated `EntityWorldMut` to attach the typed payload
    /// component.
    Write(Box<dyn FnOnce(&mut EntityWorldMut) + Send>),
}

impl AssetVariant {
    /// Any sibling ids this variant wants skipped during finalization (only
    /// ever non-empty for `Scene`).
    pub fn skip_ids(&self) -> HashSet<StableId> {
        match self {
            AssetVariant::Scene(_, skip) => skip.clone(),
            _ => HashSet::new(),
        }
    }

    /// Classify this variant into the operation `update_progress` performs
    /// once the owning task (and its whole subtask chain) is done.
    pub fn classify(self) -> AssetOperation {
        match self {
            AssetVariant::Empty => {
                AssetOperation::Failure("no importer matched this asset's source".into())
            }
            AssetVariant::LoadFailure(reason) => AssetOperation::Failure(reason),
            AssetVariant::EmptyAsset => AssetOperation::Skip,
            AssetVariant::Material(material) => {
                AssetOperation::Write(Box::new(move |entity| {
                    entity.insert(crate::tables::MaterialRow(material));
                }))
            }
            AssetVariant::Mesh(mesh) => AssetOperation::Write(Box::new(move |entity| {
                entity.insert(crate::tables::MeshRow(mesh));
            })),
            AssetVariant::Scene(scene, _) => AssetOperation::Write(Box::new(move |entity| {
                entity.insert(crate::tables::SceneRow(scene));
            })),
        }
    }
}
