//! Asset handles and the usage-tracking GC marker.
//!
//! The row holds a *weak* reference, and the set of live strong references
//! is exactly the set of outstanding consumer handles. `UsageTracker` is a
//! bare marker type; `garbage_collect` polls `Weak::strong_count` lazily
//! during its rate-limited sweep rather than listening on a drop channel.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::id::StableId;

/// Shared marker whose live strong-ref count drives garbage collection.
#[derive(Debug, Default)]
pub struct UsageTracker;

/// A stable, shareable, cheap-to-copy reference to an asset.
///
/// Equality is identifier equality: two handles referring to the same asset
/// compare equal even if their usage trackers have since diverged (which
/// cannot happen in practice, since cloning a handle shares the tracker).
#[derive(Clone)]
pub struct AssetHandle {
    pub(crate) id: StableId,
    pub(crate) usage: Arc<UsageTracker>,
}

impl AssetHandle {
    pub(crate) fn new(id: StableId) -> Self {
        Self {
            id,
            usage: Arc::new(UsageTracker),
        }
    }

    pub fn id(&self) -> StableId {
        self.id
    }

    pub(crate) fn downgrade(&self) -> Weak<UsageTracker> {
        Arc::downgrade(&self.usage)
    }

    /// Rebuild a handle from a previously-downgraded tracker, for readers
    /// (like the advisory location index) that must not hold a strong ref
    /// themselves, only resurrecting one if a consumer still does.
    pub(crate) fn from_weak(id: StableId, usage: Weak<UsageTracker>) -> Option<Self> {
        Some(Self {
            id,
            usage: usage.upgrade()?,
        })
    }
}

impl PartialEq for AssetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for AssetHandle {}

impl Hash for AssetHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetHandle({:?})", self.id)
    }
}

/// A user-facing key identifying an asset source: a filename, plus optional
/// in-memory bytes that should be treated as the source instead of reading
/// the filename from disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetLocation {
    pub filename: PathBuf,
}

impl AssetLocation {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// The extension used for importer selection, lowercased.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// `{ location, contents }`. If `contents` is empty the importer reads the
/// location's filename from disk; otherwise the bytes are the source.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub location: AssetLocation,
    pub contents: Vec<u8>,
}

impl LoadRequest {
    pub fn from_file(location: AssetLocation) -> Self {
        Self {
            location,
            contents: Vec::new(),
        }
    }

    pub fn from_bytes(location: AssetLocation, contents: Vec<u8>) -> Self {
        Self { location, contents }
    }
}

/// The verdict for a handle at a point in time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadStep {
    Requested,
    Loading,
    Succeeded,
    Failed,
    /// The identifier resolves to no table row; not a stored state.
    Invalid,
}
