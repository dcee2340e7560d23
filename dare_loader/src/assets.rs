//! Typed payload structs produced by importers.

use glam::Vec2;

use crate::handle::AssetHandle;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureSampleMode {
    SnapToNearest,
    LinearInterpolation,
}

/// Input-side convenience: the threshold (128x128) is the only magic constant
/// in the texture path.
pub enum TextureSampleModeInput {
    Fixed(TextureSampleMode),
    GuessFromSize,
}

impl TextureSampleModeInput {
    pub fn resolve(&self, width: usize, height: usize) -> TextureSampleMode {
        match self {
            TextureSampleModeInput::Fixed(mode) => *mode,
            TextureSampleModeInput::GuessFromSize => {
                if width * height > 128 * 128 {
                    TextureSampleMode::LinearInterpolation
                } else {
                    TextureSampleMode::SnapToNearest
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureAsset {
    pub width: usize,
    pub height: usize,
    pub sample_mode: TextureSampleMode,
    pub format: TextureFormat,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterialAsset {
    pub texture: TextureAsset,
}

/// Index into the vertex/uv records of a mesh; hashed by value for dedup, and
/// ordered so it can be quantized for the coordinate-noise-tolerant hash.
#[derive(Debug, Clone, Copy)]
pub struct QuantizedVec2(pub Vec2);

impl QuantizedVec2 {
    fn quantized(&self) -> (i64, i64) {
        ((self.0.x * 1000.0).round() as i64, (self.0.y * 1000.0).round() as i64)
    }
}

impl PartialEq for QuantizedVec2 {
    fn eq(&self, other: &Self) -> bool {
        // Equality is exact on the already-loaded value, not the quantized
        // hash key. Deliberate asymmetry.
        self.0.x.to_bits() == other.0.x.to_bits() && self.0.y.to_bits() == other.0.y.to_bits()
    }
}
impl Eq for QuantizedVec2 {}

impl std::hash::Hash for QuantizedVec2 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.quantized().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshAsset {
    /// Index into the material list of the containing scene.
    pub material_index: usize,
    pub vertices: Vec<QuantizedVec2>,
    pub texture_coordinates: Vec<QuantizedVec2>,
}

/// Index into the meshes of a scene; `MAX` is the unset sentinel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MeshIndex(pub u32);

impl MeshIndex {
    pub const UNSET: MeshIndex = MeshIndex(u32::MAX);

    pub fn is_set(&self) -> bool {
        *self != Self::UNSET
    }
}

impl Default for MeshIndex {
    fn default() -> Self {
        Self::UNSET
    }
}

/// A fully-resolved scene: handles to its deduplicated meshes and materials.
#[derive(Debug, Clone)]
pub struct SceneAsset {
    pub meshes: Vec<AssetHandle>,
    pub materials: Vec<AssetHandle>,
}
