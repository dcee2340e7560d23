//! Deduplicates materials and meshes produced while importing a scene.
//!
//! Hash each candidate, then confirm against every prior element sharing
//! that hash with real equality before accepting it as a duplicate, so a
//! hash collision never silently merges two distinct assets. Buckets
//! candidates in a `HashMap<u64, Vec<usize>>` rather than scanning a flat
//! list.
//!
//! Materials are interned before meshes because a mesh's identity includes
//! its already-remapped material index: callers must remap a mesh's
//! material index before interning the mesh.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::assets::{MaterialAsset, MeshAsset};

struct DedupTable<T> {
    items: Vec<T>,
    by_hash: HashMap<u64, Vec<usize>>,
}

impl<T> Default for DedupTable<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            by_hash: HashMap::new(),
        }
    }
}

impl<T: Hash + PartialEq> DedupTable<T> {
    /// Interns `item`, returning its canonical index and whether this call
    /// was the one that introduced it (`true`) versus a duplicate folding
    /// onto an earlier occurrence (`false`).
    fn intern(&mut self, item: T) -> (usize, bool) {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        let hash = hasher.finish();

        if let Some(candidates) = self.by_hash.get(&hash) {
            for &index in candidates {
                if self.items[index] == item {
                    return (index, false);
                }
            }
        }

        let index = self.items.len();
        self.by_hash.entry(hash).or_default().push(index);
        self.items.push(item);
        (index, true)
    }
}

/// Accumulates the unique materials and meshes discovered while walking one
/// scene's import, handing back indices a caller uses to build the final
/// `SceneAsset`.
///
/// Materials are kept as `Option<MaterialAsset>` so that "no texture"
/// (`EmptyAsset`) and failed imports dedup against each other the same way
/// real payloads do: a null payload compares equal only to another null.
#[derive(Default)]
pub struct Remapper {
    materials: DedupTable<Option<MaterialAsset>>,
    meshes: DedupTable<MeshAsset>,
}

impl Remapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a material, returning the index of its deduplicated slot and
    /// whether this call was the one that introduced that slot.
    pub fn intern_material(&mut self, material: MaterialAsset) -> (usize, bool) {
        self.materials.intern(Some(material))
    }

    /// Intern a material slot that produced no payload (an `EmptyAsset` or a
    /// failed/unsupported texture): a "null" that dedupes only against other
    /// nulls.
    pub fn intern_null_material(&mut self) -> (usize, bool) {
        self.materials.intern(None)
    }

    /// Intern a mesh under its already-remapped material index.
    pub fn intern_mesh(
        &mut self,
        mut mesh: MeshAsset,
        remapped_material_index: usize,
    ) -> (usize, bool) {
        mesh.material_index = remapped_material_index;
        self.meshes.intern(mesh)
    }

    /// Consume the remapper, returning the deduplicated material and mesh
    /// lists in interning order.
    pub fn into_parts(self) -> (Vec<Option<MaterialAsset>>, Vec<MeshAsset>) {
        (self.materials.items, self.meshes.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{QuantizedVec2, TextureAsset, TextureFormat, TextureSampleMode};
    use glam::Vec2;

    fn texture() -> TextureAsset {
        TextureAsset {
            width: 2,
            height: 2,
            sample_mode: TextureSampleMode::SnapToNearest,
            format: TextureFormat::Rgba8,
            bytes: vec![0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255],
        }
    }

    #[test]
    fn identical_materials_dedup_to_the_same_index() {
        let mut remapper = Remapper::new();
        let (a, a_new) = remapper.intern_material(MaterialAsset { texture: texture() });
        let (b, b_new) = remapper.intern_material(MaterialAsset { texture: texture() });
        assert_eq!(a, b);
        assert!(a_new);
        assert!(!b_new);
        let (materials, _) = remapper.into_parts();
        assert_eq!(materials.len(), 1);
    }

    #[test]
    fn distinct_materials_get_distinct_indices() {
        let mut remapper = Remapper::new();
        let mut other = texture();
        other.width = 4;
        let (a, _) = remapper.intern_material(MaterialAsset { texture: texture() });
        let (b, b_new) = remapper.intern_material(MaterialAsset { texture: other });
        assert_ne!(a, b);
        assert!(b_new);
    }

    #[test]
    fn identical_meshes_with_remapped_material_dedup() {
        let mut remapper = Remapper::new();
        let mesh = |material_index: usize| MeshAsset {
            material_index,
            vertices: vec![QuantizedVec2(Vec2::new(0.0, 0.0)), QuantizedVec2(Vec2::new(1.0, 0.0))],
            texture_coordinates: vec![QuantizedVec2(Vec2::new(0.0, 0.0)), QuantizedVec2(Vec2::new(1.0, 1.0))],
        };
        let (a, a_new) = remapper.intern_mesh(mesh(7), 0);
        let (b, b_new) = remapper.intern_mesh(mesh(99), 0);
        assert_eq!(a, b);
        assert!(a_new);
        assert!(!b_new);
        let (_, meshes) = remapper.into_parts();
        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].material_index, 0);
    }

    #[test]
    fn null_materials_dedup_only_against_other_nulls() {
        let mut remapper = Remapper::new();
        let (a, a_new) = remapper.intern_null_material();
        let (b, _) = remapper.intern_material(MaterialAsset { texture: texture() });
        let (c, c_new) = remapper.intern_null_material();
        assert!(a_new);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert!(!c_new);
        let (materials, _) = remapper.into_parts();
        assert_eq!(materials.len(), 2);
        assert!(materials[a].is_none());
    }

    #[test]
    fn rerunning_the_remapper_over_an_already_canonical_list_is_identity() {
        // Deduplicating an already-deduplicated set yields identity indices
        // and an unchanged count.
        let mut first = Remapper::new();
        let (mat_a, _) = first.intern_material(MaterialAsset { texture: texture() });
        let mesh = MeshAsset {
            material_index: mat_a,
            vertices: vec![QuantizedVec2(Vec2::new(0.0, 0.0)), QuantizedVec2(Vec2::new(1.0, 0.0))],
            texture_coordinates: vec![QuantizedVec2(Vec2::new(0.0, 0.0)), QuantizedVec2(Vec2::new(1.0, 1.0))],
        };
        first.intern_mesh(mesh, mat_a);
        let (materials, meshes) = first.into_parts();

        let mut second = Remapper::new();
        let mut second_materials = Vec::new();
        for material in materials.iter().cloned() {
            let (index, is_new) = match material {
                Some(material) => second.intern_material(material),
                None => second.intern_null_material(),
            };
            assert!(is_new, "already-canonical input should never re-collide");
            second_materials.push(index);
        }
        for mesh in meshes.iter().cloned() {
            let remapped = second_materials[mesh.material_index];
            let (index, is_new) = second.intern_mesh(mesh, remapped);
            assert!(is_new);
            assert_eq!(index, 0);
        }
        let (materials2, meshes2) = second.into_parts();
        assert_eq!(materials.len(), materials2.len());
        assert_eq!(meshes.len(), meshes2.len());
    }

    #[test]
    fn near_identical_coordinates_hash_together_but_compare_exact() {
        // Same quantized hash (rounds to the same millipoint) but the exact
        // f32 bits differ, so these must NOT be deduplicated against each
        // other.
        let a = QuantizedVec2(Vec2::new(1.0, 0.0));
        let b = QuantizedVec2(Vec2::new(1.0 + f32::EPSILON, 0.0));
        let mut hasher_a = DefaultHasher::new();
        a.hash(&mut hasher_a);
        let mut hasher_b = DefaultHasher::new();
        b.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());
        assert_ne!(a, b);
    }
}
