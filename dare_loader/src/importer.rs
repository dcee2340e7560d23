//! Concrete importers, selected by `AssetLocation` extension.
//!
//! The raster-image path is backed by the `image` crate; the composite
//! scene path is backed by `gltf`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::assets::{
    MaterialAsset, MeshAsset, QuantizedVec2, SceneAsset, TextureAsset, TextureFormat,
    TextureSampleModeInput,
};
use crate::handle::LoadRequest;
use crate::remap::Remapper;
use crate::task::SubtaskSpawner;
use crate::variant::AssetVariant;
use glam::Vec2;

/// Capability importers implement: can this source's extension be handled,
/// and if so, produce (or schedule) its result.
///
/// `Send + Sync` because the importer list is shared across worker threads;
/// multiple root tasks may execute concurrently.
pub trait Importer: Send + Sync {
    fn supports(&self, extension: &str) -> bool;
    fn load(&self, request: &LoadRequest, spawner: &SubtaskSpawner) -> AssetVariant;
}

/// Default importer list, scene formats before the generic raster importer;
/// first match wins.
///
/// `Arc` rather than `Box` because `start_requests` clones the matched
/// importer into each root task's `'static` closure; the list itself is
/// shared across every load the service ever starts.
pub fn default_importers() -> Vec<Arc<dyn Importer>> {
    vec![Arc::new(SceneImporter), Arc::new(MaterialImporter)]
}

fn raw_rgba8_to_material(
    width: u32,
    height: u32,
    rgba: Vec<u8>,
) -> MaterialAsset {
    MaterialAsset {
        texture: TextureAsset {
            width: width as usize,
            height: height as usize,
            sample_mode: TextureSampleModeInput::GuessFromSize
                .resolve(width as usize, height as usize),
            format: TextureFormat::Rgba8,
            bytes: rgba,
        },
    }
}

/// The generic raster-image importer (jpeg/jpg/png/bmp/tga, case-insensitive).
pub struct MaterialImporter;

impl Importer for MaterialImporter {
    fn supports(&self, extension: &str) -> bool {
        matches!(extension, "jpeg" | "jpg" | "png" | "bmp" | "tga")
    }

    fn load(&self, request: &LoadRequest, _spawner: &SubtaskSpawner) -> AssetVariant {
        let decoded = if request.contents.is_empty() {
            image::open(&request.location.filename)
        } else {
            image::load_from_memory(&request.contents)
        };
        match decoded {
            Ok(image) => {
                let rgba = image.to_rgba8();
                let (width, height) = (rgba.width(), rgba.height());
                AssetVariant::Material(raw_rgba8_to_material(width, height, rgba.into_raw()))
            }
            Err(err) => AssetVariant::LoadFailure(format!("failed to decode image: {err}")),
        }
    }
}

/// The composite scene importer (`.gltf`/`.glb`). Spawns one child task per
/// mesh primitive and per material, awaits them, deduplicates the results,
/// and emits a `SceneAsset` whose handle arrays reuse one canonical handle
/// per duplicate group.
pub struct SceneImporter;

impl Importer for SceneImporter {
    fn supports(&self, extension: &str) -> bool {
        matches!(extension, "gltf" | "glb")
    }

    fn load(&self, request: &LoadRequest, spawner: &SubtaskSpawner) -> AssetVariant {
        let imported = if request.contents.is_empty() {
            gltf::import(&request.location.filename)
        } else {
            gltf::import_slice(&request.contents)
        };
        let (document, buffers, images) = match imported {
            Ok(parts) => parts,
            Err(err) => return AssetVariant::LoadFailure(format!("failed to parse scene: {err}")),
        };

        // Each material becomes its own subtask, mirroring a material-less
        // slot as `EmptyAsset` rather than a failure.
        let material_handles: Vec<_> = document
            .materials()
            .map(|mat| {
                let base_color = mat.pbr_metallic_roughness().base_color_texture();
                let image_index = base_color.map(|info| info.texture().source().index());
                let image_data = image_index.and_then(|idx| images.get(idx)).cloned();
                spawner.spawn(move |_| match image_data {
                    Some(image) => match rgba8_from_gltf_image(&image) {
                        Some((width, height, pixels)) => {
                            AssetVariant::Material(raw_rgba8_to_material(width, height, pixels))
                        }
                        None => AssetVariant::LoadFailure(
                            "unsupported embedded image pixel format".into(),
                        ),
                    },
                    None => AssetVariant::EmptyAsset,
                })
            })
            .collect();

        let mesh_handles: Vec<_> = document
            .meshes()
            .flat_map(|mesh| mesh.primitives())
            .map(|primitive| {
                let material_index = primitive.material().index().unwrap_or(0);
                let reader = primitive.reader(|b| buffers.get(b.index()).map(|d| d.0.as_slice()));
                let positions: Vec<[f32; 3]> =
                    reader.read_positions().map(|it| it.collect()).unwrap_or_default();
                let uvs: Vec<[f32; 2]> = reader
                    .read_tex_coords(0)
                    .map(|it| it.into_f32().collect())
                    .unwrap_or_default();
                let indices: Vec<usize> = reader
                    .read_indices()
                    .map(|it| it.into_u32().map(|i| i as usize).collect())
                    .unwrap_or_else(|| (0..positions.len()).collect());

                spawner.spawn(move |_| {
                    let vertices = indices
                        .iter()
                        .map(|&i| QuantizedVec2(Vec2::new(positions[i][0], positions[i][1])))
                        .collect();
                    let texture_coordinates = indices
                        .iter()
                        .map(|&i| {
                            let uv = uvs.get(i).copied().unwrap_or([0.0, 0.0]);
                            QuantizedVec2(Vec2::new(uv[0], uv[1]))
                        })
                        .collect();
                    AssetVariant::Mesh(MeshAsset {
                        material_index,
                        vertices,
                        texture_coordinates,
                    })
                })
            })
            .collect();

        // Block this (already-blocking-pool) thread on every child before
        // deduplicating.
        let material_results: Vec<_> = material_handles
            .iter()
            .map(|child| (child, child.await_blocking()))
            .collect();
        let mesh_results: Vec<_> = mesh_handles
            .iter()
            .map(|child| (child, child.await_blocking()))
            .collect();

        let mut remapper = Remapper::new();
        let mut skip_ids = HashSet::new();

        // `scene_materials[original_index]` is the canonical (deduplicated)
        // material index a mesh's `material_index` remaps to.
        let mut scene_materials = Vec::with_capacity(material_results.len());
        let mut canonical_material_handle: Vec<crate::handle::AssetHandle> = Vec::new();

        for (child, variant) in &material_results {
            // A "no texture" slot is a null payload that dedupes only against
            // other nulls, so it goes through the same interning path as a
            // real material rather than bypassing it.
            let (index, is_new) = match variant {
                AssetVariant::Material(material) => remapper.intern_material(material.clone()),
                _ => remapper.intern_null_material(),
            };
            if is_new {
                debug_assert_eq!(index, canonical_material_handle.len());
                canonical_material_handle.push(child.asset_handle.clone());
            } else {
                skip_ids.insert(child.id);
            }
            scene_materials.push(index);
        }

        let mut canonical_mesh_handle: Vec<crate::handle::AssetHandle> = Vec::new();
        let mut scene_meshes = Vec::with_capacity(mesh_results.len());
        for (child, variant) in &mesh_results {
            match variant {
                AssetVariant::Mesh(mesh) => {
                    let remapped_material = scene_materials
                        .get(mesh.material_index)
                        .copied()
                        .unwrap_or(mesh.material_index);
                    let (index, is_new) = remapper.intern_mesh(mesh.clone(), remapped_material);
                    if is_new {
                        debug_assert_eq!(index, canonical_mesh_handle.len());
                        canonical_mesh_handle.push(child.asset_handle.clone());
                    } else {
                        skip_ids.insert(child.id);
                    }
                    scene_meshes.push(canonical_mesh_handle[index].clone());
                }
                _ => {
                    skip_ids.insert(child.id);
                    scene_meshes.push(child.asset_handle.clone());
                }
            }
        }

        AssetVariant::Scene(
            SceneAsset {
                meshes: scene_meshes,
                materials: canonical_material_handle,
            },
            skip_ids,
        )
    }
}

fn rgba8_from_gltf_image(image: &gltf::image::Data) -> Option<(u32, u32, Vec<u8>)> {
    use gltf::image::Format;
    let channels = match image.format {
        Format::R8 => 1,
        Format::R8G8 => 2,
        Format::R8G8B8 => 3,
        Format::R8G8B8A8 => 4,
        _ => return None,
    };
    let mut out = Vec::with_capacity((image.width * image.height * 4) as usize);
    for pixel in image.pixels.chunks_exact(channels) {
        match channels {
            1 => out.extend_from_slice(&[pixel[0], pixel[0], pixel[0], 255]),
            2 => out.extend_from_slice(&[pixel[0], pixel[0], pixel[0], pixel[1]]),
            3 => out.extend_from_slice(&[pixel[0], pixel[1], pixel[2], 255]),
            4 => out.extend_from_slice(pixel),
            _ => unreachable!(),
        }
    }
    Some((image.width, image.height, out))
}
