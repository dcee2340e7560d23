//! End-to-end scene load scenarios driven through the full `AssetService`
//! pass loop rather than unit-testing `SceneImporter` in isolation, since
//! the dedup/failure behavior only exists at the chain-finalization
//! boundary between `importer.rs` and `service.rs`.

use std::sync::Arc;

use dare_loader::handle::{AssetLocation, LoadRequest, LoadStep};
use dare_loader::importer::{default_importers, Importer};
use dare_loader::service::{AssetLoader, AssetReader, AssetService, Globals};
use dare_loader::task::SubtaskSpawner;
use dare_loader::variant::AssetVariant;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn drain_until_terminal(service: &mut AssetService, handle: &dare_loader::handle::AssetHandle) {
    for _ in 0..10_000 {
        service.start_requests();
        service.update_progress();
        match service.get_load_state(handle) {
            LoadStep::Succeeded | LoadStep::Failed => return,
            _ => std::thread::yield_now(),
        }
    }
    panic!("load never reached a terminal state");
}

/// A minimal valid glTF (JSON, no binary chunk) with one triangle mesh built
/// from two primitives that share the same attributes, indices, and
/// material, so their imported `MeshAsset` payloads are byte-identical.
/// Buffer bytes: 3 `VEC3` positions (36 bytes), then 3 `u16` indices padded
/// to 4-byte alignment (8 bytes).
const TWO_IDENTICAL_PRIMITIVES_GLTF: &str = r#"{
  "asset": {"version": "2.0"},
  "scene": 0,
  "scenes": [{"nodes": [0]}],
  "nodes": [{"mesh": 0}],
  "meshes": [{
    "primitives": [
      {"attributes": {"POSITION": 0}, "indices": 1, "material": 0},
      {"attributes": {"POSITION": 0}, "indices": 1, "material": 0}
    ]
  }],
  "materials": [{"pbrMetallicRoughness": {}}],
  "accessors": [
    {"bufferView": 0, "byteOffset": 0, "componentType": 5126, "count": 3, "type": "VEC3",
     "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]},
    {"bufferView": 1, "byteOffset": 0, "componentType": 5123, "count": 3, "type": "SCALAR"}
  ],
  "bufferViews": [
    {"buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962},
    {"buffer": 0, "byteOffset": 36, "byteLength": 6, "target": 34963}
  ],
  "buffers": [
    {"byteLength": 44, "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAABAAIAAAA="}
  ]
}"#;

#[test]
fn scene_with_two_identical_meshes_dedups_to_one_row() {
    let rt = runtime();
    let mut service =
        AssetService::with_importers(rt.handle().clone(), default_importers(), Globals::new(1, 1));

    let handle = service.request_load_with_bytes(
        AssetLocation::new("scene.gltf"),
        TWO_IDENTICAL_PRIMITIVES_GLTF.as_bytes().to_vec(),
    );
    drain_until_terminal(&mut service, &handle);

    assert_eq!(service.get_load_state(&handle), LoadStep::Succeeded);
    let scene = service.scene(&handle).expect("scene row");
    assert_eq!(scene.meshes.len(), 2, "the scene still points at two mesh slots");
    assert_eq!(
        scene.meshes[0].id(),
        scene.meshes[1].id(),
        "both mesh slots should resolve to the same deduplicated row"
    );
    assert!(service.mesh(&scene.meshes[0]).is_some());
}

/// A test-only composite importer that spawns one succeeding and one
/// failing child subtask, exercising the same chain-finalization path a
/// real `SceneImporter` would hit without depending on glTF-specific
/// content to force a decode failure.
struct FailingChildImporter;

impl Importer for FailingChildImporter {
    fn supports(&self, extension: &str) -> bool {
        extension == "brokenscene"
    }

    fn load(&self, _request: &LoadRequest, spawner: &SubtaskSpawner) -> AssetVariant {
        let ok_child = spawner.spawn(|_| {
            AssetVariant::Mesh(dare_loader::assets::MeshAsset {
                material_index: 0,
                vertices: Vec::new(),
                texture_coordinates: Vec::new(),
            })
        });
        let failing_child = spawner.spawn(|_| AssetVariant::LoadFailure("mesh child exploded".into()));

        let _ = ok_child.await_blocking();
        let _ = failing_child.await_blocking();

        AssetVariant::Scene(
            dare_loader::assets::SceneAsset {
                meshes: Vec::new(),
                materials: Vec::new(),
            },
            std::collections::HashSet::new(),
        )
    }
}

#[test]
fn scene_with_a_failing_child_fails_the_whole_chain_and_releases_pending_ids() {
    let rt = runtime();
    let importers: Vec<Arc<dyn Importer>> = vec![Arc::new(FailingChildImporter)];
    let mut service = AssetService::with_importers(rt.handle().clone(), importers, Globals::new(1, 1));

    let handle = service.request_load(AssetLocation::new("broken.brokenscene"));
    drain_until_terminal(&mut service, &handle);

    assert_eq!(service.get_load_state(&handle), LoadStep::Failed);
    assert!(service.scene(&handle).is_none());
    assert!(service.mesh(&handle).is_none());

    // At quiescence, neither child's pending reservation is left
    // outstanding: the surviving one was released when the chain failed,
    // same as the failing one's own drop.
    assert_eq!(service.id_allocator().outstanding_unclaimed(), 0);
}
