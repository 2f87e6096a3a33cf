//! Merging normalized fragments into one glTF document.
//!
//! Every fragment's top-level arrays are appended to the merged document and
//! all cross-references are shifted by the running offsets. BIN chunks are
//! concatenated on 4-byte boundaries into a single buffer. Each fragment's
//! scene roots are parented under one wrapper node carrying the fragment's
//! normalized translation, rotation and scale.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::{SceneError, SceneResult};
use crate::glb::{GlbDocument, array, root_nodes};
use crate::normalize::NormalizedScene;

/// Arrays copied into the merged document, in output order.
const MERGED_ARRAYS: [&str; 11] = [
    "accessors",
    "animations",
    "bufferViews",
    "cameras",
    "images",
    "materials",
    "meshes",
    "nodes",
    "samplers",
    "skins",
    "textures",
];

/// Merge every fragment of `scene` into a single document.
pub fn merge_scene<G: AsRef<GlbDocument>>(scene: &NormalizedScene<G>) -> SceneResult<GlbDocument> {
    if scene.fragments.is_empty() {
        return Err(SceneError::EmptyScene);
    }

    let mut merged: HashMap<&'static str, Vec<Value>> =
        MERGED_ARRAYS.iter().map(|&name| (name, Vec::new())).collect();
    let mut bin: Vec<u8> = Vec::new();
    let mut extensions_used: Vec<Value> = Vec::new();
    let mut extensions_required: Vec<Value> = Vec::new();
    let mut wrappers = Vec::with_capacity(scene.fragments.len());

    for fragment in &scene.fragments {
        let document = fragment.geometry.as_ref();
        let json = document.json();
        check_buffers(json, &fragment.source)?;

        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let offsets = Offsets {
            accessors: merged["accessors"].len(),
            buffer_views: merged["bufferViews"].len(),
            cameras: merged["cameras"].len(),
            images: merged["images"].len(),
            materials: merged["materials"].len(),
            meshes: merged["meshes"].len(),
            nodes: merged["nodes"].len(),
            samplers: merged["samplers"].len(),
            skins: merged["skins"].len(),
            textures: merged["textures"].len(),
            bin: bin.len(),
        };
        bin.extend_from_slice(document.bin());

        for name in MERGED_ARRAYS {
            let items = array(json, name).iter().cloned().map(|mut item| {
                offsets.remap(name, &mut item);
                item
            });
            if let Some(target) = merged.get_mut(name) {
                target.extend(items);
            }
        }

        union_into(&mut extensions_used, array(json, "extensionsUsed"));
        union_into(&mut extensions_required, array(json, "extensionsRequired"));

        let children: Vec<usize> = root_nodes(json)
            .into_iter()
            .map(|node| node + offsets.nodes)
            .collect();
        let rotation = fragment.rotation;
        wrappers.push(json!({
            "name": fragment.source,
            "translation": fragment.position.to_array(),
            "rotation": [rotation.x, rotation.y, rotation.z, rotation.w],
            "scale": [fragment.scale, fragment.scale, fragment.scale],
            "children": children,
        }));
    }

    let mut nodes = merged.remove("nodes").unwrap_or_default();
    let first_wrapper = nodes.len();
    let wrapper_count = wrappers.len();
    nodes.extend(wrappers);

    let mut root = Map::new();
    root.insert(
        "asset".to_string(),
        json!({ "version": "2.0", "generator": concat!("gtiles ", env!("CARGO_PKG_VERSION")) }),
    );
    root.insert("scene".to_string(), json!(0));
    root.insert(
        "scenes".to_string(),
        json!([{ "nodes": (first_wrapper..first_wrapper + wrapper_count).collect::<Vec<_>>() }]),
    );
    root.insert("nodes".to_string(), Value::Array(nodes));
    for name in MERGED_ARRAYS {
        if let Some(items) = merged.remove(name).filter(|items| !items.is_empty()) {
            root.insert(name.to_string(), Value::Array(items));
        }
    }
    if !bin.is_empty() {
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        root.insert("buffers".to_string(), json!([{ "byteLength": bin.len() }]));
    }
    if !extensions_used.is_empty() {
        root.insert("extensionsUsed".to_string(), Value::Array(extensions_used));
    }
    if !extensions_required.is_empty() {
        root.insert(
            "extensionsRequired".to_string(),
            Value::Array(extensions_required),
        );
    }

    tracing::debug!(
        fragments = wrapper_count,
        bytes = bin.len(),
        "merged scene"
    );

    GlbDocument::from_parts(Value::Object(root), bin)
}

/// Only the GLB-embedded buffer can be merged.
fn check_buffers(json: &Value, source: &str) -> SceneResult<()> {
    let buffers = array(json, "buffers");
    if buffers.len() > 1 || buffers.iter().any(|buffer| buffer.get("uri").is_some()) {
        return Err(SceneError::Unsupported(format!(
            "{source}: external or multiple buffers"
        )));
    }
    Ok(())
}

fn union_into(target: &mut Vec<Value>, items: &[Value]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Running sizes of the merged arrays when a fragment is appended.
struct Offsets {
    accessors: usize,
    buffer_views: usize,
    cameras: usize,
    images: usize,
    materials: usize,
    meshes: usize,
    nodes: usize,
    samplers: usize,
    skins: usize,
    textures: usize,
    bin: usize,
}

impl Offsets {
    fn remap(&self, array_name: &str, item: &mut Value) {
        match array_name {
            "accessors" => {
                shift(item, "bufferView", self.buffer_views);
                if let Some(sparse) = item.get_mut("sparse") {
                    for part in ["indices", "values"] {
                        if let Some(part) = sparse.get_mut(part) {
                            shift(part, "bufferView", self.buffer_views);
                        }
                    }
                }
            }
            "animations" => {
                for channel in array_mut(item, "channels") {
                    if let Some(target) = channel.get_mut("target") {
                        shift(target, "node", self.nodes);
                    }
                }
                for sampler in array_mut(item, "samplers") {
                    shift(sampler, "input", self.accessors);
                    shift(sampler, "output", self.accessors);
                }
            }
            "bufferViews" => {
                if let Some(view) = item.as_object_mut() {
                    let offset = view.get("byteOffset").and_then(Value::as_u64).unwrap_or(0);
                    view.insert("buffer".to_string(), json!(0));
                    view.insert("byteOffset".to_string(), json!(offset + self.bin as u64));
                }
            }
            "images" => shift(item, "bufferView", self.buffer_views),
            "materials" => shift_texture_infos(item, self.textures),
            "meshes" => {
                for primitive in array_mut(item, "primitives") {
                    if let Some(attributes) = primitive.get_mut("attributes") {
                        shift_values(attributes, self.accessors);
                    }
                    shift(primitive, "indices", self.accessors);
                    shift(primitive, "material", self.materials);
                    for target in array_mut(primitive, "targets") {
                        shift_values(target, self.accessors);
                    }
                    if let Some(draco) = primitive
                        .get_mut("extensions")
                        .and_then(|extensions| extensions.get_mut("KHR_draco_mesh_compression"))
                    {
                        shift(draco, "bufferView", self.buffer_views);
                    }
                }
            }
            "nodes" => {
                shift(item, "mesh", self.meshes);
                shift(item, "camera", self.cameras);
                shift(item, "skin", self.skins);
                shift_all(item, "children", self.nodes);
            }
            "skins" => {
                shift(item, "inverseBindMatrices", self.accessors);
                shift(item, "skeleton", self.nodes);
                shift_all(item, "joints", self.nodes);
            }
            "textures" => {
                shift(item, "source", self.images);
                shift(item, "sampler", self.samplers);
                // KHR_texture_basisu, EXT_texture_webp and friends.
                if let Some(extensions) = item.get_mut("extensions").and_then(Value::as_object_mut) {
                    for extension in extensions.values_mut() {
                        shift(extension, "source", self.images);
                    }
                }
            }
            _ => {}
        }
    }
}

fn shift(value: &mut Value, key: &str, offset: usize) {
    if let Some(slot) = value.get_mut(key) {
        shift_index(slot, offset);
    }
}

fn shift_all(value: &mut Value, key: &str, offset: usize) {
    for slot in array_mut(value, key) {
        shift_index(slot, offset);
    }
}

/// Shift every value of an object, e.g. primitive attributes.
fn shift_values(value: &mut Value, offset: usize) {
    if let Some(object) = value.as_object_mut() {
        for slot in object.values_mut() {
            shift_index(slot, offset);
        }
    }
}

fn shift_index(slot: &mut Value, offset: usize) {
    if let Some(index) = slot.as_u64() {
        *slot = json!(index + offset as u64);
    }
}

/// Texture infos are objects named `*Texture` holding an `index`, at any depth.
fn shift_texture_infos(value: &mut Value, offset: usize) {
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                if key.ends_with("Texture") && child.get("index").is_some() {
                    shift(child, "index", offset);
                }
                shift_texture_infos(child, offset);
            }
        }
        Value::Array(items) => {
            for item in items {
                shift_texture_infos(item, offset);
            }
        }
        _ => {}
    }
}

fn array_mut<'a>(value: &'a mut Value, key: &str) -> &'a mut [Value] {
    value
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .map(Vec::as_mut_slice)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glb::tests::triangle;
    use crate::normalize::{MeshFragment, SceneNormalizer};
    use glam::DVec3;

    fn merged_pair() -> GlbDocument {
        let scene = SceneNormalizer::default()
            .normalize(vec![
                MeshFragment::new("https://t/a.glb", triangle([6_378_000.0, 0.0, 0.0])),
                MeshFragment::new("https://t/b.glb", triangle([6_378_000.0, 0.0, 10.0])),
            ])
            .unwrap();
        merge_scene(&scene).unwrap()
    }

    #[test]
    fn test_indices_are_remapped() {
        let merged = merged_pair();
        let json = merged.json();

        assert_eq!(array(json, "accessors").len(), 2);
        assert_eq!(array(json, "bufferViews").len(), 4);
        assert_eq!(array(json, "meshes").len(), 2);
        // Two fragment nodes each, plus two wrappers.
        assert_eq!(array(json, "nodes").len(), 6);

        assert_eq!(json["accessors"][1]["bufferView"], 2);
        assert_eq!(json["meshes"][1]["primitives"][0]["attributes"]["POSITION"], 1);
        assert_eq!(json["meshes"][1]["primitives"][0]["material"], 1);
        assert_eq!(json["nodes"][2]["children"], json!([3]));
        assert_eq!(json["nodes"][3]["mesh"], 1);
        assert_eq!(
            json["materials"][1]["pbrMetallicRoughness"]["baseColorTexture"]["index"],
            1
        );
        assert_eq!(json["textures"][1]["source"], 1);
        assert_eq!(json["textures"][1]["sampler"], 1);
        assert_eq!(json["images"][1]["bufferView"], 3);

        assert_eq!(json["scenes"][0]["nodes"], json!([4, 5]));
        assert_eq!(json["nodes"][4]["children"], json!([0]));
        assert_eq!(json["nodes"][5]["children"], json!([2]));
        assert_eq!(json["nodes"][5]["name"], "https://t/b.glb");
    }

    #[test]
    fn test_buffers_are_concatenated() {
        let merged = merged_pair();
        let json = merged.json();
        assert_eq!(merged.bin().len(), 72);
        assert_eq!(json["buffers"][0]["byteLength"], 72);
        assert_eq!(json["bufferViews"][2]["byteOffset"], 36);
        assert_eq!(json["bufferViews"][2]["buffer"], 0);
        assert_eq!(&merged.bin()[36..72], &merged.bin()[0..36]);
    }

    #[test]
    fn test_merged_bounds_are_normalized() {
        let merged = merged_pair();
        let bounds = merged.bounds();
        assert!(bounds.center().length() < 1e-6);
        assert!((bounds.size() - 1.0).abs() < 1e-4);

        let bytes = merged.to_glb_bytes().unwrap();
        let reparsed = GlbDocument::from_slice(&bytes).unwrap();
        assert!(reparsed.bounds().center().length() < 1e-6);
    }

    #[test]
    fn test_draco_and_extensions() {
        let json = json!({
            "asset": { "version": "2.0" },
            "extensionsUsed": ["KHR_draco_mesh_compression", "KHR_materials_unlit"],
            "extensionsRequired": ["KHR_draco_mesh_compression"],
            "nodes": [{ "mesh": 0 }],
            "meshes": [{ "primitives": [{
                "attributes": { "POSITION": 0 },
                "extensions": { "KHR_draco_mesh_compression": { "bufferView": 0, "attributes": { "POSITION": 0 } } }
            }] }],
            "accessors": [{ "componentType": 5126, "count": 3, "type": "VEC3",
                "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 1.0] }],
            "bufferViews": [{ "buffer": 0, "byteLength": 3 }],
            "buffers": [{ "byteLength": 3 }]
        });
        let doc = || GlbDocument::from_parts(json.clone(), vec![1, 2, 3]).unwrap();
        let scene = SceneNormalizer::default()
            .normalize(vec![
                MeshFragment::new("a", doc()).with_position(DVec3::X * 100.0),
                MeshFragment::new("b", doc()),
            ])
            .unwrap();
        let merged = merge_scene(&scene).unwrap();
        let out = merged.json();

        let draco = &out["meshes"][1]["primitives"][0]["extensions"]["KHR_draco_mesh_compression"];
        assert_eq!(draco["bufferView"], 1);
        // Draco attribute ids are not accessor indices.
        assert_eq!(draco["attributes"]["POSITION"], 0);
        assert_eq!(out["bufferViews"][1]["byteOffset"], 4);
        assert_eq!(
            out["extensionsUsed"],
            json!(["KHR_draco_mesh_compression", "KHR_materials_unlit"])
        );
        assert_eq!(out["extensionsRequired"], json!(["KHR_draco_mesh_compression"]));
        assert_eq!(merged.bin().len(), 8);
    }

    #[test]
    fn test_external_buffers_rejected() {
        let json = json!({
            "asset": { "version": "2.0" },
            "nodes": [{ "mesh": 0 }],
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 } }] }],
            "accessors": [{ "bufferView": 0, "componentType": 5126, "count": 1, "type": "VEC3",
                "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 1.0] }],
            "bufferViews": [{ "buffer": 0, "byteLength": 12 }],
            "buffers": [{ "byteLength": 12, "uri": "data.bin" }]
        });
        let doc = GlbDocument::from_parts(json, Vec::new()).unwrap();
        let scene = SceneNormalizer::default()
            .normalize(vec![MeshFragment::new("x", doc)])
            .unwrap();
        assert!(matches!(merge_scene(&scene), Err(SceneError::Unsupported(_))));
    }
}
