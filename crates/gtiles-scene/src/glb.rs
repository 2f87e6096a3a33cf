//! Binary glTF documents.
//!
//! Tile content is kept as raw glTF JSON plus the BIN chunk. Geometry is never
//! decoded: scene bounds come from the `min`/`max` of each primitive's
//! POSITION accessor, carried through the node hierarchy. That keeps
//! Draco-compressed tiles cheap to place and merge.

use std::borrow::Cow;

use glam::{DMat4, DQuat, DVec3};
use serde_json::Value;

use crate::bounds::Aabb;
use crate::error::{SceneError, SceneResult};
use crate::normalize::FragmentGeometry;

/// Upper bound on node nesting, guards against cyclic hierarchies.
const MAX_NODE_DEPTH: usize = 64;

/// A glTF 2.0 document with its binary buffer.
#[derive(Debug, Clone)]
pub struct GlbDocument {
    json: Value,
    bin: Vec<u8>,
    bounds: Aabb,
}

impl GlbDocument {
    /// Parse a `.glb` container.
    pub fn from_slice(bytes: &[u8]) -> SceneResult<Self> {
        let glb = gltf::binary::Glb::from_slice(bytes)?;
        let json: Value = serde_json::from_slice(&glb.json)?;
        let bin = glb.bin.map(Cow::into_owned).unwrap_or_default();
        Self::from_parts(json, bin)
    }

    /// Build a document from JSON and its BIN chunk, computing scene bounds.
    pub fn from_parts(json: Value, bin: Vec<u8>) -> SceneResult<Self> {
        if !json.is_object() {
            return Err(SceneError::InvalidData {
                context: "gltf",
                detail: "root is not an object".to_string(),
            });
        }
        let bounds = scene_bounds(&json)?;
        Ok(Self { json, bin, bounds })
    }

    #[must_use]
    pub fn json(&self) -> &Value {
        &self.json
    }

    #[must_use]
    pub fn bin(&self) -> &[u8] {
        &self.bin
    }

    /// Bounds of the default scene in its own coordinate frame.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Serialize as a `.glb` container.
    pub fn to_glb_bytes(&self) -> SceneResult<Vec<u8>> {
        let json = serde_json::to_vec(&self.json)?;
        let glb = gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: 0, // to_vec computes this
            },
            json: Cow::Owned(json),
            bin: if self.bin.is_empty() {
                None
            } else {
                Some(Cow::Borrowed(self.bin.as_slice()))
            },
        };
        Ok(glb.to_vec()?)
    }

    /// Serialize as text glTF whose buffer lives in a sidecar file at `bin_uri`.
    ///
    /// Returns the JSON text and the sidecar bytes.
    pub fn to_gltf(&self, bin_uri: &str) -> SceneResult<(String, Vec<u8>)> {
        let mut json = self.json.clone();
        if let Some(buffer) = json
            .get_mut("buffers")
            .and_then(Value::as_array_mut)
            .and_then(|buffers| buffers.first_mut())
            .and_then(Value::as_object_mut)
        {
            buffer.insert("uri".to_string(), Value::from(bin_uri));
        }
        let text = serde_json::to_string_pretty(&json)?;
        Ok((text, self.bin.clone()))
    }
}

impl AsRef<GlbDocument> for GlbDocument {
    fn as_ref(&self) -> &GlbDocument {
        self
    }
}

impl FragmentGeometry for GlbDocument {
    fn local_bounds(&self) -> Aabb {
        self.bounds
    }
}

/// Indices of the root nodes of the default scene.
///
/// Documents without scenes fall back to every node that is nobody's child.
pub(crate) fn root_nodes(json: &Value) -> Vec<usize> {
    let scene = json.get("scene").and_then(Value::as_u64).unwrap_or(0);
    if let Some(nodes) = json
        .get("scenes")
        .and_then(|scenes| scenes.get(index(scene)))
        .and_then(|scene| scene.get("nodes"))
        .and_then(Value::as_array)
    {
        return nodes.iter().filter_map(Value::as_u64).map(index).collect();
    }

    let nodes = array(json, "nodes");
    let mut is_child = vec![false; nodes.len()];
    for node in nodes {
        for child in array(node, "children").iter().filter_map(Value::as_u64) {
            if let Some(flag) = is_child.get_mut(index(child)) {
                *flag = true;
            }
        }
    }
    (0..nodes.len()).filter(|&i| !is_child[i]).collect()
}

/// Local transform of a node, from `matrix` or TRS.
pub(crate) fn node_matrix(node: &Value) -> DMat4 {
    if let Some(m) = floats::<16>(node.get("matrix")) {
        return DMat4::from_cols_array(&m);
    }
    let translation = floats::<3>(node.get("translation")).map_or(DVec3::ZERO, DVec3::from_array);
    let rotation = floats::<4>(node.get("rotation"))
        .map_or(DQuat::IDENTITY, |[x, y, z, w]| DQuat::from_xyzw(x, y, z, w).normalize());
    let scale = floats::<3>(node.get("scale")).map_or(DVec3::ONE, DVec3::from_array);
    DMat4::from_scale_rotation_translation(scale, rotation, translation)
}

fn scene_bounds(json: &Value) -> SceneResult<Aabb> {
    let mut bounds = Aabb::EMPTY;
    for root in root_nodes(json) {
        node_bounds(json, root, DMat4::IDENTITY, 0, &mut bounds)?;
    }
    Ok(bounds)
}

fn node_bounds(
    json: &Value,
    node_index: usize,
    parent: DMat4,
    depth: usize,
    bounds: &mut Aabb,
) -> SceneResult<()> {
    if depth > MAX_NODE_DEPTH {
        return Err(SceneError::InvalidData {
            context: "node hierarchy",
            detail: format!("deeper than {MAX_NODE_DEPTH} levels, possibly cyclic"),
        });
    }
    let node = array(json, "nodes")
        .get(node_index)
        .ok_or_else(|| SceneError::InvalidData {
            context: "node",
            detail: format!("index {node_index} out of range"),
        })?;
    let world = parent * node_matrix(node);

    if let Some(mesh) = node.get("mesh").and_then(Value::as_u64) {
        *bounds = bounds.union(mesh_bounds(json, index(mesh))?.transformed(&world));
    }
    for child in array(node, "children").iter().filter_map(Value::as_u64) {
        node_bounds(json, index(child), world, depth + 1, bounds)?;
    }
    Ok(())
}

fn mesh_bounds(json: &Value, mesh_index: usize) -> SceneResult<Aabb> {
    let mesh = array(json, "meshes")
        .get(mesh_index)
        .ok_or_else(|| SceneError::InvalidData {
            context: "mesh",
            detail: format!("index {mesh_index} out of range"),
        })?;

    let mut bounds = Aabb::EMPTY;
    for primitive in array(mesh, "primitives") {
        let Some(position) = primitive
            .get("attributes")
            .and_then(|attributes| attributes.get("POSITION"))
            .and_then(Value::as_u64)
        else {
            continue;
        };
        let accessor = array(json, "accessors")
            .get(index(position))
            .ok_or_else(|| SceneError::InvalidData {
                context: "accessor",
                detail: format!("index {position} out of range"),
            })?;
        let (Some(min), Some(max)) = (
            floats::<3>(accessor.get("min")),
            floats::<3>(accessor.get("max")),
        ) else {
            return Err(SceneError::InvalidData {
                context: "accessor",
                detail: format!("POSITION accessor {position} has no min/max"),
            });
        };
        bounds = bounds.union(Aabb::new(DVec3::from_array(min), DVec3::from_array(max)));
    }
    Ok(bounds)
}

pub(crate) fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn floats<const N: usize>(value: Option<&Value>) -> Option<[f64; N]> {
    let values = value?.as_array()?;
    if values.len() != N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value.as_f64()?;
    }
    Some(out)
}

#[allow(clippy::cast_possible_truncation)]
fn index(value: u64) -> usize {
    value as usize
}
