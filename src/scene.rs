//! Scene model: the JSON manifest, the GPU record types, and the assembly
//! of every loaded model into the flat streams the upload path consumes.
//!
//! All models share single vertex/index buffers; a `GeometryRecord` locates
//! each primitive's slice inside them, and an `InstanceRecord` ties a
//! scene-graph node's accumulated transform to the contiguous run of
//! geometry records its mesh owns.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::gltf_loader::{LoadedModel, TextureImage};

/// Sentinel material texture index meaning "no texture".
pub const NO_TEXTURE: u32 = u32::MAX;

/// Interleaved vertex, fixed 32-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

pub const VERTEX_STRIDE: u64 = std::mem::size_of::<Vertex>() as u64;

/// Locates one primitive inside the shared vertex/index buffers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GeometryRecord {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
    pub material_index: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color_factor: [f32; 3],
    pub base_color_texture: u32,
    pub emissive_factor: [f32; 3],
    pub emissive_texture: u32,
}

/// One scene-graph node that references a mesh: its accumulated transform,
/// the inverse-transpose for normal correction, and the geometry run.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: Mat4,
    pub inverse_transpose: Mat4,
    pub geometry_offset: u32,
    pub geometry_count: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LightRecord {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub color: [f32; 3],
    pub _pad1: f32,
}

/// The contiguous run of geometry records one mesh owns.
#[derive(Clone, Copy, Debug)]
pub struct MeshGeometry {
    pub first_geometry: u32,
    pub geometry_count: u32,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ManifestCamera {
    pub position: [f32; 3],
    pub view: [f32; 3],
}

#[derive(Debug, Deserialize)]
pub struct ManifestModel {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ManifestLight {
    #[serde(rename = "type")]
    pub kind: String,
    pub position: [f32; 3],
    pub color: [f32; 3],
}

/// The JSON scene description: camera, model references, point lights.
#[derive(Debug, Default, Deserialize)]
pub struct SceneManifest {
    pub camera: Option<ManifestCamera>,
    #[serde(default)]
    pub models: Vec<ManifestModel>,
    #[serde(default)]
    pub lights: Vec<ManifestLight>,
}

impl SceneManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Model file paths, resolved relative to the manifest's directory.
    pub fn model_paths(&self, manifest_path: &Path) -> Vec<(String, PathBuf)> {
        let parent = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        self.models
            .iter()
            .map(|m| (m.name.clone(), parent.join(&m.path)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Everything the upload and build phases consume, flattened across models.
pub struct SceneData {
    pub camera: Camera,
    pub lights: Vec<LightRecord>,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    pub geometries: Vec<GeometryRecord>,
    pub materials: Vec<MaterialRecord>,
    pub instances: Vec<InstanceRecord>,
    /// Mesh index for each instance, parallel to `instances`.
    pub instance_meshes: Vec<usize>,
    pub images: Vec<TextureImage>,
    /// Per mesh, across all models in load order.
    pub meshes: Vec<MeshGeometry>,
}

impl SceneData {
    pub fn assemble(manifest: &SceneManifest, models: &[LoadedModel]) -> Self {
        let camera = manifest
            .camera
            .as_ref()
            .map(|c| Camera {
                position: Vec3::from_array(c.position),
                view: Vec3::from_array(c.view),
            })
            .unwrap_or_default();

        let lights: Vec<LightRecord> = manifest
            .lights
            .iter()
            .filter(|l| l.kind == "point")
            .map(|l| LightRecord {
                position: l.position,
                _pad0: 0.0,
                color: l.color,
                _pad1: 0.0,
            })
            .collect();

        let mut data = SceneData {
            camera,
            lights,
            vertices: Vec::new(),
            indices: Vec::new(),
            geometries: Vec::new(),
            materials: Vec::new(),
            instances: Vec::new(),
            instance_meshes: Vec::new(),
            images: Vec::new(),
            meshes: Vec::new(),
        };

        for model in models {
            data.append_model(model);
        }
        data
    }

    fn append_model(&mut self, model: &LoadedModel) {
        let image_base = self.images.len() as u32;
        let material_base = self.materials.len() as u32;
        let mesh_base = self.meshes.len();

        let remap_texture =
            |idx: Option<usize>| idx.map(|i| image_base + i as u32).unwrap_or(NO_TEXTURE);

        for material in &model.materials {
            self.materials.push(MaterialRecord {
                base_color_factor: material.base_color_factor,
                base_color_texture: remap_texture(material.base_color_texture),
                emissive_factor: material.emissive_factor,
                emissive_texture: remap_texture(material.emissive_texture),
            });
        }
        // Fallback for primitives that name no material.
        let default_material = self.materials.len() as u32;
        self.materials.push(MaterialRecord {
            base_color_factor: [1.0, 1.0, 1.0],
            base_color_texture: NO_TEXTURE,
            emissive_factor: [0.0, 0.0, 0.0],
            emissive_texture: NO_TEXTURE,
        });

        for mesh in &model.meshes {
            let first_geometry = self.geometries.len() as u32;
            for primitive in &mesh.primitives {
                let record = GeometryRecord {
                    vertex_offset: self.vertices.len() as u32,
                    vertex_count: primitive.vertices.len() as u32,
                    index_offset: self.indices.len() as u32,
                    index_count: primitive.indices.len() as u32,
                    material_index: primitive
                        .material_index
                        .map(|i| material_base + i as u32)
                        .unwrap_or(default_material),
                    _pad: [0; 3],
                };
                self.vertices.extend_from_slice(&primitive.vertices);
                self.indices.extend_from_slice(&primitive.indices);
                self.geometries.push(record);
            }
            self.meshes.push(MeshGeometry {
                first_geometry,
                geometry_count: (self.geometries.len() as u32) - first_geometry,
            });
        }

        self.images.extend(model.images.iter().cloned());

        for (mesh_index, world) in collect_mesh_instances(model) {
            let mesh = &self.meshes[mesh_base + mesh_index];
            self.instances.push(InstanceRecord {
                transform: world,
                inverse_transpose: world.inverse().transpose(),
                geometry_offset: mesh.first_geometry,
                geometry_count: mesh.geometry_count,
                _pad: [0; 2],
            });
            self.instance_meshes.push(mesh_base + mesh_index);
        }
    }
}

/// Depth-first traversal of the node hierarchy, accumulating parent
/// transforms. Yields `(mesh_index, world_transform)` for every node that
/// references a mesh.
pub fn collect_mesh_instances(model: &LoadedModel) -> Vec<(usize, Mat4)> {
    fn traverse(
        model: &LoadedModel,
        node_index: usize,
        parent_world: Mat4,
        out: &mut Vec<(usize, Mat4)>,
    ) {
        let node = &model.nodes[node_index];
        let world = parent_world * node.local_transform;
        if let Some(mesh_index) = node.mesh_index {
            out.push((mesh_index, world));
        }
        for &child in &node.children {
            traverse(model, child, world, out);
        }
    }

    let mut out = Vec::new();
    for &root in &model.root_nodes {
        traverse(model, root, Mat4::IDENTITY, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gltf_loader::{LoadedMesh, LoadedNode, LoadedPrimitive};
    use glam::Quat;

    fn quad_primitive() -> LoadedPrimitive {
        let vertices = (0..6)
            .map(|i| Vertex {
                position: [i as f32, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
            })
            .collect();
        LoadedPrimitive {
            vertices,
            indices: vec![0, 1, 2, 3, 4, 5],
            material_index: None,
        }
    }

    fn one_mesh_model(nodes: Vec<LoadedNode>, root_nodes: Vec<usize>) -> LoadedModel {
        LoadedModel {
            name: "test".to_string(),
            meshes: vec![LoadedMesh {
                name: "quad".to_string(),
                primitives: vec![quad_primitive()],
            }],
            nodes,
            root_nodes,
            materials: Vec::new(),
            images: Vec::new(),
        }
    }

    #[test]
    fn manifest_parses_camera_models_lights() {
        let manifest = SceneManifest::parse(
            r#"{
                "camera": { "position": [0, 1, 5], "view": [0, 0, -1] },
                "models": [ { "name": "box", "path": "box.glb" } ],
                "lights": [
                    { "type": "point", "position": [1, 2, 3], "color": [1, 1, 1] },
                    { "type": "spot", "position": [0, 0, 0], "color": [1, 0, 0] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.models[0].path, "box.glb");

        let data = SceneData::assemble(&manifest, &[]);
        assert_eq!(data.camera.position, Vec3::new(0.0, 1.0, 5.0));
        // Non-point lights are skipped.
        assert_eq!(data.lights.len(), 1);
        assert_eq!(data.lights[0].position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn manifest_defaults_when_camera_missing() {
        let manifest = SceneManifest::parse("{}").unwrap();
        let data = SceneData::assemble(&manifest, &[]);
        assert_eq!(data.camera.position, Vec3::new(0.0, 0.0, 10.0));
        assert_eq!(data.camera.view, Vec3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn one_mesh_two_triangle_scene() {
        let model = one_mesh_model(
            vec![LoadedNode {
                local_transform: Mat4::IDENTITY,
                mesh_index: Some(0),
                children: Vec::new(),
            }],
            vec![0],
        );
        let data = SceneData::assemble(&SceneManifest::default(), &[model]);

        assert_eq!(data.geometries.len(), 1);
        assert_eq!(data.geometries[0].vertex_offset, 0);
        assert_eq!(data.geometries[0].index_offset, 0);
        assert_eq!(data.geometries[0].vertex_count, 6);
        assert_eq!(data.geometries[0].index_count, 6);

        assert_eq!(data.instances.len(), 1);
        assert_eq!(data.instances[0].transform, Mat4::IDENTITY);
        assert_eq!(data.instances[0].geometry_offset, 0);
        assert_eq!(data.instances[0].geometry_count, 1);

        assert_eq!(data.meshes.len(), 1);
        assert_eq!(data.vertices.len(), 6);
        assert_eq!(data.indices.len(), 6);
    }

    #[test]
    fn instance_transforms_accumulate_depth_first() {
        let parent = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        let child = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 2.0, 2.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            Vec3::new(0.0, 3.0, 0.0),
        );

        let model = one_mesh_model(
            vec![
                LoadedNode {
                    local_transform: parent,
                    mesh_index: None,
                    children: vec![1],
                },
                LoadedNode {
                    local_transform: child,
                    mesh_index: Some(0),
                    children: Vec::new(),
                },
            ],
            vec![0],
        );

        let instances = collect_mesh_instances(&model);
        assert_eq!(instances.len(), 1);
        let expected = parent * child;
        assert!(instances[0].1.abs_diff_eq(expected, 1e-6));

        let data = SceneData::assemble(&SceneManifest::default(), &[model]);
        let expected_it = expected.inverse().transpose();
        assert!(data.instances[0]
            .inverse_transpose
            .abs_diff_eq(expected_it, 1e-6));
    }

    #[test]
    fn second_model_offsets_are_remapped() {
        let model_a = one_mesh_model(
            vec![LoadedNode {
                local_transform: Mat4::IDENTITY,
                mesh_index: Some(0),
                children: Vec::new(),
            }],
            vec![0],
        );
        let model_b = one_mesh_model(
            vec![LoadedNode {
                local_transform: Mat4::from_translation(Vec3::X),
                mesh_index: Some(0),
                children: Vec::new(),
            }],
            vec![0],
        );

        let data = SceneData::assemble(&SceneManifest::default(), &[model_a, model_b]);
        assert_eq!(data.geometries.len(), 2);
        assert_eq!(data.geometries[1].vertex_offset, 6);
        assert_eq!(data.geometries[1].index_offset, 6);
        assert_eq!(data.instances[1].geometry_offset, 1);
        // Each model contributes its own fallback material.
        assert_eq!(data.geometries[0].material_index, 0);
        assert_eq!(data.geometries[1].material_index, 1);
    }

    #[test]
    fn record_sizes_match_shader_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::size_of::<GeometryRecord>(), 32);
        assert_eq!(std::mem::size_of::<MaterialRecord>(), 32);
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 144);
        assert_eq!(std::mem::size_of::<LightRecord>(), 32);
    }

    #[test]
    fn vertex_record_is_tightly_packed() {
        let v = Vertex {
            position: [1.0, 2.0, 3.0],
            normal: [4.0, 5.0, 6.0],
            uv: [7.0, 8.0],
        };
        let bytes: &[u8] = bytemuck::bytes_of(&v);
        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}
