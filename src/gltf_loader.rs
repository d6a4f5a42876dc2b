//! glTF 2.0 model loading.
//!
//! Uses the `gltf` crate to parse .glb/.gltf files referenced by the scene
//! manifest and produces the normalized in-memory model the renderer packs
//! into GPU buffers: per primitive a validated 16-bit triangle index stream
//! and interleaved position/normal/uv vertices at a fixed 32-byte stride,
//! per node a local transform and child list, per material the base-color
//! and emissive factors plus texture references, plus decoded RGBA texels.
//!
//! Input violations (non-triangle topology, wrong index width, missing
//! attributes, unsupported texel formats) are fatal: they indicate a
//! malformed asset, and the renderer has no partial-scene mode.

use glam::Mat4;
use log::info;
use std::path::Path;

use crate::error::{Error, Result};
use crate::scene::Vertex;

/// Decoded RGBA8 texel data for one texture.
#[derive(Debug, Clone)]
pub struct TextureImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One triangle primitive: interleaved vertices plus a u16 index stream.
#[derive(Debug)]
pub struct LoadedPrimitive {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    /// Index into the model's material list, if the primitive names one.
    pub material_index: Option<usize>,
}

#[derive(Debug)]
pub struct LoadedMesh {
    pub name: String,
    pub primitives: Vec<LoadedPrimitive>,
}

#[derive(Debug)]
pub struct LoadedNode {
    pub local_transform: Mat4,
    pub mesh_index: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct LoadedMaterial {
    pub base_color_factor: [f32; 3],
    /// Index into the model's image list.
    pub base_color_texture: Option<usize>,
    pub emissive_factor: [f32; 3],
    pub emissive_texture: Option<usize>,
}

/// A whole mesh-interchange file, normalized for upload.
pub struct LoadedModel {
    pub name: String,
    pub meshes: Vec<LoadedMesh>,
    pub nodes: Vec<LoadedNode>,
    pub root_nodes: Vec<usize>,
    pub materials: Vec<LoadedMaterial>,
    pub images: Vec<TextureImage>,
}

/// Interleave position/normal/uv streams into the fixed vertex layout.
///
/// Positions and normals must cover every vertex; UVs are optional and
/// default to zero.
pub fn pack_vertices(
    positions: &[[f32; 3]],
    normals: &[[f32; 3]],
    uvs: Option<&[[f32; 2]]>,
) -> Result<Vec<Vertex>> {
    if normals.len() != positions.len() {
        return Err(Error::Asset(format!(
            "normal stream has {} entries for {} vertices",
            normals.len(),
            positions.len()
        )));
    }
    if let Some(uvs) = uvs {
        if uvs.len() != positions.len() {
            return Err(Error::Asset(format!(
                "uv stream has {} entries for {} vertices",
                uvs.len(),
                positions.len()
            )));
        }
    }

    Ok(positions
        .iter()
        .enumerate()
        .map(|(i, &position)| Vertex {
            position,
            normal: normals[i],
            uv: uvs.map(|uvs| uvs[i]).unwrap_or([0.0, 0.0]),
        })
        .collect())
}

/// Expand tightly packed RGB texels to RGBA with opaque alpha.
///
/// The device-side texture format is 4-channel; 3-channel sources have no
/// natural alignment on the GPU.
pub fn expand_rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for texel in rgb.chunks_exact(3) {
        rgba.extend_from_slice(texel);
        rgba.push(255);
    }
    rgba
}

fn texel_image(data: &gltf::image::Data) -> Result<TextureImage> {
    let pixels = match data.format {
        gltf::image::Format::R8G8B8A8 => data.pixels.clone(),
        gltf::image::Format::R8G8B8 => expand_rgb_to_rgba(&data.pixels),
        other => {
            return Err(Error::Asset(format!(
                "unsupported texel format {:?} ({}x{})",
                other, data.width, data.height
            )))
        }
    };
    Ok(TextureImage {
        pixels,
        width: data.width,
        height: data.height,
    })
}

fn load_primitive(
    prim: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
    mesh_name: &str,
) -> Result<LoadedPrimitive> {
    if prim.mode() != gltf::mesh::Mode::Triangles {
        return Err(Error::Asset(format!(
            "mesh '{}': primitive topology {:?} is not triangles",
            mesh_name,
            prim.mode()
        )));
    }

    let reader = prim.reader(|buffer| Some(&buffers[buffer.index()]));

    let indices: Vec<u16> = match reader.read_indices() {
        Some(gltf::mesh::util::ReadIndices::U16(iter)) => iter.collect(),
        Some(_) => {
            return Err(Error::Asset(format!(
                "mesh '{}': index stream is not 16-bit unsigned",
                mesh_name
            )))
        }
        None => {
            return Err(Error::Asset(format!(
                "mesh '{}': primitive has no index stream",
                mesh_name
            )))
        }
    };

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or_else(|| Error::Asset(format!("mesh '{}': missing positions", mesh_name)))?
        .collect();

    let normals: Vec<[f32; 3]> = reader
        .read_normals()
        .ok_or_else(|| Error::Asset(format!("mesh '{}': missing normals", mesh_name)))?
        .collect();

    let uvs: Option<Vec<[f32; 2]>> = reader
        .read_tex_coords(0)
        .map(|iter| iter.into_f32().collect());

    let vertices = pack_vertices(&positions, &normals, uvs.as_deref())?;

    Ok(LoadedPrimitive {
        vertices,
        indices,
        material_index: prim.material().index(),
    })
}

/// Load a .glb or .gltf file into the normalized model.
pub fn load_model(name: &str, path: &Path) -> Result<LoadedModel> {
    let (document, buffers, images) = gltf::import(path)
        .map_err(|e| Error::Asset(format!("failed to load glTF {:?}: {}", path, e)))?;

    let mut meshes = Vec::new();
    for mesh in document.meshes() {
        let mesh_name = mesh.name().unwrap_or("unnamed").to_string();
        let primitives = mesh
            .primitives()
            .map(|prim| load_primitive(&prim, &buffers, &mesh_name))
            .collect::<Result<Vec<_>>>()?;
        meshes.push(LoadedMesh {
            name: mesh_name,
            primitives,
        });
    }

    let nodes = document
        .nodes()
        .map(|node| LoadedNode {
            local_transform: Mat4::from_cols_array_2d(&node.transform().matrix()),
            mesh_index: node.mesh().map(|m| m.index()),
            children: node.children().map(|c| c.index()).collect(),
        })
        .collect();

    let root_nodes = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .map(|scene| scene.nodes().map(|n| n.index()).collect())
        .unwrap_or_default();

    let materials = document
        .materials()
        .filter(|m| m.index().is_some())
        .map(|mat| {
            let pbr = mat.pbr_metallic_roughness();
            let bc = pbr.base_color_factor();
            LoadedMaterial {
                base_color_factor: [bc[0], bc[1], bc[2]],
                base_color_texture: pbr
                    .base_color_texture()
                    .map(|t| t.texture().source().index()),
                emissive_factor: mat.emissive_factor(),
                emissive_texture: mat
                    .emissive_texture()
                    .map(|t| t.texture().source().index()),
            }
        })
        .collect();

    let images = images
        .iter()
        .map(texel_image)
        .collect::<Result<Vec<_>>>()?;

    let model = LoadedModel {
        name: name.to_string(),
        meshes,
        nodes,
        root_nodes,
        materials,
        images,
    };

    info!(
        "Loaded model '{}' from {:?}: {} meshes, {} nodes, {} materials, {} images",
        model.name,
        path,
        model.meshes.len(),
        model.nodes.len(),
        model.materials.len(),
        model.images.len()
    );

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_expansion_appends_opaque_alpha() {
        let rgb = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(expand_rgb_to_rgba(&rgb), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn pack_vertices_interleaves_and_defaults_uvs() {
        let positions = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let normals = [[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

        let packed = pack_vertices(&positions, &normals, None).unwrap();
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[1].position, [4.0, 5.0, 6.0]);
        assert_eq!(packed[0].normal, [0.0, 1.0, 0.0]);
        assert_eq!(packed[0].uv, [0.0, 0.0]);

        let uvs = [[0.5, 0.5], [1.0, 0.0]];
        let packed = pack_vertices(&positions, &normals, Some(&uvs)).unwrap();
        assert_eq!(packed[1].uv, [1.0, 0.0]);
    }

    #[test]
    fn pack_vertices_rejects_short_normal_stream() {
        let positions = [[0.0; 3], [0.0; 3]];
        let normals = [[0.0; 3]];
        assert!(matches!(
            pack_vertices(&positions, &normals, None),
            Err(Error::Asset(_))
        ));
    }
}
