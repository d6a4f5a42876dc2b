//! Acceleration-structure construction: one BLAS per mesh, one TLAS over
//! the scene-graph instances.
//!
//! The build is strictly sequential per scene load:
//! sizes queried -> storage allocated -> scratch allocated -> BLAS batch
//! built -> barrier -> TLAS built. The two phases of each structure are
//! kept as separate values: a `BlasRequest` holds the validated geometry
//! description and queried sizes, and a `BoundBlas` exists only once the
//! structure's storage is bound, which is also the first point its device
//! address may be fetched. TLAS instance descriptors are composed from
//! `BoundBlas` values, so an unbound address cannot reach them.
//!
//! Scratch memory is shared across builds; that is safe only because every
//! build in the submission is ordered by the barrier between the BLAS batch
//! and the TLAS build, and each BLAS entry owns a disjoint scratch slice.

use ash::vk;
use glam::Mat4;
use log::{debug, info};

use crate::arena::align_up;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::resources::{self, DeviceBuffer};
use crate::scene::{SceneData, VERTEX_STRIDE};
use crate::staging::{self, RegionKind, SceneResources, TLAS_INSTANCE_STRIDE};

/// Acceleration structures must start at a 256-byte offset in their
/// backing buffer.
const STORAGE_ALIGNMENT: u64 = 256;

/// `VK_GEOMETRY_INSTANCE_TRIANGLE_FACING_CULL_DISABLE_BIT_KHR`.
const INSTANCE_CULL_DISABLE: u8 = 0x01;

/// Host-side validated build input for one mesh: the contiguous run of
/// geometry records and the triangle count of each.
#[derive(Debug)]
pub struct MeshBuildInput {
    pub first_geometry: u32,
    pub primitive_counts: Vec<u32>,
}

/// Validate every mesh primitive and derive its triangle count.
///
/// The index width is fixed to u16 by the loader's types; the remaining
/// input invariant is triangle-list topology, i.e. an index count divisible
/// by three. Violations are malformed assets and fatal.
pub fn mesh_build_inputs(scene: &SceneData) -> Result<Vec<MeshBuildInput>> {
    scene
        .meshes
        .iter()
        .map(|mesh| {
            let first = mesh.first_geometry as usize;
            let count = mesh.geometry_count as usize;
            let primitive_counts = scene.geometries[first..first + count]
                .iter()
                .map(|record| {
                    if record.index_count == 0 || record.index_count % 3 != 0 {
                        return Err(Error::Asset(format!(
                            "geometry with index count {} is not a triangle list",
                            record.index_count
                        )));
                    }
                    Ok(record.index_count / 3)
                })
                .collect::<Result<Vec<u32>>>()?;
            Ok(MeshBuildInput {
                first_geometry: mesh.first_geometry,
                primitive_counts,
            })
        })
        .collect()
}

/// Pack `sizes` into one buffer, aligning each entry. Returns the per-entry
/// offsets and the total length.
pub fn pack_offsets(sizes: &[u64], alignment: u64) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut cursor = 0u64;
    for &size in sizes {
        let offset = align_up(cursor, alignment);
        offsets.push(offset);
        cursor = offset + size;
    }
    (offsets, cursor)
}

/// Convert a column-major matrix to the 3x4 row-major layout instance
/// descriptors use.
pub fn transform_matrix(m: Mat4) -> vk::TransformMatrixKHR {
    let c = m.to_cols_array_2d();
    vk::TransformMatrixKHR {
        matrix: [
            c[0][0], c[1][0], c[2][0], c[3][0], // row 0
            c[0][1], c[1][1], c[2][1], c[3][1], // row 1
            c[0][2], c[1][2], c[2][2], c[3][2], // row 2
        ],
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildSizes {
    pub structure: u64,
    pub scratch: u64,
}

/// Stage 1: geometry descriptors plus queried sizes, before any storage
/// exists.
pub struct BlasRequest {
    geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    pub sizes: BuildSizes,
}

/// Stage 2: a created structure bound at its offset into the shared backing
/// buffer. Holding one implies the device address is valid.
#[derive(Debug, Clone, Copy)]
pub struct BoundBlas {
    pub handle: vk::AccelerationStructureKHR,
    pub device_address: u64,
    pub storage_offset: u64,
}

/// Compose the TLAS instance-descriptor blob. One descriptor per scene
/// instance, carrying its 3x4 transform, its index as the custom index, and
/// the bound BLAS address of its mesh.
pub fn instance_blob(scene: &SceneData, blas: &[BoundBlas]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(scene.instances.len() * TLAS_INSTANCE_STRIDE as usize);
    for (index, record) in scene.instances.iter().enumerate() {
        let mesh = scene.instance_meshes[index];
        let instance = vk::AccelerationStructureInstanceKHR {
            transform: transform_matrix(record.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                INSTANCE_CULL_DISABLE,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas[mesh].device_address,
            },
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &instance as *const _ as *const u8,
                TLAS_INSTANCE_STRIDE as usize,
            )
        };
        blob.extend_from_slice(bytes);
    }
    blob
}

/// The built structures and their retained storage.
pub struct AccelerationStructures {
    pub blas: Vec<BoundBlas>,
    pub tlas: vk::AccelerationStructureKHR,
    backing: DeviceBuffer,
    scratch: DeviceBuffer,
}

impl AccelerationStructures {
    /// Run the full build sequence. Requires the scene geometry to already
    /// be device-resident (the upload has been waited on).
    pub fn build(
        ctx: &mut Context,
        scene: &SceneData,
        res: &SceneResources,
    ) -> Result<Self> {
        let inputs = mesh_build_inputs(scene)?;

        let vertex_address = res.vertices.device_address(&ctx.device);
        let index_address = res.indices.device_address(&ctx.device);
        let instance_address = res.tlas_instances.device_address(&ctx.device);

        // --- Sizes queried ---
        let requests: Vec<BlasRequest> = inputs
            .iter()
            .map(|input| blas_request(ctx, scene, input, vertex_address, index_address))
            .collect();

        let instance_count = scene.instances.len() as u32;
        let tlas_geometry = tlas_geometry(instance_address);
        let tlas_sizes = {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&tlas_geometry));
            query_sizes(ctx, &build_info, &[instance_count])
        };

        info!(
            "AS sizes: {} BLAS ({} bytes total), TLAS {} bytes",
            requests.len(),
            requests.iter().map(|r| r.sizes.structure).sum::<u64>(),
            tlas_sizes.structure
        );

        // --- Storage allocated: BLAS entries then the TLAS, one buffer ---
        let structure_sizes: Vec<u64> = requests
            .iter()
            .map(|r| r.sizes.structure)
            .chain(std::iter::once(tlas_sizes.structure))
            .collect();
        let (storage_offsets, storage_total) =
            pack_offsets(&structure_sizes, STORAGE_ALIGNMENT);

        let backing = resources::create_buffer(
            &ctx.device,
            &mut ctx.arenas.buffers,
            storage_total.max(STORAGE_ALIGNMENT),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        // --- Scratch allocated: per-build slices, never retained ---
        let scratch_alignment = ctx
            .accel_properties
            .min_acceleration_structure_scratch_offset_alignment
            as u64;
        let scratch_sizes: Vec<u64> = requests
            .iter()
            .map(|r| r.sizes.scratch)
            .chain(std::iter::once(tlas_sizes.scratch))
            .collect();
        let (scratch_offsets, scratch_total) =
            pack_offsets(&scratch_sizes, scratch_alignment.max(1));

        let scratch = resources::create_buffer(
            &ctx.device,
            &mut ctx.arenas.buffers,
            scratch_total.max(scratch_alignment.max(1)),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        let scratch_address = scratch.device_address(&ctx.device);

        // --- Create and bind every structure; addresses become valid here ---
        let blas: Vec<BoundBlas> = requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                bind_structure(
                    ctx,
                    &backing,
                    storage_offsets[i],
                    request.sizes.structure,
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for entry in &blas {
            debug!(
                "BLAS bound at +{}, device address 0x{:016X}",
                entry.storage_offset, entry.device_address
            );
        }

        let tlas_offset = storage_offsets[requests.len()];
        let tlas_bound = bind_structure(
            ctx,
            &backing,
            tlas_offset,
            tlas_sizes.structure,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        )?;

        // Instance descriptors reference bound BLAS addresses only; the blob
        // takes the staging buffer's second exclusive trip of the load.
        let blob = instance_blob(scene, &blas);
        staging::upload_region(
            ctx,
            res.layout.region(RegionKind::TlasInstances),
            &blob,
            &res.tlas_instances,
            "tlas instance upload",
        )?;

        // --- Record: BLAS batch, barrier, TLAS ---
        let cmd = ctx.begin_one_shot()?;

        let blas_build_infos: Vec<vk::AccelerationStructureBuildGeometryInfoKHR> = requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas[i].handle)
                    .geometries(&request.geometries)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address + scratch_offsets[i],
                    })
            })
            .collect();
        let blas_range_slices: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            requests.iter().map(|r| r.ranges.as_slice()).collect();

        if !blas_build_infos.is_empty() {
            unsafe {
                ctx.accel_loader.cmd_build_acceleration_structures(
                    cmd,
                    &blas_build_infos,
                    &blas_range_slices,
                );
            }
        }

        // BLAS writes must be visible to the TLAS build that reads their
        // device addresses.
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            );
        unsafe {
            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        let tlas_build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(tlas_bound.handle)
            .geometries(std::slice::from_ref(&tlas_geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address + scratch_offsets[requests.len()],
            });
        let tlas_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(instance_count);

        unsafe {
            ctx.accel_loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&tlas_build_info),
                &[std::slice::from_ref(&tlas_range)],
            );
        }

        ctx.submit_and_wait(cmd, "acceleration structure build")?;
        info!(
            "Acceleration structures built: {} BLAS, 1 TLAS over {} instances",
            blas.len(),
            instance_count
        );

        Ok(AccelerationStructures {
            blas,
            tlas: tlas_bound.handle,
            backing,
            scratch,
        })
    }

    pub fn destroy(&mut self, ctx: &mut Context) {
        unsafe {
            for entry in &self.blas {
                ctx.accel_loader
                    .destroy_acceleration_structure(entry.handle, None);
            }
            if self.tlas != vk::AccelerationStructureKHR::null() {
                ctx.accel_loader
                    .destroy_acceleration_structure(self.tlas, None);
                self.tlas = vk::AccelerationStructureKHR::null();
            }
        }
        self.blas.clear();
        self.scratch.destroy(&ctx.device);
        self.backing.destroy(&ctx.device);
    }
}

fn blas_request(
    ctx: &Context,
    scene: &SceneData,
    input: &MeshBuildInput,
    vertex_address: u64,
    index_address: u64,
) -> BlasRequest {
    let first = input.first_geometry as usize;
    let mut geometries = Vec::with_capacity(input.primitive_counts.len());
    let mut ranges = Vec::with_capacity(input.primitive_counts.len());

    for (i, &primitive_count) in input.primitive_counts.iter().enumerate() {
        let record = &scene.geometries[first + i];

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_address + record.vertex_offset as u64 * VERTEX_STRIDE,
            })
            .vertex_stride(VERTEX_STRIDE)
            .max_vertex(record.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT16)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_address + record.index_offset as u64 * 2,
            });

        geometries.push(
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles }),
        );
        ranges.push(
            vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(primitive_count),
        );
    }

    let sizes = {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        query_sizes(ctx, &build_info, &input.primitive_counts)
    };

    BlasRequest {
        geometries,
        ranges,
        sizes,
    }
}

fn tlas_geometry(instance_address: u64) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_address,
        });
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

fn query_sizes(
    ctx: &Context,
    build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
    primitive_counts: &[u32],
) -> BuildSizes {
    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        ctx.accel_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            build_info,
            primitive_counts,
            &mut size_info,
        );
    }
    BuildSizes {
        structure: size_info.acceleration_structure_size,
        scratch: size_info.build_scratch_size,
    }
}

fn bind_structure(
    ctx: &Context,
    backing: &DeviceBuffer,
    offset: u64,
    size: u64,
    ty: vk::AccelerationStructureTypeKHR,
) -> Result<BoundBlas> {
    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(backing.buffer)
        .offset(offset)
        .size(size)
        .ty(ty);

    let handle = unsafe {
        ctx.accel_loader
            .create_acceleration_structure(&create_info, None)
            .map_err(|e| Error::vk("create acceleration structure", e))?
    };

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    let device_address = unsafe {
        ctx.accel_loader
            .get_acceleration_structure_device_address(&address_info)
    };

    Ok(BoundBlas {
        handle,
        device_address,
        storage_offset: offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gltf_loader::{LoadedMesh, LoadedModel, LoadedNode, LoadedPrimitive};
    use crate::scene::{SceneManifest, Vertex};

    fn model_with_indices(indices: Vec<u16>) -> LoadedModel {
        let vertices = (0..6)
            .map(|i| Vertex {
                position: [i as f32, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
            })
            .collect();
        LoadedModel {
            name: "test".to_string(),
            meshes: vec![LoadedMesh {
                name: "mesh".to_string(),
                primitives: vec![LoadedPrimitive {
                    vertices,
                    indices,
                    material_index: None,
                }],
            }],
            nodes: vec![LoadedNode {
                local_transform: Mat4::IDENTITY,
                mesh_index: Some(0),
                children: Vec::new(),
            }],
            root_nodes: vec![0],
            materials: Vec::new(),
            images: Vec::new(),
        }
    }

    #[test]
    fn one_mesh_yields_one_build_input() {
        let model = model_with_indices(vec![0, 1, 2, 3, 4, 5]);
        let scene = SceneData::assemble(&SceneManifest::default(), &[model]);

        let inputs = mesh_build_inputs(&scene).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].first_geometry, 0);
        assert_eq!(inputs[0].primitive_counts, vec![2]);
    }

    #[test]
    fn non_triangle_index_count_is_fatal() {
        let model = model_with_indices(vec![0, 1, 2, 3]);
        let scene = SceneData::assemble(&SceneManifest::default(), &[model]);
        assert!(matches!(
            mesh_build_inputs(&scene),
            Err(Error::Asset(_))
        ));
    }

    #[test]
    fn pack_offsets_aligns_each_entry() {
        let (offsets, total) = pack_offsets(&[100, 30, 1], 128);
        assert_eq!(offsets, vec![0, 128, 256]);
        assert_eq!(total, 257);

        let (offsets, total) = pack_offsets(&[], 128);
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn transform_matrix_is_row_major_3x4() {
        let m = Mat4::from_translation(glam::Vec3::new(7.0, 8.0, 9.0));
        let t = transform_matrix(m);
        // Identity rotation rows with translation in the last column.
        assert_eq!(t.matrix[0], 1.0);
        assert_eq!(t.matrix[3], 7.0);
        assert_eq!(t.matrix[5], 1.0);
        assert_eq!(t.matrix[7], 8.0);
        assert_eq!(t.matrix[10], 1.0);
        assert_eq!(t.matrix[11], 9.0);
    }

    #[test]
    fn instance_blob_carries_bound_addresses() {
        let model = model_with_indices(vec![0, 1, 2, 3, 4, 5]);
        let scene = SceneData::assemble(&SceneManifest::default(), &[model]);

        // Instance descriptors can only be built from bound structures; the
        // test stands one up with a known address.
        let blas = [BoundBlas {
            handle: vk::AccelerationStructureKHR::null(),
            device_address: 0x1122_3344_5566_7788,
            storage_offset: 0,
        }];

        let blob = instance_blob(&scene, &blas);
        assert_eq!(blob.len(), TLAS_INSTANCE_STRIDE as usize);

        // 3x4 transform occupies the first 48 bytes; identity diagonal.
        let floats: &[f32] = bytemuck::cast_slice(&blob[0..48]);
        assert_eq!(floats[0], 1.0);
        assert_eq!(floats[5], 1.0);
        assert_eq!(floats[10], 1.0);

        // The BLAS address lands in the final 8 bytes.
        let addr = u64::from_le_bytes(blob[56..64].try_into().unwrap());
        assert_eq!(addr, 0x1122_3344_5566_7788);
    }

    #[test]
    fn empty_scene_builds_no_blas_inputs() {
        let scene = SceneData::assemble(&SceneManifest::default(), &[]);
        assert!(mesh_build_inputs(&scene).unwrap().is_empty());
        assert!(instance_blob(&scene, &[]).is_empty());
    }
}
