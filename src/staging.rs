//! Staging upload orchestration.
//!
//! Device-local memory on a discrete GPU is not host-addressable, so every
//! scene byte takes one hop through the shared host-visible staging buffer.
//! The layout of that buffer is computed up front as a list of region
//! descriptors, one per heterogeneous sub-region, each aligned to 16 bytes;
//! the total must fit the staging capacity before any byte is copied. The
//! fill pass then writes each region through the persistent mapping, and a
//! single one-shot command buffer issues one copy per region into the final
//! device-local destinations.
//!
//! The TLAS instance region is reserved here but filled by the
//! acceleration-structure phase, which is the first point where BLAS device
//! addresses exist; it is the staging buffer's second, equally exclusive,
//! use of the scene load.

use ash::vk;
use bytemuck::Zeroable;
use log::info;

use crate::arena::align_up;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::gltf_loader::TextureImage;
use crate::resources::{self, DeviceBuffer, DeviceImage};
use crate::scene::{
    GeometryRecord, InstanceRecord, LightRecord, MaterialRecord, SceneData, Vertex,
};

/// Alignment between heterogeneous sub-regions. Texel images carry no
/// natural alignment guarantee of their own, so everything gets this.
pub const SUBREGION_ALIGNMENT: u64 = 16;

/// Size of one `vk::AccelerationStructureInstanceKHR`.
pub const TLAS_INSTANCE_STRIDE: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Vertices,
    Indices,
    Geometries,
    Materials,
    Instances,
    Lights,
    TlasInstances,
    Image(usize),
}

/// One sub-region of the staging buffer.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub kind: RegionKind,
    pub offset: u64,
    pub len: u64,
}

/// Byte length of every sub-region, before placement.
#[derive(Debug, Clone)]
pub struct UploadSizes {
    pub vertices: u64,
    pub indices: u64,
    pub geometries: u64,
    pub materials: u64,
    pub instances: u64,
    pub lights: u64,
    pub tlas_instances: u64,
    pub images: Vec<u64>,
}

impl UploadSizes {
    pub fn of(scene: &SceneData) -> Self {
        let images = if scene.images.is_empty() {
            // A fallback 1x1 texture keeps the sampled-image descriptors
            // valid for scenes with no textures.
            vec![4]
        } else {
            scene
                .images
                .iter()
                .map(|img| img.pixels.len() as u64)
                .collect()
        };
        UploadSizes {
            vertices: (scene.vertices.len() * std::mem::size_of::<Vertex>()) as u64,
            indices: (scene.indices.len() * std::mem::size_of::<u16>()) as u64,
            geometries: (scene.geometries.len() * std::mem::size_of::<GeometryRecord>()) as u64,
            materials: (scene.materials.len() * std::mem::size_of::<MaterialRecord>()) as u64,
            instances: (scene.instances.len() * std::mem::size_of::<InstanceRecord>()) as u64,
            lights: (scene.lights.len().max(1) * std::mem::size_of::<LightRecord>()) as u64,
            tlas_instances: scene.instances.len() as u64 * TLAS_INSTANCE_STRIDE,
            images,
        }
    }
}

/// The computed placement of every sub-region inside the staging buffer.
#[derive(Debug)]
pub struct UploadLayout {
    regions: Vec<Region>,
    total_size: u64,
}

impl UploadLayout {
    pub fn compute(sizes: &UploadSizes) -> Self {
        let mut regions = Vec::new();
        let mut cursor = 0u64;

        let mut push = |kind: RegionKind, len: u64, cursor: &mut u64| {
            let offset = align_up(*cursor, SUBREGION_ALIGNMENT);
            regions.push(Region { kind, offset, len });
            *cursor = offset + len;
        };

        push(RegionKind::Vertices, sizes.vertices, &mut cursor);
        push(RegionKind::Indices, sizes.indices, &mut cursor);
        push(RegionKind::Geometries, sizes.geometries, &mut cursor);
        push(RegionKind::Materials, sizes.materials, &mut cursor);
        push(RegionKind::Instances, sizes.instances, &mut cursor);
        push(RegionKind::Lights, sizes.lights, &mut cursor);
        push(RegionKind::TlasInstances, sizes.tlas_instances, &mut cursor);
        for (i, &len) in sizes.images.iter().enumerate() {
            push(RegionKind::Image(i), len, &mut cursor);
        }

        UploadLayout {
            regions,
            total_size: cursor,
        }
    }

    /// Assert the layout fits `capacity`. Checked before any copy.
    pub fn checked(self, capacity: u64) -> Result<Self> {
        if self.total_size > capacity {
            return Err(Error::StagingOverflow {
                needed: self.total_size,
                capacity,
            });
        }
        Ok(self)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        *self
            .regions
            .iter()
            .find(|r| r.kind == kind)
            .expect("upload layout is missing a region")
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

/// The device-resident scene: all record buffers, the texel images, and the
/// buffer the TLAS build reads its instance descriptors from.
pub struct SceneResources {
    pub vertices: DeviceBuffer,
    pub indices: DeviceBuffer,
    pub geometries: DeviceBuffer,
    pub materials: DeviceBuffer,
    pub instances: DeviceBuffer,
    pub lights: DeviceBuffer,
    pub tlas_instances: DeviceBuffer,
    pub textures: Vec<DeviceImage>,
    pub sampler: vk::Sampler,
    pub layout: UploadLayout,
}

impl SceneResources {
    /// Create every device-local destination, fill the staging buffer, and
    /// run the copy submission to completion. On return the geometry is
    /// device-resident and acceleration-structure builds may reference it.
    pub fn create_and_upload(ctx: &mut Context, scene: &SceneData) -> Result<Self> {
        let sizes = UploadSizes::of(scene);
        let layout = UploadLayout::compute(&sizes).checked(ctx.staging.capacity())?;
        info!(
            "Scene upload: {} bytes across {} regions",
            layout.total_size(),
            layout.regions().len()
        );

        let device = ctx.device.clone();
        let arena = &mut ctx.arenas.buffers;

        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let record_usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;

        let buffer_for = |arena: &mut crate::arena::MemoryArena,
                          region: Region,
                          usage: vk::BufferUsageFlags|
         -> Result<DeviceBuffer> {
            resources::create_buffer(&device, arena, region.len.max(SUBREGION_ALIGNMENT), usage)
        };

        let vertices = buffer_for(arena, layout.region(RegionKind::Vertices), geometry_usage)?;
        let indices = buffer_for(arena, layout.region(RegionKind::Indices), geometry_usage)?;
        let geometries = buffer_for(arena, layout.region(RegionKind::Geometries), record_usage)?;
        let materials = buffer_for(arena, layout.region(RegionKind::Materials), record_usage)?;
        let instances = buffer_for(arena, layout.region(RegionKind::Instances), record_usage)?;
        let lights = buffer_for(arena, layout.region(RegionKind::Lights), record_usage)?;
        let tlas_instances = buffer_for(
            arena,
            layout.region(RegionKind::TlasInstances),
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;

        let fallback_image = TextureImage {
            pixels: vec![255, 255, 255, 255],
            width: 1,
            height: 1,
        };
        let upload_images: Vec<&TextureImage> = if scene.images.is_empty() {
            vec![&fallback_image]
        } else {
            scene.images.iter().collect()
        };

        let mut textures = Vec::with_capacity(upload_images.len());
        for img in &upload_images {
            textures.push(resources::create_image_2d_with_view(
                &device,
                &mut ctx.arenas.textures,
                img.width,
                img.height,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            )?);
        }

        let sampler = resources::create_linear_sampler(&device)?;

        // --- Fill pass: one memcpy per region through the mapping. ---
        let fill = |staging: &mut crate::context::Staging, region: Region, bytes: &[u8]| {
            debug_assert_eq!(bytes.len() as u64, region.len);
            if !bytes.is_empty() {
                staging
                    .mapped_slice_mut(region.offset, region.len)
                    .copy_from_slice(bytes);
            }
        };

        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Vertices),
            bytemuck::cast_slice(&scene.vertices),
        );
        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Indices),
            bytemuck::cast_slice(&scene.indices),
        );
        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Geometries),
            bytemuck::cast_slice(&scene.geometries),
        );
        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Materials),
            bytemuck::cast_slice(&scene.materials),
        );
        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Instances),
            bytemuck::cast_slice(&scene.instances),
        );
        let zero_light = [LightRecord::zeroed()];
        let light_records: &[LightRecord] = if scene.lights.is_empty() {
            &zero_light
        } else {
            &scene.lights
        };
        fill(
            &mut ctx.staging,
            layout.region(RegionKind::Lights),
            bytemuck::cast_slice(light_records),
        );
        for (i, img) in upload_images.iter().enumerate() {
            fill(
                &mut ctx.staging,
                layout.region(RegionKind::Image(i)),
                &img.pixels,
            );
        }

        // --- Copy pass: one command buffer, one copy per region. ---
        let cmd = ctx.begin_one_shot()?;

        let copy_buffer = |region: Region, dst: &DeviceBuffer| {
            if region.len == 0 {
                return;
            }
            let copy = vk::BufferCopy {
                src_offset: region.offset,
                dst_offset: 0,
                size: region.len,
            };
            unsafe { device.cmd_copy_buffer(cmd, ctx.staging.buffer, dst.buffer, &[copy]) };
        };

        copy_buffer(layout.region(RegionKind::Vertices), &vertices);
        copy_buffer(layout.region(RegionKind::Indices), &indices);
        copy_buffer(layout.region(RegionKind::Geometries), &geometries);
        copy_buffer(layout.region(RegionKind::Materials), &materials);
        copy_buffer(layout.region(RegionKind::Instances), &instances);
        copy_buffer(layout.region(RegionKind::Lights), &lights);

        for (i, texture) in textures.iter().enumerate() {
            let region = layout.region(RegionKind::Image(i));
            resources::cmd_transition_image(
                &device,
                cmd,
                texture.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            );
            let copy = vk::BufferImageCopy::default()
                .buffer_offset(region.offset)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: texture.extent.width,
                    height: texture.extent.height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    ctx.staging.buffer,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                );
            }
            resources::cmd_transition_image(
                &device,
                cmd,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
            );
        }

        ctx.submit_and_wait(cmd, "scene upload")?;
        info!("Scene upload complete");

        Ok(SceneResources {
            vertices,
            indices,
            geometries,
            materials,
            instances,
            lights,
            tlas_instances,
            textures,
            sampler,
            layout,
        })
    }

    pub fn destroy(&mut self, ctx: &mut Context) {
        let device = ctx.device.clone();
        unsafe { device.destroy_sampler(self.sampler, None) };
        for texture in &mut self.textures {
            texture.destroy(&device);
        }
        self.vertices.destroy(&device);
        self.indices.destroy(&device);
        self.geometries.destroy(&device);
        self.materials.destroy(&device);
        self.instances.destroy(&device);
        self.lights.destroy(&device);
        self.tlas_instances.destroy(&device);
    }
}

/// Stage `bytes` at `region` and copy them into `dst` at offset zero,
/// blocking until the copy retires. Used for the TLAS instance blob, whose
/// region is reserved in the upload layout but fillable only once BLAS
/// addresses exist.
pub fn upload_region(
    ctx: &mut Context,
    region: Region,
    bytes: &[u8],
    dst: &DeviceBuffer,
    what: &'static str,
) -> Result<()> {
    debug_assert!(bytes.len() as u64 <= region.len);
    upload_at(ctx, region.offset, bytes, dst, what)
}

/// Stage `bytes` at the start of the staging buffer and copy them into
/// `dst`, blocking until the copy retires. Each call is its own exclusive
/// use of the staging buffer (the shader-binding table upload).
pub fn upload_bytes(
    ctx: &mut Context,
    bytes: &[u8],
    dst: &DeviceBuffer,
    what: &'static str,
) -> Result<()> {
    if bytes.len() as u64 > ctx.staging.capacity() {
        return Err(Error::StagingOverflow {
            needed: bytes.len() as u64,
            capacity: ctx.staging.capacity(),
        });
    }
    upload_at(ctx, 0, bytes, dst, what)
}

/// Stage raw texels at the start of the staging buffer and copy them into
/// `image`, leaving it SHADER_READ_ONLY_OPTIMAL. Used for the overlay
/// collaborator's font atlas.
pub fn upload_texture(
    ctx: &mut Context,
    image: &DeviceImage,
    pixels: &[u8],
    what: &'static str,
) -> Result<()> {
    if pixels.len() as u64 > ctx.staging.capacity() {
        return Err(Error::StagingOverflow {
            needed: pixels.len() as u64,
            capacity: ctx.staging.capacity(),
        });
    }
    ctx.staging
        .mapped_slice_mut(0, pixels.len() as u64)
        .copy_from_slice(pixels);

    let device = ctx.device.clone();
    let cmd = ctx.begin_one_shot()?;
    resources::cmd_transition_image(
        &device,
        cmd,
        image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::TRANSFER,
    );
    let copy = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: image.extent.width,
            height: image.extent.height,
            depth: 1,
        });
    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            ctx.staging.buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy],
        );
    }
    resources::cmd_transition_image(
        &device,
        cmd,
        image.image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::SHADER_READ,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::ALL_COMMANDS,
    );
    ctx.submit_and_wait(cmd, what)
}

fn upload_at(
    ctx: &mut Context,
    offset: u64,
    bytes: &[u8],
    dst: &DeviceBuffer,
    what: &'static str,
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    ctx.staging
        .mapped_slice_mut(offset, bytes.len() as u64)
        .copy_from_slice(bytes);

    let cmd = ctx.begin_one_shot()?;
    let copy = vk::BufferCopy {
        src_offset: offset,
        dst_offset: 0,
        size: bytes.len() as u64,
    };
    unsafe {
        ctx.device
            .cmd_copy_buffer(cmd, ctx.staging.buffer, dst.buffer, &[copy])
    };
    ctx.submit_and_wait(cmd, what)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> UploadSizes {
        UploadSizes {
            vertices: 100,
            indices: 33,
            geometries: 32,
            materials: 7,
            instances: 144,
            lights: 32,
            tlas_instances: 64,
            images: vec![12, 4096, 1],
        }
    }

    #[test]
    fn regions_are_aligned_and_disjoint() {
        let layout = UploadLayout::compute(&sizes());

        for region in layout.regions() {
            assert_eq!(region.offset % SUBREGION_ALIGNMENT, 0, "{:?}", region.kind);
        }

        let regions = layout.regions();
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(
                    a.offset + a.len <= b.offset || b.offset + b.len <= a.offset,
                    "{:?} overlaps {:?}",
                    a.kind,
                    b.kind
                );
            }
        }

        let last = regions.last().unwrap();
        assert_eq!(layout.total_size(), last.offset + last.len);
    }

    #[test]
    fn image_regions_start_at_16_bytes() {
        let layout = UploadLayout::compute(&sizes());
        for (i, _) in sizes().images.iter().enumerate() {
            assert_eq!(layout.region(RegionKind::Image(i)).offset % 16, 0);
        }
        // The odd-sized image does not disturb its successor's alignment.
        let img1 = layout.region(RegionKind::Image(1));
        let img0 = layout.region(RegionKind::Image(0));
        assert!(img1.offset >= img0.offset + img0.len);
    }

    #[test]
    fn exact_capacity_passes_and_one_less_fails() {
        let layout = UploadLayout::compute(&sizes());
        let needed = layout.total_size();

        assert!(UploadLayout::compute(&sizes()).checked(needed).is_ok());

        let err = UploadLayout::compute(&sizes())
            .checked(needed - 1)
            .unwrap_err();
        match err {
            Error::StagingOverflow { needed: n, capacity } => {
                assert_eq!(n, needed);
                assert_eq!(capacity, needed - 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn zero_length_regions_are_placed_without_collision() {
        let layout = UploadLayout::compute(&UploadSizes {
            vertices: 0,
            indices: 0,
            geometries: 0,
            materials: 0,
            instances: 0,
            lights: 32,
            tlas_instances: 0,
            images: vec![4],
        });
        assert_eq!(layout.region(RegionKind::Vertices).len, 0);
        assert_eq!(layout.region(RegionKind::Lights).offset, 0);
        // Lights end at 32; the image lands right there (already aligned).
        assert_eq!(layout.region(RegionKind::Image(0)).offset, 32);
        assert_eq!(layout.total_size(), 36);
    }

    #[test]
    fn layout_matches_scene_byte_counts() {
        use crate::scene::{SceneData, SceneManifest};

        let data = SceneData::assemble(&SceneManifest::default(), &[]);
        let sizes = UploadSizes::of(&data);
        // Empty scene still reserves one light record and one fallback image.
        assert_eq!(sizes.lights, 32);
        assert_eq!(sizes.images, vec![4]);
        assert_eq!(sizes.vertices, 0);
        assert_eq!(sizes.tlas_instances, 0);
    }
}
