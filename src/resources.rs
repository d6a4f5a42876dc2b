//! Resource factory: buffers and images bound into linear arenas.
//!
//! Every creation call queries the resource's memory requirements, aligns
//! the owning arena's offset to them, binds the resource at the reserved
//! offset, and advances the arena. Resources created against one arena
//! therefore occupy pairwise disjoint byte ranges by construction.

use ash::vk;

use crate::arena::MemoryArena;
use crate::error::{Error, Result};

/// A buffer handle plus its bound range inside an arena.
#[derive(Debug, Clone, Copy)]
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl DeviceBuffer {
    pub fn destroy(&mut self, device: &ash::Device) {
        if self.buffer != vk::Buffer::null() {
            unsafe { device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
    }

    pub fn device_address(&self, device: &ash::Device) -> u64 {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }
}

/// An image handle, its view, and its bound range inside an arena.
#[derive(Debug, Clone, Copy)]
pub struct DeviceImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub offset: u64,
}

impl DeviceImage {
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }
    }
}

/// Create a buffer and bind it at the next aligned offset of `arena`.
pub fn create_buffer(
    device: &ash::Device,
    arena: &mut MemoryArena,
    size: u64,
    usage: vk::BufferUsageFlags,
) -> Result<DeviceBuffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device
            .create_buffer(&buffer_info, None)
            .map_err(|e| Error::vk("create buffer", e))?
    };

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let offset = match arena.alloc(requirements.size, requirements.alignment) {
        Ok(offset) => offset,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    unsafe {
        device
            .bind_buffer_memory(buffer, arena.memory(), offset)
            .map_err(|e| Error::vk("bind buffer memory", e))?;
    }

    Ok(DeviceBuffer {
        buffer,
        offset,
        size,
    })
}

/// Create a 2D image (optimal tiling, one mip, one layer) bound into `arena`.
pub fn create_image_2d(
    device: &ash::Device,
    arena: &mut MemoryArena,
    width: u32,
    height: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<DeviceImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(|e| Error::vk("create image", e))?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let offset = match arena.alloc(requirements.size, requirements.alignment) {
        Ok(offset) => offset,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };

    unsafe {
        device
            .bind_image_memory(image, arena.memory(), offset)
            .map_err(|e| Error::vk("bind image memory", e))?;
    }

    Ok(DeviceImage {
        image,
        view: vk::ImageView::null(),
        format,
        extent: vk::Extent2D { width, height },
        offset,
    })
}

/// Create a 2D image plus a full-range color view.
pub fn create_image_2d_with_view(
    device: &ash::Device,
    arena: &mut MemoryArena,
    width: u32,
    height: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<DeviceImage> {
    let mut image = create_image_2d(device, arena, width, height, format, usage)?;

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );

    image.view = unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(|e| Error::vk("create image view", e))?
    };

    Ok(image)
}

/// Linear sampler used for the color target and scene textures.
pub fn create_linear_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT);

    unsafe {
        device
            .create_sampler(&sampler_info, None)
            .map_err(|e| Error::vk("create sampler", e))
    }
}

/// Record a whole-image layout transition.
#[allow(clippy::too_many_arguments)]
pub fn cmd_transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
