//! Per-frame resource ring.
//!
//! N frames may be in flight on the device at once. Each ring slot owns the
//! resources one frame records into: a command buffer, the two semaphores
//! bracketing its submission, a fence proving the slot's previous
//! submission retired, a descriptor pool reset every frame, and a small
//! host-visible arena holding the camera block and the overlay
//! vertex/index streams. The fence wait is what makes reusing the slot's
//! host-visible memory safe: frame K writes it only once frame K-N is
//! proven complete, so no memory barrier is involved.

use ash::vk;

use crate::arena::MemoryArena;
use crate::camera::CameraConstants;
use crate::context::{Context, FRAME_POOL_CAPACITY};
use crate::error::{Error, Result};
use crate::resources::{self, DeviceBuffer};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// Fixed byte reservations inside each slot's transient arena.
pub const CAMERA_BLOCK_SIZE: u64 = 256;
pub const OVERLAY_VERTEX_BUDGET: u64 = 2 << 20;
pub const OVERLAY_INDEX_BUDGET: u64 = 1 << 20;

/// Deadline for a slot-fence wait. A device stalled this long is treated as
/// hung rather than blocking the host forever.
pub const FRAME_FENCE_DEADLINE_NS: u64 = 10_000_000_000;

/// The slot a given frame counter lands in.
pub fn slot_index(frame_count: u64, slot_count: usize) -> usize {
    (frame_count % slot_count as u64) as usize
}

pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the swap-chain image is available.
    pub image_available: vk::Semaphore,
    /// Signaled when this slot's submission finishes.
    pub render_finished: vk::Semaphore,
    /// Signaled when this slot's previous submission retired. Created
    /// signaled so the first use does not wait.
    pub in_flight: vk::Fence,
    pub descriptor_pool: vk::DescriptorPool,
    pub arena: MemoryArena,
    pub camera_buffer: DeviceBuffer,
    pub overlay_vertices: DeviceBuffer,
    pub overlay_indices: DeviceBuffer,
}

impl FrameSlot {
    fn new(ctx: &Context, memory_type: u32) -> Result<Self> {
        let device = &ctx.device;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| Error::vk("allocate frame command buffer", e))?[0]
        };

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe {
            device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| Error::vk("create semaphore", e))?
        };
        let render_finished = unsafe {
            device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| Error::vk("create semaphore", e))?
        };

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(|e| Error::vk("create frame fence", e))?
        };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 64,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 64,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 16,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 4,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(16)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| Error::vk("create frame descriptor pool", e))?
        };

        let mut arena = MemoryArena::new(
            device,
            "frame-pool",
            FRAME_POOL_CAPACITY,
            memory_type,
            vk::MemoryAllocateFlags::empty(),
            true,
        )?;

        let camera_buffer = resources::create_buffer(
            device,
            &mut arena,
            CAMERA_BLOCK_SIZE,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let overlay_vertices = resources::create_buffer(
            device,
            &mut arena,
            OVERLAY_VERTEX_BUDGET,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let overlay_indices = resources::create_buffer(
            device,
            &mut arena,
            OVERLAY_INDEX_BUDGET,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(FrameSlot {
            command_buffer,
            image_available,
            render_finished,
            in_flight,
            descriptor_pool,
            arena,
            camera_buffer,
            overlay_vertices,
            overlay_indices,
        })
    }

    /// Write this frame's camera block into the slot's transient memory.
    /// Only safe after the slot's fence wait for this frame.
    pub fn write_camera(&mut self, constants: &CameraConstants) {
        let bytes = bytemuck::bytes_of(constants);
        self.arena
            .mapped_slice_mut(self.camera_buffer.offset, bytes.len() as u64)
            .copy_from_slice(bytes);
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_fence(self.in_flight, None);
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
        }
        self.camera_buffer.destroy(device);
        self.overlay_vertices.destroy(device);
        self.overlay_indices.destroy(device);
        self.arena.destroy(device);
    }
}

pub struct FrameRing {
    slots: Vec<FrameSlot>,
    frame_count: u64,
}

impl FrameRing {
    pub fn new(ctx: &Context, frames_in_flight: usize) -> Result<Self> {
        assert!(
            (2..=3).contains(&frames_in_flight),
            "frame ring supports 2 or 3 slots"
        );
        let memory_type = ctx.frame_pool_memory_type()?;
        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot::new(ctx, memory_type))
            .collect::<Result<Vec<_>>>()?;
        Ok(FrameRing {
            slots,
            frame_count: 0,
        })
    }

    pub fn current_index(&self) -> usize {
        slot_index(self.frame_count, self.slots.len())
    }

    /// Begin the current frame: wait until the slot's previous submission
    /// retired, then reset its command buffer and descriptor pool. After
    /// this returns, writing the slot's transient memory cannot race the
    /// device. The fence stays signaled until just before the submit that
    /// consumes it, so a frame abandoned mid-way (swap chain out of date)
    /// leaves the slot reusable.
    pub fn begin(&mut self, device: &ash::Device) -> Result<&mut FrameSlot> {
        let index = self.current_index();
        let slot = &mut self.slots[index];

        unsafe {
            device
                .wait_for_fences(&[slot.in_flight], true, FRAME_FENCE_DEADLINE_NS)
                .map_err(|e| match e {
                    vk::Result::TIMEOUT => Error::Timeout("frame fence"),
                    other => Error::vk("wait for frame fence", other),
                })?;
            device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| Error::vk("reset frame command buffer", e))?;
            device
                .reset_descriptor_pool(
                    slot.descriptor_pool,
                    vk::DescriptorPoolResetFlags::empty(),
                )
                .map_err(|e| Error::vk("reset frame descriptor pool", e))?;
        }

        Ok(slot)
    }

    /// Advance the global frame counter; the next frame lands in
    /// `counter mod N`.
    pub fn advance(&mut self) {
        self.frame_count += 1;
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for slot in &mut self.slots {
            slot.destroy(device);
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_selection_is_counter_modulo_n() {
        assert_eq!(slot_index(0, 3), 0);
        assert_eq!(slot_index(1, 3), 1);
        assert_eq!(slot_index(2, 3), 2);
        assert_eq!(slot_index(3, 3), 0);
        assert_eq!(slot_index(7, 3), 1);
        assert_eq!(slot_index(7, 2), 1);
        assert_eq!(slot_index(8, 2), 0);
    }

    #[test]
    fn camera_block_fits_its_reservation() {
        assert!(std::mem::size_of::<CameraConstants>() as u64 <= CAMERA_BLOCK_SIZE);
    }
}
