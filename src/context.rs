//! Vulkan bring-up: instance, device, queue, arenas, staging, swapchain.
//!
//! The renderer requires a discrete GPU with the ray-tracing extension set;
//! there is no fallback device path. Fields are ordered so Rust's drop order
//! tears resources down before the device/instance they depend on, and
//! `destroy()` performs the same teardown explicitly.

use ash::vk;
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{CStr, CString};

use crate::arena::{self, MemoryArena};
use crate::error::{Error, Result};

/// Fixed arena capacities. A scene that does not fit these is a
/// configuration error surfaced by the arena itself.
pub const STAGING_CAPACITY: u64 = 256 << 20;
pub const TEXTURES_CAPACITY: u64 = 1 << 30;
pub const BUFFERS_CAPACITY: u64 = 512 << 20;
pub const RENDER_TARGETS_CAPACITY: u64 = 256 << 20;
pub const FRAME_POOL_CAPACITY: u64 = 16 << 20;

/// Deadline for one-shot setup submissions (upload, AS build). A stalled
/// device surfaces as `Error::Timeout` instead of hanging the process.
pub const ONE_SHOT_DEADLINE_NS: u64 = 60_000_000_000;

const DEVICE_EXTENSIONS: [&CStr; 5] = [
    ash::khr::swapchain::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::buffer_device_address::NAME,
];

/// The long-lived device arenas, one per memory class so unrelated resource
/// kinds never alias the same backing allocation.
pub struct Arenas {
    /// Device-local texel images (scene textures).
    pub textures: MemoryArena,
    /// Device-local buffers allocated with DEVICE_ADDRESS: geometry,
    /// records, acceleration-structure backing/scratch, SBT.
    pub buffers: MemoryArena,
    /// Screen-sized color targets; reset wholesale on resize.
    pub render_targets: MemoryArena,
}

/// The shared host-visible staging buffer: one `vk::Buffer` spanning its
/// whole arena, persistently mapped.
pub struct Staging {
    pub buffer: vk::Buffer,
    pub arena: MemoryArena,
}

impl Staging {
    pub fn capacity(&self) -> u64 {
        self.arena.capacity()
    }

    pub fn mapped_slice_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        self.arena.mapped_slice_mut(offset, len)
    }
}

pub struct Context {
    pub rt_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,
    pub accel_loader: ash::khr::acceleration_structure::Device,
    pub rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,
    pub accel_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static>,

    pub arenas: Arenas,
    pub staging: Staging,

    pub command_pool: vk::CommandPool,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    pub surface: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_images: Vec<vk::Image>,
    pub swapchain_image_views: Vec<vk::ImageView>,
    pub swapchain_format: vk::Format,
    pub swapchain_extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    destroyed: bool,
}

impl Context {
    /// Bring up the whole Vulkan state against an existing window.
    pub fn new(window: &(impl HasDisplayHandle + HasWindowHandle), width: u32, height: u32) -> Result<Self> {
        let entry = unsafe {
            ash::Entry::load().map_err(|e| Error::Init(format!("failed to load Vulkan: {}", e)))?
        };

        let display_handle = window
            .display_handle()
            .map_err(|e| Error::Init(format!("no display handle: {}", e)))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| Error::Init(format!("no window handle: {}", e)))?;

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vkrt")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkrt")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let surface_extensions =
            ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| Error::vk("enumerate surface extensions", e))?;
        let mut extension_names: Vec<*const i8> = surface_extensions.to_vec();

        let enable_validation = cfg!(debug_assertions);
        let mut layer_names: Vec<CString> = Vec::new();
        let mut extra_extensions: Vec<CString> = Vec::new();
        if enable_validation {
            let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer.as_c_str()
            });
            if has_validation {
                layer_names.push(validation_layer);
                extra_extensions.push(CString::new("VK_EXT_debug_utils").unwrap());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();
        for ext in &extra_extensions {
            extension_names.push(ext.as_ptr());
        }

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_names);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| Error::vk("create instance", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if enable_validation
            && extra_extensions
                .iter()
                .any(|n| n.as_c_str() == c"VK_EXT_debug_utils")
        {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };
            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Surface ---
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::vk("create surface", e))?
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        // --- Physical device: discrete GPU with the RT extension set ---
        let (physical_device, queue_family) =
            select_physical_device(&instance, &surface_loader, surface)?;

        // --- Device ---
        let queue_priority = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority)];

        let device_ext_ptrs: Vec<*const i8> =
            DEVICE_EXTENSIONS.iter().map(|n| n.as_ptr()).collect();

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let base_features = vk::PhysicalDeviceFeatures::default()
            .shader_sampled_image_array_dynamic_indexing(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_pipeline_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| Error::vk("create device", e))?
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // --- Command pool ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| Error::vk("create command pool", e))?
        };

        // --- RT loaders and properties ---
        let rt_pipeline_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }
        info!(
            "RT properties: handle_size={}, base_alignment={}, scratch_alignment={}",
            rt_props.shader_group_handle_size,
            rt_props.shader_group_base_alignment,
            accel_props.min_acceleration_structure_scratch_offset_alignment
        );
        // Plain-old-data property structs; safe to erase the pNext lifetime.
        let rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> =
            unsafe { std::mem::transmute(rt_props) };
        let accel_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static> =
            unsafe { std::mem::transmute(accel_props) };

        // --- Arenas ---
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let staging_type = find_required_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            "staging",
        )?;
        let device_local_type = find_required_memory_type(
            &memory_properties,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "device-local",
        )?;

        let staging_arena = MemoryArena::new(
            &device,
            "staging",
            STAGING_CAPACITY,
            staging_type,
            vk::MemoryAllocateFlags::empty(),
            true,
        )?;
        let textures = MemoryArena::new(
            &device,
            "textures",
            TEXTURES_CAPACITY,
            device_local_type,
            vk::MemoryAllocateFlags::empty(),
            false,
        )?;
        let buffers = MemoryArena::new(
            &device,
            "buffers",
            BUFFERS_CAPACITY,
            device_local_type,
            vk::MemoryAllocateFlags::DEVICE_ADDRESS,
            false,
        )?;
        let render_targets = MemoryArena::new(
            &device,
            "render-targets",
            RENDER_TARGETS_CAPACITY,
            device_local_type,
            vk::MemoryAllocateFlags::empty(),
            false,
        )?;

        // One buffer spans the whole staging arena; every upload addresses
        // it by byte offset.
        let mut staging = Staging {
            buffer: vk::Buffer::null(),
            arena: staging_arena,
        };
        let staging_info = vk::BufferCreateInfo::default()
            .size(STAGING_CAPACITY)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        staging.buffer = unsafe {
            device
                .create_buffer(&staging_info, None)
                .map_err(|e| Error::vk("create staging buffer", e))?
        };
        unsafe {
            device
                .bind_buffer_memory(staging.buffer, staging.arena.memory(), 0)
                .map_err(|e| Error::vk("bind staging buffer", e))?;
        }

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        let mut ctx = Context {
            rt_pipeline_loader,
            accel_loader,
            rt_properties,
            accel_properties,
            arenas: Arenas {
                textures,
                buffers,
                render_targets,
            },
            staging,
            command_pool,
            queue,
            queue_family,
            memory_properties,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            swapchain_images: Vec::new(),
            swapchain_image_views: Vec::new(),
            swapchain_format: vk::Format::UNDEFINED,
            swapchain_extent: vk::Extent2D::default(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            instance,
            entry,
            destroyed: false,
        };

        ctx.create_swapchain(width, height)?;
        info!("Vulkan context initialized");
        Ok(ctx)
    }

    /// Memory type for the per-frame host-visible pools: prefer a combined
    /// host+device type (write-combined BAR memory), fall back to plain
    /// host-visible memory.
    pub fn frame_pool_memory_type(&self) -> Result<u32> {
        let combined = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        if let Some(index) = arena::find_memory_type(&self.memory_properties, combined) {
            return Ok(index);
        }
        find_required_memory_type(
            &self.memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            "frame pool",
        )
    }

    /// Allocate and begin a one-shot command buffer.
    pub fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| Error::vk("allocate command buffer", e))?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| Error::vk("begin command buffer", e))?;
        }
        Ok(cmd)
    }

    /// End, submit, and block until the one-shot command buffer retires.
    ///
    /// `what` labels the wait in timeout errors.
    pub fn submit_and_wait(&self, cmd: vk::CommandBuffer, what: &'static str) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| Error::vk("end command buffer", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| Error::vk("create fence", e))?
        };

        let result = unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| Error::vk("queue submit", e))
                .and_then(|_| {
                    self.device
                        .wait_for_fences(&[fence], true, ONE_SHOT_DEADLINE_NS)
                        .map_err(|e| match e {
                            vk::Result::TIMEOUT => Error::Timeout(what),
                            other => Error::vk("wait for fence", other),
                        })
                })
        };

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.command_pool, &[cmd]);
        }
        result
    }

    /// Create or recreate the swapchain, its present render pass, and the
    /// per-image framebuffers.
    pub fn create_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        for fb in self.framebuffers.drain(..) {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
        for view in self.swapchain_image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        let old_swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| Error::vk("get surface capabilities", e))?
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| Error::vk("get surface formats", e))?
        };

        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .ok_or(Error::Init("no surface formats available".to_string()))?;
        self.swapchain_format = surface_format.format;

        self.swapchain_extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let image_count = (caps.min_image_count + 1).min(if caps.max_image_count > 0 {
            caps.max_image_count
        } else {
            u32::MAX
        });

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(self.swapchain_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| Error::vk("create swapchain", e))?
        };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }

        self.swapchain_images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(self.swapchain)
                .map_err(|e| Error::vk("get swapchain images", e))?
        };

        for &image in &self.swapchain_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.swapchain_format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe {
                self.device
                    .create_image_view(&view_info, None)
                    .map_err(|e| Error::vk("create swapchain image view", e))?
            };
            self.swapchain_image_views.push(view);
        }

        if self.render_pass == vk::RenderPass::null() {
            self.render_pass = create_present_render_pass(&self.device, self.swapchain_format)?;
        }

        for &view in &self.swapchain_image_views {
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(std::slice::from_ref(&view))
                .width(self.swapchain_extent.width)
                .height(self.swapchain_extent.height)
                .layers(1);
            let fb = unsafe {
                self.device
                    .create_framebuffer(&framebuffer_info, None)
                    .map_err(|e| Error::vk("create framebuffer", e))?
            };
            self.framebuffers.push(fb);
        }

        info!(
            "Swapchain created: {}x{} format={:?} images={}",
            self.swapchain_extent.width,
            self.swapchain_extent.height,
            self.swapchain_format,
            self.swapchain_images.len()
        );
        Ok(())
    }

    /// Acquire the next swapchain image. Returns `None` when the swapchain
    /// is out of date and must be recreated.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Option<u32>> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, _suboptimal)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(Error::vk("acquire swapchain image", e)),
        }
    }

    /// Present a swapchain image. Returns `false` when the swapchain is out
    /// of date and must be recreated.
    pub fn queue_present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.queue, &present_info)
        };
        match result {
            Ok(_suboptimal) => Ok(true),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(Error::vk("queue present", e)),
        }
    }

    /// Explicit teardown in dependency order. `Drop` also calls this.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
        }

        for fb in self.framebuffers.drain(..) {
            unsafe { self.device.destroy_framebuffer(fb, None) };
        }
        if self.render_pass != vk::RenderPass::null() {
            unsafe { self.device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = vk::RenderPass::null();
        }
        for view in self.swapchain_image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader
                    .destroy_swapchain(self.swapchain, None)
            };
            self.swapchain = vk::SwapchainKHR::null();
        }
        if self.surface != vk::SurfaceKHR::null() {
            unsafe { self.surface_loader.destroy_surface(self.surface, None) };
            self.surface = vk::SurfaceKHR::null();
        }

        unsafe {
            self.device.destroy_buffer(self.staging.buffer, None);
        }
        self.staging.buffer = vk::Buffer::null();
        self.staging.arena.destroy(&self.device);
        self.arenas.textures.destroy(&self.device);
        self.arenas.buffers.destroy(&self.device);
        self.arenas.render_targets.destroy(&self.device);

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);

            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn find_required_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
    what: &str,
) -> Result<u32> {
    arena::find_memory_type(props, required)
        .ok_or_else(|| Error::Init(format!("no {} memory type ({:?})", what, required)))
}

/// Pick a discrete GPU exposing the full ray-tracing extension set and a
/// graphics+compute+present queue family.
fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let physical_devices = unsafe {
        instance
            .enumerate_physical_devices()
            .map_err(|e| Error::vk("enumerate physical devices", e))?
    };
    if physical_devices.is_empty() {
        return Err(Error::Init("no Vulkan-capable GPUs found".to_string()));
    }

    for &phys_dev in &physical_devices {
        let props = unsafe { instance.get_physical_device_properties(phys_dev) };
        if props.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            continue;
        }

        let dev_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(phys_dev)
                .unwrap_or_default()
        };
        let has_all = DEVICE_EXTENSIONS.iter().all(|&wanted| {
            dev_extensions
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == wanted)
        });
        if !has_all {
            continue;
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
        let family = queue_families.iter().enumerate().find(|(idx, qprops)| {
            let graphics_compute = qprops
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
            let present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(phys_dev, *idx as u32, surface)
                    .unwrap_or(false)
            };
            graphics_compute && present
        });

        if let Some((family_idx, _)) = family {
            let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            info!(
                "Selected GPU: {} (Vulkan {}.{})",
                dev_name.to_string_lossy(),
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version)
            );
            return Ok((phys_dev, family_idx as u32));
        }
    }

    Err(Error::Init(
        "no discrete GPU with ray tracing support found".to_string(),
    ))
}

fn create_present_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::DONT_CARE)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref));

    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
    ];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);

    unsafe {
        device
            .create_render_pass(&render_pass_info, None)
            .map_err(|e| Error::vk("create render pass", e))
    }
}

/// Validation-layer callback; routes messages into the log.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[vulkan] {}", msg);
    } else {
        log::info!("[vulkan] {}", msg);
    }

    vk::FALSE
}
