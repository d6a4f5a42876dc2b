//! Frame orchestration: ties the device-resident scene, the acceleration
//! structures, the pipelines, and the frame ring together.
//!
//! Per frame: select the ring slot, wait out its fence, write the camera
//! block and overlay streams into its transient arena, then record one
//! command buffer that traces rays into the color target, blits it to the
//! swap-chain image, and draws the overlay on top. Descriptor sets are
//! re-allocated from the slot's pool every frame, since the pool was just
//! reset.

use ash::vk;
use log::info;
use std::path::Path;

use crate::accel::AccelerationStructures;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::frame::FrameRing;
use crate::gltf_loader::TextureImage;
use crate::overlay::{self, OverlayFrame};
use crate::pipelines::{rt_binding, OverlayPipeline, PresentPipeline, RayTracingPipeline};
use crate::resources::{self, DeviceImage};
use crate::scene::SceneData;
use crate::staging::{self, SceneResources};

/// Format of the ray-traced color target.
const COLOR_TARGET_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

pub struct Renderer {
    scene: SceneData,
    resources: SceneResources,
    accel: AccelerationStructures,
    rt: RayTracingPipeline,
    present: PresentPipeline,
    overlay_pipeline: OverlayPipeline,
    overlay_atlas: DeviceImage,
    color_target: DeviceImage,
    ring: FrameRing,
}

impl Renderer {
    /// Scene load: upload geometry, build acceleration structures, create
    /// pipelines and the frame ring.
    pub fn new(
        ctx: &mut Context,
        scene: SceneData,
        shader_dir: &Path,
        frames_in_flight: usize,
        overlay_atlas_texels: &TextureImage,
    ) -> Result<Self> {
        let resources = SceneResources::create_and_upload(ctx, &scene)?;
        let accel = AccelerationStructures::build(ctx, &scene, &resources)?;

        let rt = RayTracingPipeline::create(ctx, shader_dir, resources.textures.len() as u32)?;
        let present = PresentPipeline::create(ctx, shader_dir)?;
        let overlay_pipeline = OverlayPipeline::create(ctx, shader_dir)?;

        let overlay_atlas = resources::create_image_2d_with_view(
            &ctx.device.clone(),
            &mut ctx.arenas.textures,
            overlay_atlas_texels.width,
            overlay_atlas_texels.height,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        staging::upload_texture(
            ctx,
            &overlay_atlas,
            &overlay_atlas_texels.pixels,
            "overlay atlas upload",
        )?;

        let color_target = create_color_target(ctx)?;
        let ring = FrameRing::new(ctx, frames_in_flight)?;

        info!(
            "Renderer ready: {} instances, {} geometries, {} textures, {} frames in flight",
            scene.instances.len(),
            scene.geometries.len(),
            resources.textures.len(),
            frames_in_flight
        );

        Ok(Renderer {
            scene,
            resources,
            accel,
            rt,
            present,
            overlay_pipeline,
            overlay_atlas,
            color_target,
            ring,
        })
    }

    /// Swap-chain resize hook: the color target's arena is reset wholesale
    /// and the target recreated at the new extent. Pipelines use dynamic
    /// viewport state and are untouched.
    pub fn handle_resize(&mut self, ctx: &mut Context, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        unsafe {
            let _ = ctx.device.device_wait_idle();
        }
        self.color_target.destroy(&ctx.device);
        ctx.arenas.render_targets.reset();
        ctx.create_swapchain(width, height)?;
        self.color_target = create_color_target(ctx)?;
        Ok(())
    }

    /// Render one frame. Returns `false` when the swap chain went out of
    /// date and the caller must run the resize hook.
    pub fn render_frame(&mut self, ctx: &mut Context, overlay_frame: &OverlayFrame) -> Result<bool> {
        let device = ctx.device.clone();
        let extent = ctx.swapchain_extent;

        let aspect = extent.width as f32 / extent.height as f32;
        let constants = self
            .scene
            .camera
            .constants(aspect, self.scene.lights.len() as u32);
        let slot = self.ring.begin(&device)?;

        let image_index = match ctx.acquire_next_image(slot.image_available)? {
            Some(index) => index,
            None => return Ok(false),
        };

        // Transient per-frame data; safe now that the fence proved the
        // slot's previous submission retired.
        slot.write_camera(&constants);

        let draw_calls =
            overlay::write_frame(slot, overlay_frame, extent.width, extent.height)?;

        let cmd = slot.command_buffer;
        let image_available = slot.image_available;
        let render_finished = slot.render_finished;
        let in_flight = slot.in_flight;
        let descriptor_pool = slot.descriptor_pool;
        let camera_buffer = slot.camera_buffer.buffer;
        let overlay_vertex_buffer = slot.overlay_vertices.buffer;
        let overlay_index_buffer = slot.overlay_indices.buffer;

        // --- Record ---
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| Error::vk("begin frame command buffer", e))?;
        }

        resources::cmd_transition_image(
            &device,
            cmd,
            self.color_target.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        );

        // Ray trace into the color target.
        let rt_set = allocate_set(&device, descriptor_pool, self.rt.descriptor_set_layout)?;
        self.write_rt_descriptors(&device, rt_set, camera_buffer);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.rt.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt.layout,
                0,
                &[rt_set],
                &[],
            );
            let callable = vk::StridedDeviceAddressRegionKHR::default();
            ctx.rt_pipeline_loader.cmd_trace_rays(
                cmd,
                &self.rt.sbt.raygen,
                &self.rt.sbt.miss,
                &self.rt.sbt.hit,
                &callable,
                extent.width,
                extent.height,
                1,
            );
        }

        resources::cmd_transition_image(
            &device,
            cmd,
            self.color_target.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        // Present pass: fullscreen blit, then the overlay.
        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(ctx.render_pass)
            .framebuffer(ctx.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            });

        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let full_scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[full_scissor]);

            let present_set =
                allocate_set(&device, descriptor_pool, self.present.descriptor_set_layout)?;
            let color_info = vk::DescriptorImageInfo::default()
                .sampler(self.resources.sampler)
                .image_view(self.color_target.view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            let present_write = vk::WriteDescriptorSet::default()
                .dst_set(present_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&color_info));
            device.update_descriptor_sets(&[present_write], &[]);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.present.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.present.layout,
                0,
                &[present_set],
                &[],
            );
            device.cmd_draw(cmd, 3, 1, 0, 0);

            if !draw_calls.is_empty() {
                let overlay_set = allocate_set(
                    &device,
                    descriptor_pool,
                    self.overlay_pipeline.descriptor_set_layout,
                )?;
                let atlas_info = vk::DescriptorImageInfo::default()
                    .sampler(self.resources.sampler)
                    .image_view(self.overlay_atlas.view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                let overlay_write = vk::WriteDescriptorSet::default()
                    .dst_set(overlay_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(&atlas_info));
                device.update_descriptor_sets(&[overlay_write], &[]);

                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.overlay_pipeline.pipeline,
                );
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.overlay_pipeline.layout,
                    0,
                    &[overlay_set],
                    &[],
                );
                let viewport_size = [extent.width as f32, extent.height as f32];
                device.cmd_push_constants(
                    cmd,
                    self.overlay_pipeline.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::cast_slice(&viewport_size),
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[overlay_vertex_buffer], &[0]);
                device.cmd_bind_index_buffer(cmd, overlay_index_buffer, 0, vk::IndexType::UINT16);
                for call in &draw_calls {
                    device.cmd_set_scissor(cmd, 0, &[call.scissor]);
                    device.cmd_draw_indexed(
                        cmd,
                        call.index_count,
                        1,
                        call.first_index,
                        call.vertex_offset,
                        0,
                    );
                }
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .map_err(|e| Error::vk("end frame command buffer", e))?;
        }

        // --- Submit and present ---
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .reset_fences(&[in_flight])
                .map_err(|e| Error::vk("reset frame fence", e))?;
            device
                .queue_submit(ctx.queue, &[submit_info], in_flight)
                .map_err(|e| Error::vk("submit frame", e))?;
        }

        let presented = ctx.queue_present(image_index, render_finished)?;
        self.ring.advance();
        Ok(presented)
    }

    fn write_rt_descriptors(
        &self,
        device: &ash::Device,
        set: vk::DescriptorSet,
        camera_buffer: vk::Buffer,
    ) {
        let buffer_info = |buffer: vk::Buffer| {
            vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .range(vk::WHOLE_SIZE)
        };

        let color_info = vk::DescriptorImageInfo::default()
            .image_view(self.color_target.view)
            .image_layout(vk::ImageLayout::GENERAL);
        let camera_info = buffer_info(camera_buffer);
        let vertices_info = buffer_info(self.resources.vertices.buffer);
        let indices_info = buffer_info(self.resources.indices.buffer);
        let geometries_info = buffer_info(self.resources.geometries.buffer);
        let materials_info = buffer_info(self.resources.materials.buffer);
        let instances_info = buffer_info(self.resources.instances.buffer);
        let lights_info = buffer_info(self.resources.lights.buffer);

        let texture_infos: Vec<vk::DescriptorImageInfo> = self
            .resources
            .textures
            .iter()
            .map(|t| {
                vk::DescriptorImageInfo::default()
                    .sampler(self.resources.sampler)
                    .image_view(t.view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();

        let tlas_array = [self.accel.tlas];
        let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&tlas_array);

        fn storage_write<'a>(
            set: vk::DescriptorSet,
            binding: u32,
            info: &'a vk::DescriptorBufferInfo,
        ) -> vk::WriteDescriptorSet<'a> {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(std::slice::from_ref(info))
        }

        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(rt_binding::COLOR_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(std::slice::from_ref(&color_info)),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(rt_binding::TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .push_next(&mut tlas_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(rt_binding::CAMERA)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&camera_info)),
            storage_write(set, rt_binding::VERTICES, &vertices_info),
            storage_write(set, rt_binding::INDICES, &indices_info),
            storage_write(set, rt_binding::GEOMETRIES, &geometries_info),
            storage_write(set, rt_binding::MATERIALS, &materials_info),
            storage_write(set, rt_binding::INSTANCES, &instances_info),
            storage_write(set, rt_binding::LIGHTS, &lights_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(rt_binding::TEXTURES)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&texture_infos),
        ];

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }

    pub fn destroy(&mut self, ctx: &mut Context) {
        unsafe {
            let _ = ctx.device.device_wait_idle();
        }
        let device = ctx.device.clone();
        self.ring.destroy(&device);
        self.overlay_pipeline.destroy(&device);
        self.present.destroy(&device);
        self.rt.destroy(&device);
        self.overlay_atlas.destroy(&device);
        self.color_target.destroy(&device);
        self.accel.destroy(ctx);
        self.resources.destroy(ctx);
    }
}

fn create_color_target(ctx: &mut Context) -> Result<DeviceImage> {
    let extent = ctx.swapchain_extent;
    resources::create_image_2d_with_view(
        &ctx.device.clone(),
        &mut ctx.arenas.render_targets,
        extent.width,
        extent.height,
        COLOR_TARGET_FORMAT,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
    )
}

fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<vk::DescriptorSet> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let sets = unsafe {
        device
            .allocate_descriptor_sets(&alloc_info)
            .map_err(|e| Error::vk("allocate descriptor set", e))?
    };
    Ok(sets[0])
}
