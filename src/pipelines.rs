//! Pipelines: ray tracing + shader-binding table, swap-chain present, and
//! the overlay pass.
//!
//! Shader binaries are loaded by name from the shader directory. The
//! graphics pipelines use dynamic viewport/scissor so a window resize only
//! touches the swap chain and the color target, never the pipelines.

use ash::vk;
use log::info;
use std::path::Path;

use crate::arena::align_up;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::resources::{self, DeviceBuffer};
use crate::shader;
use crate::staging;

/// Descriptor bindings of the ray-tracing set, in binding order.
pub mod rt_binding {
    pub const COLOR_IMAGE: u32 = 0;
    pub const TLAS: u32 = 1;
    pub const CAMERA: u32 = 2;
    pub const VERTICES: u32 = 3;
    pub const INDICES: u32 = 4;
    pub const GEOMETRIES: u32 = 5;
    pub const MATERIALS: u32 = 6;
    pub const INSTANCES: u32 = 7;
    pub const LIGHTS: u32 = 8;
    pub const TEXTURES: u32 = 9;
}

/// Raygen, miss, closest-hit. Group order fixes the SBT region order.
const RT_GROUP_COUNT: u64 = 3;

/// Byte placement of the shader-binding table: one group handle per
/// region, each region aligned to the device's group base alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub stride: u64,
    pub region_size: u64,
    pub total_size: u64,
}

impl SbtLayout {
    pub fn compute(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> Self {
        let handle_size = handle_size as u64;
        let stride = align_up(handle_size, handle_alignment as u64);
        let region_size = align_up(stride, base_alignment as u64);
        SbtLayout {
            handle_size,
            stride,
            region_size,
            total_size: region_size * RT_GROUP_COUNT,
        }
    }

    pub fn region_offset(&self, group: u64) -> u64 {
        group * self.region_size
    }

    /// Scatter the packed handles the driver returns into their aligned
    /// region slots.
    pub fn scatter_handles(&self, handles: &[u8]) -> Vec<u8> {
        let mut blob = vec![0u8; self.total_size as usize];
        for group in 0..RT_GROUP_COUNT as usize {
            let src = group * self.handle_size as usize;
            let dst = self.region_offset(group as u64) as usize;
            blob[dst..dst + self.handle_size as usize]
                .copy_from_slice(&handles[src..src + self.handle_size as usize]);
        }
        blob
    }
}

pub struct ShaderBindingTable {
    pub buffer: DeviceBuffer,
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
}

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub sbt: ShaderBindingTable,
}

impl RayTracingPipeline {
    pub fn create(ctx: &mut Context, shader_dir: &Path, texture_count: u32) -> Result<Self> {
        let device = ctx.device.clone();

        let storage_buffer = |binding: u32| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
        };

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(rt_binding::COLOR_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
            vk::DescriptorSetLayoutBinding::default()
                .binding(rt_binding::TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
            vk::DescriptorSetLayoutBinding::default()
                .binding(rt_binding::CAMERA)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(
                    vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ),
            storage_buffer(rt_binding::VERTICES),
            storage_buffer(rt_binding::INDICES),
            storage_buffer(rt_binding::GEOMETRIES),
            storage_buffer(rt_binding::MATERIALS),
            storage_buffer(rt_binding::INSTANCES),
            storage_buffer(rt_binding::LIGHTS),
            vk::DescriptorSetLayoutBinding::default()
                .binding(rt_binding::TEXTURES)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(texture_count.max(1))
                .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| Error::vk("create RT descriptor set layout", e))?
        };

        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&descriptor_set_layout));
        let layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| Error::vk("create RT pipeline layout", e))?
        };

        // --- Stages and groups ---
        let rgen_module = shader::load_shader_module(&device, shader_dir, "trace.rgen.spv")?;
        let rmiss_module = shader::load_shader_module(&device, shader_dir, "trace.rmiss.spv")?;
        let rchit_module = shader::load_shader_module(&device, shader_dir, "trace.rchit.spv")?;

        let entry_name = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::RAYGEN_KHR)
                .module(rgen_module)
                .name(entry_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(rmiss_module)
                .name(entry_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(rchit_module)
                .name(entry_name),
        ];

        let shader_groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&shader_stages)
            .groups(&shader_groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);

        let pipeline = unsafe {
            ctx.rt_pipeline_loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[pipeline_info],
                    None,
                )
                .map_err(|(_, e)| Error::vk("create ray tracing pipeline", e))?[0]
        };

        unsafe {
            device.destroy_shader_module(rgen_module, None);
            device.destroy_shader_module(rmiss_module, None);
            device.destroy_shader_module(rchit_module, None);
        }

        let sbt = create_sbt(ctx, pipeline)?;
        info!("Ray tracing pipeline created");

        Ok(RayTracingPipeline {
            pipeline,
            layout,
            descriptor_set_layout,
            sbt,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.sbt.buffer.destroy(device);
    }
}

/// Build the shader-binding table: fetch the group handles, scatter them
/// into aligned regions, and move the blob through staging into a
/// device-address buffer.
fn create_sbt(ctx: &mut Context, pipeline: vk::Pipeline) -> Result<ShaderBindingTable> {
    let props = &ctx.rt_properties;
    let layout = SbtLayout::compute(
        props.shader_group_handle_size,
        props.shader_group_handle_alignment,
        props.shader_group_base_alignment,
    );

    let handles = unsafe {
        ctx.rt_pipeline_loader
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                RT_GROUP_COUNT as u32,
                (layout.handle_size * RT_GROUP_COUNT) as usize,
            )
            .map_err(|e| Error::vk("get shader group handles", e))?
    };
    let blob = layout.scatter_handles(&handles);

    let buffer = resources::create_buffer(
        &ctx.device,
        &mut ctx.arenas.buffers,
        layout.total_size,
        vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::TRANSFER_DST,
    )?;

    staging::upload_bytes(ctx, &blob, &buffer, "shader binding table upload")?;

    let base = buffer.device_address(&ctx.device);
    let region = |group: u64, stride: u64| vk::StridedDeviceAddressRegionKHR {
        device_address: base + layout.region_offset(group),
        stride,
        size: layout.region_size,
    };

    Ok(ShaderBindingTable {
        buffer,
        // The raygen region's stride must equal its size.
        raygen: region(0, layout.region_size),
        miss: region(1, layout.stride),
        hit: region(2, layout.stride),
    })
}

// ---------------------------------------------------------------------------
// Graphics pipelines
// ---------------------------------------------------------------------------

/// Fullscreen pass that samples the ray-traced color target into the swap
/// chain.
pub struct PresentPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
}

impl PresentPipeline {
    pub fn create(ctx: &Context, shader_dir: &Path) -> Result<Self> {
        let device = &ctx.device;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| Error::vk("create present descriptor set layout", e))?
        };

        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&descriptor_set_layout));
        let layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| Error::vk("create present pipeline layout", e))?
        };

        let vert = shader::load_shader_module(device, shader_dir, "present.vert.spv")?;
        let frag = shader::load_shader_module(device, shader_dir, "present.frag.spv")?;

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let pipeline = create_graphics_pipeline(
            device,
            ctx.render_pass,
            vert,
            frag,
            &vertex_input,
            false,
            layout,
        )?;

        unsafe {
            device.destroy_shader_module(vert, None);
            device.destroy_shader_module(frag, None);
        }

        Ok(PresentPipeline {
            pipeline,
            layout,
            descriptor_set_layout,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// Blended, scissored pass drawing the overlay collaborator's geometry.
pub struct OverlayPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
}

impl OverlayPipeline {
    pub fn create(ctx: &Context, shader_dir: &Path) -> Result<Self> {
        let device = &ctx.device;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| Error::vk("create overlay descriptor set layout", e))?
        };

        // The vertex stage maps pixel coordinates to clip space from the
        // viewport size.
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(8);
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&descriptor_set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| Error::vk("create overlay pipeline layout", e))?
        };

        let vert = shader::load_shader_module(device, shader_dir, "overlay.vert.spv")?;
        let frag = shader::load_shader_module(device, shader_dir, "overlay.frag.spv")?;

        let binding_desc = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(crate::overlay::OVERLAY_VERTEX_STRIDE as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attr_descs = [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(8),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(2)
                .format(vk::Format::R8G8B8A8_UNORM)
                .offset(16),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_desc)
            .vertex_attribute_descriptions(&attr_descs);

        let pipeline = create_graphics_pipeline(
            device,
            ctx.render_pass,
            vert,
            frag,
            &vertex_input,
            true,
            layout,
        )?;

        unsafe {
            device.destroy_shader_module(vert, None);
            device.destroy_shader_module(frag, None);
        }

        Ok(OverlayPipeline {
            pipeline,
            layout,
            descriptor_set_layout,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
    vertex_input: &vk::PipelineVertexInputStateCreateInfo,
    alpha_blend: bool,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let entry_name = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(entry_name),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(entry_name),
    ];

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = if alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(std::slice::from_ref(&color_blend_attachment));

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipeline = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| Error::vk("create graphics pipeline", e))?[0]
    };
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbt_regions_are_base_aligned() {
        let layout = SbtLayout::compute(32, 32, 64);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.region_size, 64);
        assert_eq!(layout.total_size, 192);
        assert_eq!(layout.region_offset(0), 0);
        assert_eq!(layout.region_offset(1), 64);
        assert_eq!(layout.region_offset(2), 128);
    }

    #[test]
    fn sbt_handles_scatter_to_region_starts() {
        let layout = SbtLayout::compute(4, 8, 16);
        assert_eq!(layout.stride, 8);
        assert_eq!(layout.region_size, 16);

        let handles: Vec<u8> = (0..12).collect();
        let blob = layout.scatter_handles(&handles);
        assert_eq!(blob.len(), 48);
        assert_eq!(&blob[0..4], &[0, 1, 2, 3]);
        assert_eq!(&blob[16..20], &[4, 5, 6, 7]);
        assert_eq!(&blob[32..36], &[8, 9, 10, 11]);
        // Padding stays zeroed.
        assert_eq!(&blob[4..16], &[0; 12]);
    }
}
