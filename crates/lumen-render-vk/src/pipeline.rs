// SPDX-License-Identifier: CEPL-1.0
//! Render pass, framebuffers and the mesh pipeline.

use std::mem::{offset_of, size_of};
use std::sync::Arc;

use ash::vk;
use lumen_render::{ShaderCode, Vertex};
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::owned::Owned;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Single colour attachment, cleared on load and handed to presentation.
pub fn create_render_pass(
    ctx: &Arc<DeviceContext>,
    format: vk::Format,
) -> VkResult<Owned<vk::RenderPass>> {
    let color = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref);

    // The image may still be read by the presentation engine until the
    // acquire semaphore, which is waited at colour output.
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let attachments = [color];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let rp = unsafe { ctx.device().create_render_pass(&info, None) }.vk("vkCreateRenderPass")?;
    Ok(Owned::new(ctx, rp))
}

pub fn create_framebuffer(
    ctx: &Arc<DeviceContext>,
    render_pass: vk::RenderPass,
    view: vk::ImageView,
    extent: vk::Extent2D,
) -> VkResult<Owned<vk::Framebuffer>> {
    let attachments = [view];
    let info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(&attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    let fb = unsafe { ctx.device().create_framebuffer(&info, None) }.vk("vkCreateFramebuffer")?;
    Ok(Owned::new(ctx, fb))
}

pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// `position`, `texcoords`, `color` at locations 0, 1, 2.
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, texcoords) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
    ]
}

fn shader_module(
    ctx: &Arc<DeviceContext>,
    words: &[u32],
    stage: &'static str,
) -> VkResult<Owned<vk::ShaderModule>> {
    if words.is_empty() {
        return Err(VkError::InvalidShader(stage));
    }
    let info = vk::ShaderModuleCreateInfo::default().code(words);
    let module =
        unsafe { ctx.device().create_shader_module(&info, None) }.vk("vkCreateShaderModule")?;
    Ok(Owned::new(ctx, module))
}

/// The mesh pipeline. The pipeline is destroyed before its layout.
pub struct GraphicsPipeline {
    pipeline: Owned<vk::Pipeline>,
    layout: Owned<vk::PipelineLayout>,
}

impl GraphicsPipeline {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
        shaders: &ShaderCode,
    ) -> VkResult<Self> {
        let device = ctx.device();
        let vert = shader_module(ctx, &shaders.vertex, "empty vertex stage")?;
        let frag = shader_module(ctx, &shaders.fragment, "empty fragment stage")?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert.raw())
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag.raw())
                .name(ENTRY_POINT),
        ];

        let bindings = [vertex_binding()];
        let attributes = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only their counts are fixed here.
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .depth_bias_enable(false);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = Owned::new(
            ctx,
            unsafe { device.create_pipeline_layout(&layout_info, None) }
                .vk("vkCreatePipelineLayout")?,
        );

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisample)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout.raw())
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, result)| VkError::Vulkan {
            what: "vkCreateGraphicsPipelines",
            result,
        })?;
        let pipeline = pipelines.into_iter().next().ok_or(VkError::Vulkan {
            what: "vkCreateGraphicsPipelines",
            result: vk::Result::ERROR_UNKNOWN,
        })?;
        debug!("vk: graphics pipeline created");

        Ok(Self {
            pipeline: Owned::new(ctx, pipeline),
            layout,
        })
    }

    #[inline]
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }
}
