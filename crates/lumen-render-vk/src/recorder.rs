// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::owned::{CommandBuffers, Owned};
use crate::scene::MeshBuffers;

/// Everything one per-image command buffer references.
pub struct DrawTarget<'a> {
    pub image: u32,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub mesh: &'a MeshBuffers,
}

/// Owns the per-image command pool and the clear colour baked into recordings.
pub struct CommandRecorder {
    ctx: Arc<DeviceContext>,
    pool: Owned<vk::CommandPool>,
    clear_color: [f32; 4],
}

impl CommandRecorder {
    pub fn new(ctx: &Arc<DeviceContext>, clear_color: [f32; 4]) -> VkResult<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.families().graphics);
        let pool = unsafe { ctx.device().create_command_pool(&info, None) }
            .vk("vkCreateCommandPool")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool: Owned::new(ctx, pool),
            clear_color,
        })
    }

    /// Buffers must be dropped before the recorder.
    pub fn allocate(&self, count: u32) -> VkResult<CommandBuffers> {
        CommandBuffers::allocate(&self.pool, count)
    }

    /// Returns whether the colour changed, in which case recordings are stale.
    pub fn set_clear_color(&mut self, rgba: [f32; 4]) -> bool {
        let changed = self.clear_color != rgba;
        self.clear_color = rgba;
        changed
    }

    /// Records the full pass for one image. The buffer is implicitly reset by begin.
    pub fn record(&self, cmd: vk::CommandBuffer, target: &DrawTarget<'_>) -> VkResult<()> {
        let device = self.ctx.device();
        let failed = |result| VkError::RecordFailed {
            image: target.image,
            result,
        };

        let begin = vk::CommandBufferBeginInfo::default();
        unsafe { device.begin_command_buffer(cmd, &begin) }.map_err(failed)?;

        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let pass = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(area)
            .clear_values(&clear);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let mesh = target.mesh;

        unsafe {
            device.cmd_begin_render_pass(cmd, &pass, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[area]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer()], &[0]);
            device.cmd_bind_index_buffer(cmd, mesh.index_buffer(), 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                target.layout,
                0,
                &[target.descriptor_set],
                &[],
            );
            device.cmd_draw_indexed(cmd, mesh.index_count(), 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);
        }

        unsafe { device.end_command_buffer(cmd) }.map_err(failed)
    }
}
