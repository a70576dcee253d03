// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod descriptor;
pub mod error;
pub mod flags;
pub mod memory;
pub mod owned;
pub mod pipeline;
pub mod recorder;
pub mod scene;
pub mod scheduler;
pub mod shaders;
pub mod swapchain;
pub mod sync;
pub mod uniforms;
pub mod upload;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use ash::vk;
use lumen_render::{RenderSettings, RenderSize, Renderer, SceneDesc, WindowHost};
use tracing::{debug, info, warn};

pub use context::{DeviceContext, QueueFamilyIndices};
pub use error::{VkError, VkResult};
pub use flags::{BufferUsage, ImageLayout, MemoryProperty};
pub use memory::{DeviceBuffer, DeviceImage};
pub use scheduler::{FrameOutcome, FrameScheduler};
pub use upload::{Texture, UploadPipeline};

use crate::error::VkContext;
use crate::recorder::CommandRecorder;
use crate::scene::SceneResources;
use crate::scheduler::{Acquired, FrameSlot, FrameTarget, Presented};
use crate::swapchain::SwapchainManager;
use crate::sync::VkFrameSlot;
use crate::uniforms::UniformMatrices;

// Field order is teardown order: per-image resources and their command
// buffers go before the recorder's pool and the scene they reference.
struct RenderState {
    swapchains: SwapchainManager,
    recorder: CommandRecorder,
    scene: SceneResources,
    ctx: Arc<DeviceContext>,
    clock: Instant,
}

impl FrameTarget<VkFrameSlot> for RenderState {
    fn wait_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.ctx.device().wait_for_fences(&[fence], true, u64::MAX) }
            .vk("vkWaitForFences")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.ctx.device().reset_fences(&[fence]) }.vk("vkResetFences")
    }

    fn acquire_image(&mut self, slot: &VkFrameSlot) -> VkResult<Acquired> {
        let swapchain = self.swapchains.generation()?.state().raw();
        let loader = self.ctx.swapchain_loader()?;
        let acquired = unsafe {
            loader.acquire_next_image(
                swapchain,
                u64::MAX,
                slot.image_acquired(),
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(result) => Err(VkError::Vulkan {
                what: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    fn image_in_use(&self, image: u32) -> Option<vk::Fence> {
        self.swapchains.generation().ok()?.image_in_use(image)
    }

    fn set_image_in_use(&mut self, image: u32, fence: vk::Fence) {
        if let Ok(generation) = self.swapchains.generation_mut() {
            generation.set_image_in_use(image, fence);
        }
    }

    fn prepare_image(&mut self, image: u32) -> VkResult<()> {
        let elapsed = self.clock.elapsed().as_secs_f32();
        let generation = self.swapchains.generation_mut()?;
        let uniforms = UniformMatrices::at(elapsed, generation.state().extent());
        generation.prepare(image, &uniforms, &self.recorder, &self.scene)
    }

    fn submit(&mut self, slot: &VkFrameSlot, image: u32) -> VkResult<()> {
        let cmd = self.swapchains.generation()?.command_buffer(image)?;
        let wait = [slot.image_acquired()];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [cmd];
        let signal = [slot.render_finished()];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);

        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.graphics_queue(), &[submit], slot.in_flight())
        }
        .vk("vkQueueSubmit")
    }

    fn release_slot(&mut self, slot: &VkFrameSlot) -> VkResult<()> {
        let wait = [slot.image_acquired()];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages);

        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.graphics_queue(), &[submit], slot.in_flight())
        }
        .vk("vkQueueSubmit")
    }

    fn present(&mut self, slot: &VkFrameSlot, image: u32) -> VkResult<Presented> {
        let wait = [slot.render_finished()];
        let swapchains = [self.swapchains.generation()?.state().raw()];
        let indices = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let loader = self.ctx.swapchain_loader()?;
        match unsafe { loader.queue_present(self.ctx.present_queue(), &info) } {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::NeedsRecreate),
            Err(result) => Err(VkError::Vulkan {
                what: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    fn recreate(&mut self) -> VkResult<()> {
        self.swapchains.recreate(&self.scene, &self.recorder)
    }
}

pub struct VkRenderer {
    scheduler: FrameScheduler<VkFrameSlot>,
    state: RenderState,
    resized: bool,
    ctx: Arc<DeviceContext>,
}

impl Renderer for VkRenderer {
    fn initialize(
        host: Arc<dyn WindowHost>,
        scene: &SceneDesc,
        settings: RenderSettings,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(&*host, settings.validation)?;
        let uploads = UploadPipeline::new(&ctx)?;
        let resources = SceneResources::upload(&uploads, scene)?;
        let recorder = CommandRecorder::new(&ctx, settings.clear_color)?;
        let swapchains = SwapchainManager::new(
            &ctx,
            host,
            settings.vsync_mode,
            scene.shaders.clone(),
            &resources,
            &recorder,
        )?;
        let scheduler =
            FrameScheduler::new(VkFrameSlot::create_all(&ctx, settings.frames_in_flight())?);
        info!(
            "vk: renderer ready ({} frames in flight)",
            scheduler.frames_in_flight()
        );

        Ok(Self {
            scheduler,
            state: RenderState {
                swapchains,
                recorder,
                scene: resources,
                ctx: Arc::clone(&ctx),
                clock: Instant::now(),
            },
            resized: false,
            ctx,
        })
    }

    fn resize(&mut self, size: RenderSize) {
        debug!("vk: resize to {}x{}", size.width, size.height);
        self.resized = true;
    }

    fn draw_frame(&mut self) -> Result<()> {
        let resized = std::mem::take(&mut self.resized);
        self.scheduler.draw_frame(&mut self.state, resized)?;
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        if self.state.recorder.set_clear_color(rgba) {
            self.state.swapchains.mark_all_stale();
        }
    }

    fn destroy(self) {
        drop(self);
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            warn!("vk: wait idle before teardown failed: {e}");
        }
        info!("vk: renderer destroyed");
    }
}
