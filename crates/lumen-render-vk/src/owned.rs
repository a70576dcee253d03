// SPDX-License-Identifier: CEPL-1.0
//! Scoped ownership of device-level handles.
//!
//! Every handle is wrapped in an [`Owned`] that keeps the [`DeviceContext`]
//! alive and destroys the handle on drop. Composite resources release their
//! parts in field declaration order, so field order is destruction order.

use std::fmt;
use std::sync::Arc;

use ash::vk::{self, Handle};
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::{VkContext, VkResult};

pub trait DeviceObject: Handle + Copy + fmt::Debug {
    const NAME: &'static str;

    /// # Safety
    /// The GPU must no longer use the handle, and it must not be destroyed twice.
    unsafe fn destroy(self, ctx: &DeviceContext);
}

macro_rules! device_object {
    ($($ty:ident => $destroy:ident),* $(,)?) => {$(
        impl DeviceObject for vk::$ty {
            const NAME: &'static str = stringify!($ty);

            unsafe fn destroy(self, ctx: &DeviceContext) {
                unsafe { ctx.device().$destroy(self, None) }
            }
        }
    )*};
}

device_object! {
    Buffer => destroy_buffer,
    DeviceMemory => free_memory,
    Image => destroy_image,
    ImageView => destroy_image_view,
    Sampler => destroy_sampler,
    Framebuffer => destroy_framebuffer,
    RenderPass => destroy_render_pass,
    ShaderModule => destroy_shader_module,
    Pipeline => destroy_pipeline,
    PipelineLayout => destroy_pipeline_layout,
    DescriptorSetLayout => destroy_descriptor_set_layout,
    DescriptorPool => destroy_descriptor_pool,
    CommandPool => destroy_command_pool,
    Semaphore => destroy_semaphore,
    Fence => destroy_fence,
}

impl DeviceObject for vk::SwapchainKHR {
    const NAME: &'static str = "SwapchainKHR";

    unsafe fn destroy(self, ctx: &DeviceContext) {
        match ctx.swapchain_loader() {
            Ok(loader) => unsafe { loader.destroy_swapchain(self, None) },
            Err(e) => warn!("vk: leaking swapchain: {e}"),
        }
    }
}

pub struct Owned<H: DeviceObject> {
    ctx: Arc<DeviceContext>,
    raw: H,
}

impl<H: DeviceObject> Owned<H> {
    /// Takes ownership of a freshly created handle.
    pub fn new(ctx: &Arc<DeviceContext>, raw: H) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            raw,
        }
    }

    #[inline]
    pub fn raw(&self) -> H {
        self.raw
    }

    #[inline]
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }
}

impl<H: DeviceObject> fmt::Debug for Owned<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", H::NAME, self.raw.as_raw())
    }
}

impl<H: DeviceObject> Drop for Owned<H> {
    fn drop(&mut self) {
        if self.raw.as_raw() == 0 {
            return;
        }
        unsafe { self.raw.destroy(&self.ctx) };
        debug!("vk: destroyed {}", H::NAME);
    }
}

/// Command buffers allocated from a pool that outlives them.
///
/// Holders must drop this before the pool's [`Owned`] wrapper.
pub struct CommandBuffers {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    raw: Vec<vk::CommandBuffer>,
}

impl CommandBuffers {
    pub fn allocate(pool: &Owned<vk::CommandPool>, count: u32) -> VkResult<Self> {
        let ctx = pool.context();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.raw())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let raw = unsafe { ctx.device().allocate_command_buffers(&info) }
            .vk("vkAllocateCommandBuffers")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool: pool.raw(),
            raw,
        })
    }

    pub fn get(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.raw.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if self.raw.is_empty() {
            return;
        }
        unsafe { self.ctx.device().free_command_buffers(self.pool, &self.raw) };
    }
}
