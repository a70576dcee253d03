// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkResult};
use crate::owned::Owned;
use crate::scheduler::FrameSlot;

/// Semaphores and fence for one frame in flight.
#[derive(Debug)]
pub struct VkFrameSlot {
    image_acquired: Owned<vk::Semaphore>,
    render_finished: Owned<vk::Semaphore>,
    in_flight: Owned<vk::Fence>,
}

impl VkFrameSlot {
    pub fn new(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        let device = ctx.device();
        let sem_info = vk::SemaphoreCreateInfo::default();
        // Signaled so the first wait on a fresh slot returns immediately.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let image_acquired = Owned::new(
            ctx,
            unsafe { device.create_semaphore(&sem_info, None) }.vk("vkCreateSemaphore")?,
        );
        let render_finished = Owned::new(
            ctx,
            unsafe { device.create_semaphore(&sem_info, None) }.vk("vkCreateSemaphore")?,
        );
        let in_flight = Owned::new(
            ctx,
            unsafe { device.create_fence(&fence_info, None) }.vk("vkCreateFence")?,
        );

        Ok(Self {
            image_acquired,
            render_finished,
            in_flight,
        })
    }

    pub fn create_all(ctx: &Arc<DeviceContext>, count: usize) -> VkResult<Vec<Self>> {
        (0..count).map(|_| Self::new(ctx)).collect()
    }

    pub fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired.raw()
    }

    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished.raw()
    }
}

impl FrameSlot for VkFrameSlot {
    type Fence = vk::Fence;

    fn in_flight(&self) -> vk::Fence {
        self.in_flight.raw()
    }
}
