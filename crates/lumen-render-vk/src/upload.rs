// SPDX-License-Identifier: CEPL-1.0
//! Synchronous staging uploads, readbacks and texture creation.
//!
//! Every operation records a one-time-submit command buffer, submits it to the
//! graphics queue and waits for the queue to go idle before returning. Uploads
//! happen at load time only, never per frame.

use std::sync::Arc;

use ash::vk;
use lumen_render::TextureData;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::flags::{BufferUsage, ImageLayout, MemoryProperty};
use crate::memory::{color_subresource_range, create_image_view, DeviceBuffer, DeviceImage};
use crate::owned::{CommandBuffers, Owned};

const MAX_ANISOTROPY: f32 = 16.0;

/// Stage and access masks for one layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// The closed set of transitions the upload path performs.
pub fn barrier_for(old: ImageLayout, new: ImageLayout) -> VkResult<TransitionBarrier> {
    match (old, new) {
        (ImageLayout::Undefined, ImageLayout::TransferDst) => Ok(TransitionBarrier {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
        }),
        (ImageLayout::TransferDst, ImageLayout::ShaderReadOnly) => Ok(TransitionBarrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
        }),
        _ => Err(VkError::UnsupportedTransition { old, new }),
    }
}

/// Expands tightly packed 1..=4 channel pixels to RGBA8.
pub fn expand_to_rgba8(tex: &TextureData) -> VkResult<Vec<u8>> {
    if !(1..=4).contains(&tex.channels) {
        return Err(VkError::UnsupportedChannels(tex.channels));
    }
    if tex.pixels.len() != tex.expected_len() {
        return Err(VkError::InvalidTexture {
            expected: tex.expected_len(),
            actual: tex.pixels.len(),
        });
    }

    let pixels = tex.pixels.chunks_exact(tex.channels as usize);
    let rgba = match tex.channels {
        4 => return Ok(tex.pixels.clone()),
        3 => pixels.flat_map(|p| [p[0], p[1], p[2], 255]).collect(),
        2 => pixels.flat_map(|p| [p[0], p[0], p[0], p[1]]).collect(),
        _ => pixels.flat_map(|p| [p[0], p[0], p[0], 255]).collect(),
    };
    Ok(rgba)
}

/// A sampled texture. The sampler and view are released before the image.
#[derive(Debug)]
pub struct Texture {
    sampler: Owned<vk::Sampler>,
    view: Owned<vk::ImageView>,
    image: DeviceImage,
}

impl Texture {
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.raw()
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.raw()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

pub struct UploadPipeline {
    ctx: Arc<DeviceContext>,
    pool: Owned<vk::CommandPool>,
}

impl UploadPipeline {
    pub fn new(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.families().graphics);
        let pool = unsafe { ctx.device().create_command_pool(&info, None) }
            .vk("vkCreateCommandPool")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            pool: Owned::new(ctx, pool),
        })
    }

    fn one_shot(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> VkResult<()> {
        let device = self.ctx.device();
        let buffers = CommandBuffers::allocate(&self.pool, 1)?;
        let cmd = buffers.get(0).ok_or(VkError::Vulkan {
            what: "vkAllocateCommandBuffers",
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        })?;

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin) }.vk("vkBeginCommandBuffer")?;
        record(device, cmd);
        unsafe { device.end_command_buffer(cmd) }.vk("vkEndCommandBuffer")?;

        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        let queue = self.ctx.graphics_queue();
        unsafe {
            device
                .queue_submit(queue, &[submit], vk::Fence::null())
                .vk("vkQueueSubmit")?;
            device.queue_wait_idle(queue).vk("vkQueueWaitIdle")?;
        }
        Ok(())
    }

    /// Copies `data` into a new device-local buffer with `usage | TRANSFER_DST`.
    ///
    /// The destination also carries `TRANSFER_SRC` so it can be read back.
    pub fn stage_upload(&self, data: &[u8], usage: BufferUsage) -> VkResult<DeviceBuffer> {
        if data.is_empty() {
            return Err(VkError::EmptyUpload);
        }
        let staging = DeviceBuffer::with_data(&self.ctx, data, BufferUsage::TRANSFER_SRC)?;
        let dst = DeviceBuffer::new(
            &self.ctx,
            staging.size(),
            usage | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryProperty::DEVICE_LOCAL,
        )?;

        self.copy_buffer(&staging, &dst)?;
        debug!("vk: staged {} bytes ({usage:?})", data.len());
        Ok(dst)
    }

    /// Copies a device buffer into host-visible memory and returns its bytes.
    pub fn read_back(&self, src: &DeviceBuffer) -> VkResult<Vec<u8>> {
        let readback = DeviceBuffer::new(
            &self.ctx,
            src.size(),
            BufferUsage::TRANSFER_DST,
            MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
        )?;
        self.copy_buffer(src, &readback)?;
        readback.read()
    }

    fn copy_buffer(&self, src: &DeviceBuffer, dst: &DeviceBuffer) -> VkResult<()> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size().min(dst.size()),
        };
        self.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src.raw(), dst.raw(), &[region]);
        })
    }

    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        old: ImageLayout,
        new: ImageLayout,
    ) -> VkResult<()> {
        let b = barrier_for(old, new)?;
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old.to_vk())
            .new_layout(new.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .src_access_mask(b.src_access)
            .dst_access_mask(b.dst_access);

        self.one_shot(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                b.src_stage,
                b.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    pub fn copy_buffer_to_image(
        &self,
        buffer: &DeviceBuffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> VkResult<()> {
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                buffer.raw(),
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    /// Uploads pixels into an sRGB image ready for sampling in fragment shaders.
    pub fn upload_texture(&self, tex: &TextureData) -> VkResult<Texture> {
        let rgba = expand_to_rgba8(tex)?;
        let staging = DeviceBuffer::with_data(&self.ctx, &rgba, BufferUsage::TRANSFER_SRC)?;

        let extent = vk::Extent2D {
            width: tex.width,
            height: tex.height,
        };
        let format = vk::Format::R8G8B8A8_SRGB;
        let image = DeviceImage::new_2d(
            &self.ctx,
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        self.transition_image_layout(
            image.raw(),
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        )?;
        self.copy_buffer_to_image(&staging, image.raw(), extent)?;
        self.transition_image_layout(
            image.raw(),
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        )?;
        drop(staging);

        let view = create_image_view(&self.ctx, image.raw(), image.format())?;
        let sampler = self.create_sampler()?;
        debug!("vk: texture {}x{} uploaded", tex.width, tex.height);

        Ok(Texture {
            sampler,
            view,
            image,
        })
    }

    fn create_sampler(&self) -> VkResult<Owned<vk::Sampler>> {
        let anisotropy = self.ctx.anisotropy_enabled();
        let max_anisotropy = self
            .ctx
            .properties()
            .limits
            .max_sampler_anisotropy
            .min(MAX_ANISOTROPY);

        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        let sampler =
            unsafe { self.ctx.device().create_sampler(&info, None) }.vk("vkCreateSampler")?;
        Ok(Owned::new(&self.ctx, sampler))
    }
}
