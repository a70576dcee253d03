// SPDX-License-Identifier: CEPL-1.0
//! Buffers and images with their own dedicated allocation.

use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::flags::{BufferUsage, MemoryProperty};
use crate::owned::Owned;

/// First memory type allowed by `type_bits` whose flags are a superset of `wanted`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    wanted: MemoryProperty,
) -> VkResult<u32> {
    let native = wanted.to_vk();
    (0..props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(native)
        })
        .ok_or(VkError::NoMemoryType {
            type_bits,
            properties: wanted,
        })
}

fn allocate(
    ctx: &Arc<DeviceContext>,
    reqs: vk::MemoryRequirements,
    wanted: MemoryProperty,
) -> VkResult<Owned<vk::DeviceMemory>> {
    let type_index = find_memory_type(ctx.memory_properties(), reqs.memory_type_bits, wanted)?;
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(reqs.size)
        .memory_type_index(type_index);
    let memory =
        unsafe { ctx.device().allocate_memory(&info, None) }.vk("vkAllocateMemory")?;
    Ok(Owned::new(ctx, memory))
}

/// A buffer bound to its own allocation. The buffer is destroyed before the memory is freed.
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: Owned<vk::Buffer>,
    memory: Owned<vk::DeviceMemory>,
    size: vk::DeviceSize,
    properties: MemoryProperty,
}

impl DeviceBuffer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: BufferUsage,
        properties: MemoryProperty,
    ) -> VkResult<Self> {
        if size == 0 {
            return Err(VkError::EmptyUpload);
        }
        let device = ctx.device();
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = Owned::new(
            ctx,
            unsafe { device.create_buffer(&info, None) }.vk("vkCreateBuffer")?,
        );

        let reqs = unsafe { device.get_buffer_memory_requirements(buffer.raw()) };
        let memory = allocate(ctx, reqs, properties)?;
        unsafe { device.bind_buffer_memory(buffer.raw(), memory.raw(), 0) }
            .vk("vkBindBufferMemory")?;

        Ok(Self {
            buffer,
            memory,
            size,
            properties,
        })
    }

    /// Host-visible, coherent buffer filled with `bytes`.
    pub fn with_data(
        ctx: &Arc<DeviceContext>,
        bytes: &[u8],
        usage: BufferUsage,
    ) -> VkResult<Self> {
        let buf = Self::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            usage,
            MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
        )?;
        buf.write(0, bytes)?;
        Ok(buf)
    }

    #[inline]
    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn map(&self) -> VkResult<*mut u8> {
        if !self.properties.contains(MemoryProperty::HOST_VISIBLE) {
            return Err(VkError::NotHostVisible);
        }
        let ptr = unsafe {
            self.memory.context().device().map_memory(
                self.memory.raw(),
                0,
                self.size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .vk("vkMapMemory")?;
        Ok(ptr.cast())
    }

    fn unmap(&self) {
        unsafe { self.memory.context().device().unmap_memory(self.memory.raw()) };
    }

    /// Copies `bytes` into the mapped allocation starting at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> VkResult<()> {
        let end = offset.saturating_add(bytes.len());
        if end as vk::DeviceSize > self.size {
            return Err(VkError::OutOfRange {
                end,
                size: self.size,
            });
        }
        let ptr = self.map()?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len()) };
        self.unmap();
        Ok(())
    }

    /// Copies the whole allocation back to the host.
    pub fn read(&self) -> VkResult<Vec<u8>> {
        let len = self.size as usize;
        let ptr = self.map()?;
        let mut out = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
        self.unmap();
        Ok(out)
    }
}

/// A 2D, single mip, single layer, optimally tiled image in device-local memory.
#[derive(Debug)]
pub struct DeviceImage {
    image: Owned<vk::Image>,
    _memory: Owned<vk::DeviceMemory>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl DeviceImage {
    pub fn new_2d(
        ctx: &Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> VkResult<Self> {
        let device = ctx.device();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);
        let image = Owned::new(
            ctx,
            unsafe { device.create_image(&info, None) }.vk("vkCreateImage")?,
        );

        let reqs = unsafe { device.get_image_memory_requirements(image.raw()) };
        let memory = allocate(ctx, reqs, MemoryProperty::DEVICE_LOCAL)?;
        unsafe { device.bind_image_memory(image.raw(), memory.raw(), 0) }
            .vk("vkBindImageMemory")?;

        Ok(Self {
            image,
            _memory: memory,
            format,
            extent,
        })
    }

    #[inline]
    pub fn raw(&self) -> vk::Image {
        self.image.raw()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

pub fn create_image_view(
    ctx: &Arc<DeviceContext>,
    image: vk::Image,
    format: vk::Format,
) -> VkResult<Owned<vk::ImageView>> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(color_subresource_range());
    let view = unsafe { ctx.device().create_image_view(&info, None) }.vk("vkCreateImageView")?;
    Ok(Owned::new(ctx, view))
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
