// SPDX-License-Identifier: CEPL-1.0
//! Per-image descriptor sets: binding 0 is the uniform block, binding 1 the texture.

use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{VkContext, VkError, VkResult};
use crate::memory::DeviceBuffer;
use crate::owned::Owned;
use crate::upload::Texture;

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub fn create_set_layout(ctx: &Arc<DeviceContext>) -> VkResult<Owned<vk::DescriptorSetLayout>> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX),
        vk::DescriptorSetLayoutBinding::default()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
    ];
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let layout = unsafe { ctx.device().create_descriptor_set_layout(&info, None) }
        .vk("vkCreateDescriptorSetLayout")?;
    Ok(Owned::new(ctx, layout))
}

/// One uniform buffer and one combined image sampler per swapchain image.
pub fn pool_sizes(image_count: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: image_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: image_count,
        },
    ]
}

/// Pool plus one set per image. Sets are freed with the pool.
pub struct DescriptorSets {
    sets: Vec<vk::DescriptorSet>,
    pool: Owned<vk::DescriptorPool>,
}

impl DescriptorSets {
    pub fn allocate(
        ctx: &Arc<DeviceContext>,
        layout: vk::DescriptorSetLayout,
        image_count: u32,
    ) -> VkResult<Self> {
        let sizes = pool_sizes(image_count);
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&sizes)
            .max_sets(image_count);
        let pool = Owned::new(
            ctx,
            unsafe { ctx.device().create_descriptor_pool(&info, None) }
                .vk("vkCreateDescriptorPool")?,
        );

        let layouts = vec![layout; image_count as usize];
        let alloc = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool.raw())
            .set_layouts(&layouts);
        let sets = unsafe { ctx.device().allocate_descriptor_sets(&alloc) }
            .vk("vkAllocateDescriptorSets")?;

        Ok(Self { sets, pool })
    }

    pub fn get(&self, index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Points both bindings of set `index` at `uniform` and `texture`.
    pub fn write(&self, index: usize, uniform: &DeviceBuffer, texture: &Texture) -> VkResult<()> {
        let set = self.get(index).ok_or(VkError::NoSuchImage {
            index,
            count: self.len(),
        })?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: uniform.raw(),
            offset: 0,
            range: uniform.size(),
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: texture.sampler(),
            image_view: texture.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info),
        ];
        unsafe { self.pool.context().device().update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}
