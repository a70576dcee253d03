// SPDX-License-Identifier: CEPL-1.0
//! Renderer-side option sets and their native Vulkan equivalents.
//!
//! Each category keeps one mapping table; the const assertions below make a
//! missing or extra row a compile error instead of a silently dropped bit.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryProperty: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
    }
}

const MEMORY_PROPERTY_TABLE: [(MemoryProperty, vk::MemoryPropertyFlags); 4] = [
    (MemoryProperty::DEVICE_LOCAL, vk::MemoryPropertyFlags::DEVICE_LOCAL),
    (MemoryProperty::HOST_VISIBLE, vk::MemoryPropertyFlags::HOST_VISIBLE),
    (MemoryProperty::HOST_COHERENT, vk::MemoryPropertyFlags::HOST_COHERENT),
    (MemoryProperty::HOST_CACHED, vk::MemoryPropertyFlags::HOST_CACHED),
];

const BUFFER_USAGE_TABLE: [(BufferUsage, vk::BufferUsageFlags); 6] = [
    (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
    (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
    (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
    (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
    (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
];

const _: () =
    assert!(MEMORY_PROPERTY_TABLE.len() == MemoryProperty::all().bits().count_ones() as usize);
const _: () =
    assert!(BUFFER_USAGE_TABLE.len() == BufferUsage::all().bits().count_ones() as usize);

impl MemoryProperty {
    pub fn to_vk(self) -> vk::MemoryPropertyFlags {
        MEMORY_PROPERTY_TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(vk::MemoryPropertyFlags::empty(), |acc, (_, native)| acc | *native)
    }
}

impl BufferUsage {
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        BUFFER_USAGE_TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(vk::BufferUsageFlags::empty(), |acc, (_, native)| acc | *native)
    }
}

/// The image layouts the renderer ever asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    ColorAttachment,
    PresentSrc,
}

impl ImageLayout {
    pub const fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}
