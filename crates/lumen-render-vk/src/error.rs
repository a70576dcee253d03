// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

use crate::flags::{ImageLayout, MemoryProperty};

#[derive(Debug, Error)]
pub enum VkError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{what} failed: {result}")]
    Vulkan {
        what: &'static str,
        result: vk::Result,
    },

    #[error("no GPU satisfies the renderer requirements ({reason})")]
    NoSuitableDevice { reason: String },

    #[error("required extension {0} is not available")]
    MissingExtension(String),

    #[error("unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition { old: ImageLayout, new: ImageLayout },

    #[error("no memory type in mask {type_bits:#b} has properties {properties:?}")]
    NoMemoryType {
        type_bits: u32,
        properties: MemoryProperty,
    },

    #[error("refusing to upload an empty buffer")]
    EmptyUpload,

    #[error("buffer memory is not host visible")]
    NotHostVisible,

    #[error("write ends at byte {end}, buffer holds {size}")]
    OutOfRange { end: usize, size: u64 },

    #[error("textures must have 1 to 4 channels, got {0}")]
    UnsupportedChannels(u8),

    #[error("texture data holds {actual} bytes, expected {expected}")]
    InvalidTexture { expected: usize, actual: usize },

    #[error("invalid shader: {0}")]
    InvalidShader(&'static str),

    #[error("failed to record command buffer for image {image}: {result}")]
    RecordFailed { image: u32, result: vk::Result },

    #[error("image index {index} is out of range for {count} per-image entries")]
    NoSuchImage { index: usize, count: usize },

    #[error("no swapchain is currently available")]
    SwapchainUnavailable,

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
}

pub type VkResult<T> = std::result::Result<T, VkError>;

/// Attaches the name of the failing call to a raw `vk::Result`.
pub(crate) trait VkContext<T> {
    fn vk(self, what: &'static str) -> VkResult<T>;
}

impl<T> VkContext<T> for Result<T, vk::Result> {
    fn vk(self, what: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::Vulkan { what, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_names_the_call() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = r.vk("vkAllocateMemory").unwrap_err();
        assert!(err.to_string().starts_with("vkAllocateMemory failed"));
    }

    #[test]
    fn transition_error_is_descriptive() {
        let err = VkError::UnsupportedTransition {
            old: ImageLayout::ShaderReadOnly,
            new: ImageLayout::TransferDst,
        };
        assert_eq!(
            err.to_string(),
            "unsupported layout transition ShaderReadOnly -> TransferDst"
        );
    }

    #[test]
    fn window_handle_error_keeps_its_source() {
        let err = VkError::from(raw_window_handle::HandleError::Unavailable);
        assert!(matches!(err, VkError::WindowHandle(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
