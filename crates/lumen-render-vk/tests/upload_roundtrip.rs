// SPDX-License-Identifier: CEPL-1.0
//! Needs a Vulkan loader and device; without one every test logs and passes.

use std::sync::Arc;

use ash::vk;
use lumen_render::TextureData;
use lumen_render_vk::{
    BufferUsage, DeviceContext, DeviceImage, ImageLayout, UploadPipeline, VkError,
};

fn headless() -> Option<Arc<DeviceContext>> {
    lumen_core::init_test_tracing();
    match DeviceContext::headless(false) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            tracing::warn!("skipping: no usable Vulkan device ({e})");
            None
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn staged_bytes_read_back_unchanged() {
    let Some(ctx) = headless() else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();

    for len in [1, 64, 1 << 20] {
        let data = pattern(len);
        let buffer = uploads.stage_upload(&data, BufferUsage::STORAGE).unwrap();
        assert_eq!(buffer.size(), len as u64);
        assert_eq!(uploads.read_back(&buffer).unwrap(), data, "len={len}");
    }
}

#[test]
fn empty_upload_is_rejected() {
    let Some(ctx) = headless() else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();
    assert!(matches!(
        uploads.stage_upload(&[], BufferUsage::VERTEX),
        Err(VkError::EmptyUpload)
    ));
}

#[test]
fn image_follows_the_upload_transitions_only() {
    let Some(ctx) = headless() else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();
    let image = DeviceImage::new_2d(
        &ctx,
        vk::Extent2D {
            width: 4,
            height: 4,
        },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
    )
    .unwrap();

    uploads
        .transition_image_layout(image.raw(), ImageLayout::Undefined, ImageLayout::TransferDst)
        .unwrap();
    uploads
        .transition_image_layout(
            image.raw(),
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        )
        .unwrap();

    let err = uploads
        .transition_image_layout(
            image.raw(),
            ImageLayout::ShaderReadOnly,
            ImageLayout::TransferDst,
        )
        .unwrap_err();
    assert!(matches!(err, VkError::UnsupportedTransition { .. }));
}

#[test]
fn rgb_texture_uploads() {
    let Some(ctx) = headless() else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();
    let tex = TextureData {
        width: 2,
        height: 2,
        channels: 3,
        pixels: pattern(12),
    };
    let texture = uploads.upload_texture(&tex).unwrap();
    assert_eq!(
        texture.extent(),
        vk::Extent2D {
            width: 2,
            height: 2
        }
    );
}
