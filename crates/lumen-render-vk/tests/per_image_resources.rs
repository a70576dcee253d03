// SPDX-License-Identifier: CEPL-1.0
//! Per-image resources on a real device; swapchains use a
//! `VK_EXT_headless_surface` surface. Without one every test logs and passes.

use std::cell::Cell;
use std::sync::Arc;

use ash::vk;
use lumen_render::{MeshData, RenderSize, SceneDesc, TextureData, Vertex, VsyncMode, WindowHost};
use lumen_render_vk::descriptor::{create_set_layout, DescriptorSets};
use lumen_render_vk::recorder::CommandRecorder;
use lumen_render_vk::scene::SceneResources;
use lumen_render_vk::swapchain::{Generation, SwapchainManager};
use lumen_render_vk::{
    shaders, BufferUsage, DeviceBuffer, DeviceContext, MemoryProperty, UploadPipeline, VkError,
};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};

fn usable(ctx: Result<Arc<DeviceContext>, VkError>) -> Option<Arc<DeviceContext>> {
    lumen_core::init_test_tracing();
    match ctx {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            tracing::warn!("skipping: {e}");
            None
        }
    }
}

/// Reports `size`; every event poll switches to `after_wait`.
struct ResizableHost {
    size: Cell<RenderSize>,
    after_wait: Cell<RenderSize>,
    waits: Cell<usize>,
}

impl ResizableHost {
    fn new(size: RenderSize) -> Self {
        Self {
            size: Cell::new(size),
            after_wait: Cell::new(size),
            waits: Cell::new(0),
        }
    }
}

impl HasWindowHandle for ResizableHost {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl HasDisplayHandle for ResizableHost {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl WindowHost for ResizableHost {
    fn framebuffer_size(&self) -> RenderSize {
        self.size.get()
    }

    fn wait_events(&self) {
        self.waits.set(self.waits.get() + 1);
        self.size.set(self.after_wait.get());
    }
}

fn quad_scene() -> SceneDesc {
    let v = |x: f32, y: f32| Vertex {
        position: [x, y, 0.0],
        texcoords: [x + 0.5, y + 0.5],
        color: [1.0, 1.0, 1.0],
    };
    SceneDesc {
        mesh: MeshData {
            vertices: vec![v(-0.5, -0.5), v(0.5, -0.5), v(0.5, 0.5), v(-0.5, 0.5)],
            indices: vec![0, 1, 2, 2, 3, 0],
        },
        texture: TextureData::white(),
        shaders: shaders::builtin().unwrap(),
    }
}

fn assert_complete(generation: &Generation) {
    let count = generation.image_count();
    assert!(count >= 1);
    assert_eq!(count, generation.state().image_count());
    assert_eq!(generation.images().len(), count);

    let extent = generation.state().extent();
    assert!(extent.width > 0 && extent.height > 0);

    for (i, res) in generation.images().iter().enumerate() {
        assert_ne!(res.framebuffer(), vk::Framebuffer::null(), "image {i}");
        assert_ne!(res.command_buffer(), vk::CommandBuffer::null(), "image {i}");
        assert_ne!(res.uniform_buffer(), vk::Buffer::null(), "image {i}");
        assert_ne!(res.descriptor_set(), vk::DescriptorSet::null(), "image {i}");
        assert!(generation.image_in_use(i as u32).is_none());
    }
    assert!(matches!(
        generation.image(count as u32),
        Err(VkError::NoSuchImage { .. })
    ));
}

#[test]
fn every_generation_has_complete_per_image_resources() {
    let Some(ctx) = usable(DeviceContext::offscreen(false)) else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();
    let desc = quad_scene();
    let scene = SceneResources::upload(&uploads, &desc).unwrap();
    let recorder = CommandRecorder::new(&ctx, [0.0, 0.0, 0.0, 1.0]).unwrap();

    let host = Arc::new(ResizableHost::new(RenderSize::new(640, 480)));
    let mut swapchains = SwapchainManager::new(
        &ctx,
        Arc::clone(&host) as Arc<dyn WindowHost>,
        VsyncMode::Fifo,
        desc.shaders.clone(),
        &scene,
        &recorder,
    )
    .unwrap();

    let generation = swapchains.generation().unwrap();
    assert_complete(generation);
    assert_eq!(generation.state().present_mode(), vk::PresentModeKHR::FIFO);

    for size in [
        RenderSize::new(1, 1),
        RenderSize::new(1920, 1080),
        RenderSize::new(300, 900),
    ] {
        host.size.set(size);
        host.after_wait.set(size);
        swapchains.recreate(&scene, &recorder).unwrap();
        assert_complete(swapchains.generation().unwrap());
    }
    assert_eq!(host.waits.get(), 0);

    // Minimized: recreation waits until the host reports a size again.
    host.size.set(RenderSize::ZERO);
    host.after_wait.set(RenderSize::new(800, 600));
    swapchains.recreate(&scene, &recorder).unwrap();
    assert_eq!(host.waits.get(), 1);
    assert_complete(swapchains.generation().unwrap());
}

#[test]
fn descriptor_write_rejects_a_missing_set() {
    let Some(ctx) = usable(DeviceContext::headless(false)) else { return };
    let uploads = UploadPipeline::new(&ctx).unwrap();
    let texture = uploads.upload_texture(&TextureData::white()).unwrap();
    let uniform = DeviceBuffer::new(
        &ctx,
        64,
        BufferUsage::UNIFORM,
        MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
    )
    .unwrap();

    let layout = create_set_layout(&ctx).unwrap();
    let sets = DescriptorSets::allocate(&ctx, layout.raw(), 2).unwrap();
    assert_eq!(sets.len(), 2);
    sets.write(1, &uniform, &texture).unwrap();
    assert!(matches!(
        sets.write(2, &uniform, &texture),
        Err(VkError::NoSuchImage { index: 2, count: 2 })
    ));
}
