// SPDX-License-Identifier: CEPL-1.0
//! Presentable images and everything sized by them.
//!
//! A [`Generation`] bundles the swapchain with the per-image framebuffers,
//! uniform buffers, descriptor sets and command buffers plus the render pass
//! and pipeline built for its format. It is created in one piece and dropped
//! in one piece; [`SwapchainManager::recreate`] never patches it in place.

use std::sync::Arc;

use ash::vk;
use lumen_render::{RenderSize, ShaderCode, VsyncMode, WindowHost};
use tracing::{debug, info};

use crate::context::{DeviceContext, QueueFamilyIndices};
use crate::descriptor::{create_set_layout, DescriptorSets};
use crate::error::{VkContext, VkError, VkResult};
use crate::flags::{BufferUsage, MemoryProperty};
use crate::memory::{create_image_view, DeviceBuffer};
use crate::owned::{CommandBuffers, Owned};
use crate::pipeline::{create_framebuffer, create_render_pass, GraphicsPipeline};
use crate::recorder::{CommandRecorder, DrawTarget};
use crate::scene::SceneResources;
use crate::uniforms::UniformMatrices;

/// First 8-bit sRGB format, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            matches!(
                f.format,
                vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
            ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is always available, so it is the fallback for every preference.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: VsyncMode) -> vk::PresentModeKHR {
    match vsync {
        VsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// The surface's fixed extent, or the framebuffer size clamped to the capability bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, size: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: size
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: size
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum; a maximum of zero means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub fn sharing_mode(families: QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Blocks while the framebuffer has a zero axis, e.g. when minimized.
///
/// `surface_extent` is asked first; the host's size is only used when the
/// surface leaves the extent to the swapchain. Returns the first non-empty
/// size and how many event polls it took.
pub fn wait_for_framebuffer(
    host: &dyn WindowHost,
    surface_extent: impl Fn() -> Option<RenderSize>,
) -> (RenderSize, usize) {
    let mut polls = 0;
    loop {
        let size = surface_extent().unwrap_or_else(|| host.framebuffer_size());
        if !size.is_empty() {
            return (size, polls);
        }
        if polls == 0 {
            info!("vk: framebuffer is empty, waiting for the window to be restored");
        }
        host.wait_events();
        polls += 1;
    }
}

/// The surface's current extent, or `None` when it is defined by the swapchain.
fn current_surface_extent(ctx: &DeviceContext) -> Option<RenderSize> {
    let (loader, surface) = ctx.surface().ok()?;
    let caps =
        unsafe { loader.get_physical_device_surface_capabilities(ctx.physical(), surface) }.ok()?;
    (caps.current_extent.width != u32::MAX)
        .then(|| RenderSize::new(caps.current_extent.width, caps.current_extent.height))
}

/// Swapchain handle with its images and views. Views are destroyed first.
pub struct SwapchainState {
    views: Vec<Owned<vk::ImageView>>,
    swapchain: Owned<vk::SwapchainKHR>,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl SwapchainState {
    fn create(
        ctx: &Arc<DeviceContext>,
        size: RenderSize,
        vsync: VsyncMode,
    ) -> VkResult<Self> {
        let (surface_loader, surface) = ctx.surface()?;
        let loader = ctx.swapchain_loader()?;
        let physical = ctx.physical();

        let (caps, formats, modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical, surface)
                    .vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                surface_loader
                    .get_physical_device_surface_formats(physical, surface)
                    .vk("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical, surface)
                    .vk("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };

        let format = choose_surface_format(&formats).ok_or(VkError::NoSuitableDevice {
            reason: "surface reports no formats".to_owned(),
        })?;
        let present_mode = choose_present_mode(&modes, vsync);
        let extent = choose_extent(&caps, size);
        let image_count = choose_image_count(&caps);
        let (sharing, family_indices) = sharing_mode(ctx.families());

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = Owned::new(
            ctx,
            unsafe { loader.create_swapchain(&info, None) }.vk("vkCreateSwapchainKHR")?,
        );
        let images = unsafe { loader.get_swapchain_images(swapchain.raw()) }
            .vk("vkGetSwapchainImagesKHR")?;
        let views = images
            .iter()
            .map(|&image| create_image_view(ctx, image, format.format))
            .collect::<VkResult<Vec<_>>>()?;

        info!(
            "vk: swapchain {}x{} ({} images, {:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        Ok(Self {
            views,
            swapchain,
            images,
            format,
            extent,
            present_mode,
        })
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.swapchain.raw()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

/// Resources tied to one swapchain image.
pub struct PerImageResources {
    framebuffer: Owned<vk::Framebuffer>,
    uniform: DeviceBuffer,
    command_buffer: vk::CommandBuffer,
    descriptor_set: vk::DescriptorSet,
    /// Fence of the frame slot whose submission last read this image.
    in_use: Option<vk::Fence>,
    needs_record: bool,
}

impl PerImageResources {
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer.raw()
    }

    pub fn uniform_buffer(&self) -> vk::Buffer {
        self.uniform.raw()
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

// Field order is teardown order: per-image objects before the pool, pipeline,
// render pass and finally the swapchain views they reference.
pub struct Generation {
    images: Vec<PerImageResources>,
    _command_buffers: CommandBuffers,
    _descriptors: DescriptorSets,
    pipeline: GraphicsPipeline,
    render_pass: Owned<vk::RenderPass>,
    state: SwapchainState,
}

impl Generation {
    fn build(
        ctx: &Arc<DeviceContext>,
        size: RenderSize,
        vsync: VsyncMode,
        shaders: &ShaderCode,
        set_layout: vk::DescriptorSetLayout,
        scene: &SceneResources,
        recorder: &CommandRecorder,
    ) -> VkResult<Self> {
        let state = SwapchainState::create(ctx, size, vsync)?;
        let render_pass = create_render_pass(ctx, state.format.format)?;
        let pipeline = GraphicsPipeline::new(ctx, render_pass.raw(), set_layout, shaders)?;

        let count = state.image_count();
        let descriptors = DescriptorSets::allocate(ctx, set_layout, count as u32)?;
        let command_buffers = recorder.allocate(count as u32)?;

        let mut images = Vec::with_capacity(state.image_count());
        for (i, view) in state.views.iter().enumerate() {
            let framebuffer = create_framebuffer(ctx, render_pass.raw(), view.raw(), state.extent)?;
            let uniform = DeviceBuffer::new(
                ctx,
                UniformMatrices::SIZE,
                BufferUsage::UNIFORM,
                MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
            )?;
            descriptors.write(i, &uniform, &scene.texture)?;

            let missing = || VkError::NoSuchImage { index: i, count };
            images.push(PerImageResources {
                framebuffer,
                uniform,
                command_buffer: command_buffers.get(i).ok_or_else(missing)?,
                descriptor_set: descriptors.get(i).ok_or_else(missing)?,
                in_use: None,
                needs_record: true,
            });
        }
        debug!("vk: {} per-image resource sets built", images.len());

        Ok(Self {
            images,
            _command_buffers: command_buffers,
            _descriptors: descriptors,
            pipeline,
            render_pass,
            state,
        })
    }

    pub fn state(&self) -> &SwapchainState {
        &self.state
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[PerImageResources] {
        &self.images
    }

    pub fn image(&self, index: u32) -> VkResult<&PerImageResources> {
        self.images.get(index as usize).ok_or(VkError::NoSuchImage {
            index: index as usize,
            count: self.images.len(),
        })
    }

    pub fn command_buffer(&self, index: u32) -> VkResult<vk::CommandBuffer> {
        Ok(self.image(index)?.command_buffer)
    }

    pub fn image_in_use(&self, index: u32) -> Option<vk::Fence> {
        self.images.get(index as usize).and_then(|r| r.in_use)
    }

    pub fn set_image_in_use(&mut self, index: u32, fence: vk::Fence) {
        if let Some(r) = self.images.get_mut(index as usize) {
            r.in_use = Some(fence);
        }
    }

    pub fn mark_all_stale(&mut self) {
        self.images.iter_mut().for_each(|r| r.needs_record = true);
    }

    /// Writes this frame's uniforms and records the image's command buffer if stale.
    ///
    /// Callers must have waited on the image's in-use fence.
    pub fn prepare(
        &mut self,
        index: u32,
        uniforms: &UniformMatrices,
        recorder: &CommandRecorder,
        scene: &SceneResources,
    ) -> VkResult<()> {
        let extent = self.state.extent;
        let render_pass = self.render_pass.raw();
        let pipeline = self.pipeline.raw();
        let layout = self.pipeline.layout();

        let res = self
            .images
            .get_mut(index as usize)
            .ok_or(VkError::SwapchainUnavailable)?;
        res.uniform.write(0, uniforms.as_bytes())?;

        if res.needs_record {
            recorder.record(
                res.command_buffer,
                &DrawTarget {
                    image: index,
                    render_pass,
                    framebuffer: res.framebuffer.raw(),
                    extent,
                    pipeline,
                    layout,
                    descriptor_set: res.descriptor_set,
                    mesh: &scene.mesh,
                },
            )?;
            res.needs_record = false;
        }
        Ok(())
    }
}

pub struct SwapchainManager {
    generation: Option<Generation>,
    set_layout: Owned<vk::DescriptorSetLayout>,
    ctx: Arc<DeviceContext>,
    host: Arc<dyn WindowHost>,
    vsync: VsyncMode,
    shaders: ShaderCode,
}

impl SwapchainManager {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        host: Arc<dyn WindowHost>,
        vsync: VsyncMode,
        shaders: ShaderCode,
        scene: &SceneResources,
        recorder: &CommandRecorder,
    ) -> VkResult<Self> {
        let mut manager = Self {
            generation: None,
            set_layout: create_set_layout(ctx)?,
            ctx: Arc::clone(ctx),
            host,
            vsync,
            shaders,
        };
        manager.recreate(scene, recorder)?;
        Ok(manager)
    }

    /// Idles the device, drops the current generation and builds a new one.
    ///
    /// On failure no generation is installed and every later frame fails.
    pub fn recreate(&mut self, scene: &SceneResources, recorder: &CommandRecorder) -> VkResult<()> {
        // Minimized windows have nothing to present; wait before tearing down.
        let (size, polls) =
            wait_for_framebuffer(&*self.host, || current_surface_extent(&self.ctx));
        if polls > 0 {
            info!("vk: window restored after {polls} polls");
        }
        self.ctx.wait_idle()?;
        self.generation = None;
        self.generation = Some(Generation::build(
            &self.ctx,
            size,
            self.vsync,
            &self.shaders,
            self.set_layout.raw(),
            scene,
            recorder,
        )?);
        Ok(())
    }

    pub fn generation(&self) -> VkResult<&Generation> {
        self.generation.as_ref().ok_or(VkError::SwapchainUnavailable)
    }

    pub fn generation_mut(&mut self) -> VkResult<&mut Generation> {
        self.generation.as_mut().ok_or(VkError::SwapchainUnavailable)
    }

    pub fn mark_all_stale(&mut self) {
        if let Some(g) = self.generation.as_mut() {
            g.mark_all_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
    };

    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefers_srgb_then_falls_back_to_first() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );

        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn mailbox_when_offered_fifo_otherwise() {
        let both = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let fifo = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&both, VsyncMode::Mailbox), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&fifo, VsyncMode::Mailbox), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&both, VsyncMode::Fifo), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_unless_fixed() {
        let c = caps(2, 3);
        assert_eq!(
            choose_extent(&c, RenderSize::new(8000, 600)),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            ..c
        };
        assert_eq!(
            choose_extent(&fixed, RenderSize::new(800, 600)),
            fixed.current_extent
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert!(choose_image_count(&caps(1, 1)) >= 1);
    }

    #[test]
    fn distinct_families_share_concurrently() {
        let (mode, indices) = sharing_mode(QueueFamilyIndices {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());

        let (mode, indices) = sharing_mode(QueueFamilyIndices {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    /// Reports an empty framebuffer for a fixed number of polls.
    struct MinimizedHost {
        empty_polls: usize,
        polls: Cell<usize>,
        restored: RenderSize,
    }

    impl HasWindowHandle for MinimizedHost {
        fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasDisplayHandle for MinimizedHost {
        fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl WindowHost for MinimizedHost {
        fn framebuffer_size(&self) -> RenderSize {
            if self.polls.get() < self.empty_polls {
                RenderSize::ZERO
            } else {
                self.restored
            }
        }

        fn wait_events(&self) {
            self.polls.set(self.polls.get() + 1);
        }
    }

    #[test]
    fn minimized_window_blocks_for_exactly_k_polls() {
        for k in [0, 1, 5] {
            let host = MinimizedHost {
                empty_polls: k,
                polls: Cell::new(0),
                restored: RenderSize::new(1280, 720),
            };
            let (size, polls) = wait_for_framebuffer(&host, || None);
            assert_eq!(polls, k);
            assert_eq!(host.polls.get(), k);
            assert_eq!(
                choose_extent(&caps(2, 3), size),
                vk::Extent2D {
                    width: 1280,
                    height: 720
                }
            );
        }
    }

    #[test]
    fn surface_extent_wins_over_a_stale_host_size() {
        // Host size never updates, as when the event loop is not pumped.
        let host = MinimizedHost {
            empty_polls: usize::MAX,
            polls: Cell::new(0),
            restored: RenderSize::new(1, 1),
        };
        let surface = |polls: usize| {
            let extent = if polls < 3 {
                RenderSize::ZERO
            } else {
                RenderSize::new(800, 600)
            };
            Some(extent)
        };
        let (size, polls) = wait_for_framebuffer(&host, || surface(host.polls.get()));
        assert_eq!(size, RenderSize::new(800, 600));
        assert_eq!(polls, 3);
    }
}
