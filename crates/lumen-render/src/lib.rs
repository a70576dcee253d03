// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const ZERO: RenderSize = RenderSize {
        width: 0,
        height: 0,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized framebuffer on at least one axis.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// What the renderer needs from the windowing layer.
///
/// Handles come from `raw-window-handle`; the size query and the event poll are
/// only used while the surface is being rebuilt.
pub trait WindowHost: HasWindowHandle + HasDisplayHandle {
    /// Current framebuffer size in physical pixels.
    fn framebuffer_size(&self) -> RenderSize;

    /// Block until the windowing system had a chance to deliver new events.
    ///
    /// Hosts that cannot pump their event loop from inside the renderer may
    /// only sleep here. Their `framebuffer_size` then has to read the live
    /// size, or a zero size would never change; the Vulkan backend prefers
    /// the surface's own extent whenever the surface defines one.
    fn wait_events(&self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    /// Always block on vertical blank.
    Fifo,
    /// Low-latency non-blocking present when the surface offers it.
    #[default]
    Mailbox,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncMode,
    pub frames_in_flight: usize,
    pub validation: bool,
}

impl RenderSettings {
    pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(1, Self::MAX_FRAMES_IN_FLIGHT)
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.15, 0.15, 0.15, 1.0],
            vsync_mode: VsyncMode::Mailbox,
            frames_in_flight: 2,
            validation: cfg!(debug_assertions),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub texcoords: [f32; 2],
    pub color: [f32; 3],
}

#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Raw pixels as handed over by the asset loader, tightly packed, row major.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// 1x1 opaque white, used when a scene carries no texture.
    pub fn white() -> Self {
        Self {
            width: 1,
            height: 1,
            channels: 4,
            pixels: vec![255; 4],
        }
    }
}

/// SPIR-V words for the two programmable stages.
#[derive(Clone, Debug, Default)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct SceneDesc {
    pub mesh: MeshData,
    pub texture: TextureData,
    pub shaders: ShaderCode,
}

pub trait Renderer {
    fn initialize(
        host: Arc<dyn WindowHost>,
        scene: &SceneDesc,
        settings: RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Edge-triggered resize notification; the surface is rebuilt after the next present.
    fn resize(&mut self, size: RenderSize);
    fn draw_frame(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);

    /// Idle the device and release every GPU resource.
    fn destroy(self)
    where
        Self: Sized,
    {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut s = RenderSettings::default();
        assert_eq!(s.frames_in_flight(), 2);
        s.frames_in_flight = 0;
        assert_eq!(s.frames_in_flight(), 1);
        s.frames_in_flight = 99;
        assert_eq!(s.frames_in_flight(), RenderSettings::MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 8 * 4);
    }

    #[test]
    fn texture_len_accounts_for_channels() {
        let t = TextureData {
            width: 3,
            height: 2,
            channels: 3,
            pixels: vec![0; 18],
        };
        assert_eq!(t.expected_len(), t.pixels.len());
        assert_eq!(TextureData::white().expected_len(), 4);
    }

    #[test]
    fn zero_axis_is_empty() {
        assert!(RenderSize::new(0, 600).is_empty());
        assert!(RenderSize::new(800, 0).is_empty());
        assert!(!RenderSize::new(1, 1).is_empty());
    }
}
