// SPDX-License-Identifier: CEPL-1.0
//! winit glue: exposes a winit window to the renderer as a [`WindowHost`].

use std::sync::Arc;
use std::time::Duration;

use lumen_render::{RenderSize, WindowHost};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use tracing::trace;
pub use winit;
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// Sleep between framebuffer polls while the window is minimized.
const MINIMIZED_POLL: Duration = Duration::from_millis(16);

pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

#[derive(Clone)]
pub struct WinitHost {
    window: Arc<Window>,
}

impl WinitHost {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl HasWindowHandle for WinitHost {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for WinitHost {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl WindowHost for WinitHost {
    fn framebuffer_size(&self) -> RenderSize {
        render_size(self.window.inner_size())
    }

    // The event loop is parked inside our callback, so this cannot pump events.
    // Recreation gets past a stale zero size through the surface extent where the
    // platform defines one (Win32, X11); Wayland keeps the size when minimized.
    fn wait_events(&self) {
        trace!("platform: framebuffer empty, sleeping {MINIMIZED_POLL:?}");
        std::thread::sleep(MINIMIZED_POLL);
    }
}
