// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lumen_core::init_tracing;
use lumen_platform::{render_size, WinitHost};
use lumen_render::{
    MeshData, RenderSettings, RenderSize, Renderer, SceneDesc, ShaderCode, TextureData, Vertex,
    VsyncMode,
};
use lumen_render_vk::{shaders, VkRenderer};
use serde::Deserialize;
use tracing::{error, info, warn};

use lumen_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the TOML config file
    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,
    /// Frames in flight (1..=4), overrides the config file
    #[arg(long)]
    frames_in_flight: Option<usize>,
    /// Present mode preference, overrides the config file
    #[arg(long, value_enum)]
    vsync_mode: Option<VsyncCfg>,
}

#[derive(Debug, Clone, Copy, Deserialize, ValueEnum, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum VsyncCfg {
    Fifo,
    #[default]
    Mailbox,
}

impl From<VsyncCfg> for VsyncMode {
    fn from(v: VsyncCfg) -> Self {
        match v {
            VsyncCfg::Fifo => VsyncMode::Fifo,
            VsyncCfg::Mailbox => VsyncMode::Mailbox,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    vsync_mode: VsyncCfg,
    frames_in_flight: usize,
    validation: bool,
    /// SPIR-V overriding the built-in vertex stage.
    vertex_shader: Option<PathBuf>,
    fragment_shader: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let defaults = RenderSettings::default();
        RenderCfg {
            clear_color: defaults.clear_color,
            vsync_mode: VsyncCfg::Mailbox,
            frames_in_flight: defaults.frames_in_flight,
            validation: false,
            vertex_shader: None,
            fragment_shader: None,
        }
    }
}

impl RenderCfg {
    fn settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.clear_color,
            vsync_mode: self.vsync_mode.into(),
            frames_in_flight: self.frames_in_flight,
            validation: self.validation || cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{} not found; using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    ash::util::read_spv(&mut file).with_context(|| format!("read SPIR-V {}", path.display()))
}

fn load_shaders(cfg: &RenderCfg) -> Result<ShaderCode> {
    let mut code = shaders::builtin()?;
    if let Some(path) = &cfg.vertex_shader {
        info!("vertex shader override: {}", path.display());
        code.vertex = read_spirv(path)?;
    }
    if let Some(path) = &cfg.fragment_shader {
        info!("fragment shader override: {}", path.display());
        code.fragment = read_spirv(path)?;
    }
    Ok(code)
}

/// Unit quad in the XY plane, one colour per corner.
fn demo_mesh() -> MeshData {
    let v = |position: [f32; 3], texcoords: [f32; 2], color: [f32; 3]| Vertex {
        position,
        texcoords,
        color,
    };
    MeshData {
        vertices: vec![
            v([-0.5, -0.5, 0.0], [1.0, 0.0], [1.0, 0.0, 0.0]),
            v([0.5, -0.5, 0.0], [0.0, 0.0], [0.0, 1.0, 0.0]),
            v([0.5, 0.5, 0.0], [0.0, 1.0], [0.0, 0.0, 1.0]),
            v([-0.5, 0.5, 0.0], [1.0, 1.0], [1.0, 1.0, 1.0]),
        ],
        indices: vec![0, 1, 2, 2, 3, 0],
    }
}

/// RGB checkerboard with `cells` squares per side.
fn checkerboard(size: u32, cells: u32) -> TextureData {
    let cell = (size / cells.max(1)).max(1);
    let pixels = (0..size)
        .flat_map(|y| (0..size).map(move |x| (x, y)))
        .flat_map(|(x, y)| {
            if (x / cell + y / cell) % 2 == 0 {
                [230, 230, 230]
            } else {
                [40, 40, 48]
            }
        })
        .collect();
    TextureData {
        width: size,
        height: size,
        channels: 3,
        pixels,
    }
}

const CLEAR_PRESETS: [[f32; 4]; 3] = [
    [0.15, 0.15, 0.15, 1.0],
    [0.02, 0.02, 0.04, 1.0],
    [0.20, 0.10, 0.10, 1.0],
];

struct App {
    settings: RenderSettings,
    scene: SceneDesc,

    window: Option<Arc<Window>>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    paused: bool,
    exiting: bool,
    fatal: Option<anyhow::Error>,
    clear_preset: usize,

    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.fatal = Some(err);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(r) = self.renderer.take() {
            r.destroy();
        }
        self.window = None;
        event_loop.exit();
    }

    fn cycle_clear_color(&mut self) {
        self.clear_preset = (self.clear_preset + 1) % CLEAR_PRESETS.len();
        let rgba = CLEAR_PRESETS[self.clear_preset];
        info!("clear color → {rgba:?}");
        if let Some(r) = &mut self.renderer {
            r.set_clear_color(rgba);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attributes = Window::default_attributes().with_title("lumen");
        let window = match event_loop.create_window(attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => return self.fail(event_loop, anyhow::anyhow!("create_window: {e}")),
        };
        self.render_size = render_size(window.inner_size());
        self.paused = self.render_size.is_empty();

        let host = Arc::new(WinitHost::new(Arc::clone(&window)));
        match VkRenderer::initialize(host, &self.scene, self.settings) {
            Ok(r) => self.renderer = Some(r),
            Err(e) => return self.fail(event_loop, e.context("vk init failed")),
        }

        info!(
            "window {}x{}, {} frames in flight",
            self.render_size.width,
            self.render_size.height,
            self.settings.frames_in_flight()
        );
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = render_size(new_size);
                let now_paused = self.render_size.is_empty();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    );
                }
                if !self.paused {
                    if let Some(r) = &mut self.renderer {
                        r.resize(self.render_size);
                    }
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Space),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.cycle_clear_color(),

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                match renderer.draw_frame() {
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) => self.fail(event_loop, e.context("draw_frame")),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        // Present pacing throttles us; keep one redraw queued.
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config).render;
    if let Some(n) = args.frames_in_flight {
        cfg.frames_in_flight = n;
    }
    if let Some(mode) = args.vsync_mode {
        cfg.vsync_mode = mode;
    }

    let scene = SceneDesc {
        mesh: demo_mesh(),
        texture: checkerboard(256, 8),
        shaders: load_shaders(&cfg)?,
    };

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        settings: cfg.settings(),
        scene,
        window: None,
        renderer: None,
        render_size: RenderSize::ZERO,
        paused: false,
        exiting: false,
        fatal: None,
        clear_preset: 0,
        frames: 0,
        last_fps_instant: Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    match app.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let cfg = parse_cfg("").unwrap().render;
        assert_eq!(cfg.vsync_mode, VsyncCfg::Mailbox);
        assert_eq!(cfg.frames_in_flight, 2);
        assert_eq!(cfg.clear_color, [0.15, 0.15, 0.15, 1.0]);
    }

    #[test]
    fn render_table_overrides_fields() {
        let cfg = parse_cfg(
            r#"
            [render]
            vsync_mode = "fifo"
            frames_in_flight = 9
            vertex_shader = "a.spv"
            "#,
        )
        .unwrap()
        .render;
        assert_eq!(cfg.vsync_mode, VsyncCfg::Fifo);
        assert_eq!(cfg.vertex_shader, Some(PathBuf::from("a.spv")));
        assert_eq!(cfg.fragment_shader, None);

        let settings = cfg.settings();
        assert_eq!(settings.vsync_mode, VsyncMode::Fifo);
        assert_eq!(settings.frames_in_flight(), RenderSettings::MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn bad_vsync_mode_is_a_parse_error() {
        assert!(parse_cfg("[render]\nvsync_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn cli_overrides_parse() {
        let args = Args::parse_from(["lumen", "--frames-in-flight", "3", "--vsync-mode", "fifo"]);
        assert_eq!(args.frames_in_flight, Some(3));
        assert_eq!(args.vsync_mode, Some(VsyncCfg::Fifo));
        assert_eq!(args.config, PathBuf::from("lumen.toml"));
    }

    #[test]
    fn demo_mesh_indices_are_in_range() {
        let mesh = demo_mesh();
        assert_eq!(mesh.indices.len() % 3, 0);
        assert!(mesh
            .indices
            .iter()
            .all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn checkerboard_is_tightly_packed_rgb() {
        let tex = checkerboard(16, 4);
        assert_eq!(tex.pixels.len(), tex.expected_len());
        assert_ne!(tex.pixels[0..3], tex.pixels[4 * 3..4 * 3 + 3]);
    }

    #[test]
    fn builtin_shaders_unless_overridden() {
        let cfg = RenderCfg::default();
        let code = load_shaders(&cfg).unwrap();
        assert_eq!(code.vertex, shaders::builtin().unwrap().vertex);
        assert!(!code.fragment.is_empty());

        let cfg = RenderCfg {
            fragment_shader: Some(PathBuf::from("does/not/exist.spv")),
            ..RenderCfg::default()
        };
        let err = load_shaders(&cfg).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.spv"));
    }
}
