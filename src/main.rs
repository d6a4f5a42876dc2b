//! vkrt — a Vulkan ray-traced scene renderer.
//!
//! Loads a JSON scene manifest plus the glTF models it references, uploads
//! the geometry through a staging buffer into linear device-memory arenas,
//! builds per-mesh BLAS and a scene TLAS, and presents ray-traced frames
//! through a small ring of in-flight frame resources.

mod accel;
mod arena;
mod camera;
mod context;
mod error;
mod frame;
mod gltf_loader;
mod overlay;
mod pipelines;
mod renderer;
mod resources;
mod scene;
mod shader;
mod staging;

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gltf_loader::TextureImage;
use crate::overlay::OverlayFrame;
use crate::renderer::Renderer;
use crate::scene::{SceneData, SceneManifest};

/// Vulkan ray-traced scene renderer.
#[derive(Parser)]
#[command(name = "vkrt", about = "Vulkan ray-traced scene renderer")]
struct Args {
    /// Path to the JSON scene manifest.
    scene: PathBuf,

    /// Directory containing the compiled .spv shader binaries.
    #[arg(long, default_value = "shaders")]
    shaders: PathBuf,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Number of frames in flight (2 or 3).
    #[arg(
        long,
        default_value_t = frame::DEFAULT_FRAMES_IN_FLIGHT as u32,
        value_parser = clap::value_parser!(u32).range(2..=3)
    )]
    frames_in_flight: u32,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let event_loop = EventLoop::new()
        .map_err(|e| Error::Init(format!("failed to create event loop: {}", e)))?;

    let mut app = App {
        args,
        state: None,
        failure: None,
    };
    event_loop
        .run_app(&mut app)
        .map_err(|e| Error::Init(format!("event loop error: {}", e)))?;

    if let Some(mut state) = app.state.take() {
        state.renderer.destroy(&mut state.ctx);
    }

    match app.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Window must outlive the surface owned by the context; field order keeps
/// the drop sequence renderer -> context -> window.
struct AppState {
    renderer: Renderer,
    ctx: Context,
    window: Window,
}

struct App {
    args: Args,
    state: Option<AppState>,
    failure: Option<Error>,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: Error) {
        error!("fatal: {}", e);
        self.failure = Some(e);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match init_state(&self.args, event_loop) {
            Ok(state) => {
                state.window.request_redraw();
                self.state = Some(state);
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let result = match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                event_loop.exit();
                Ok(())
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    event_loop.exit();
                }
                Ok(())
            }
            WindowEvent::Resized(size) => state
                .renderer
                .handle_resize(&mut state.ctx, size.width, size.height),
            WindowEvent::RedrawRequested => {
                // The overlay collaborator would supply this frame's draw
                // batches; without one attached, the overlay pass is empty.
                let overlay_frame = OverlayFrame::default();

                let outcome = match state.renderer.render_frame(&mut state.ctx, &overlay_frame)
                {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        let size = state.window.inner_size();
                        state
                            .renderer
                            .handle_resize(&mut state.ctx, size.width, size.height)
                    }
                    Err(e) => Err(e),
                };
                if outcome.is_ok() {
                    state.window.request_redraw();
                }
                outcome
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }
}

fn init_state(args: &Args, event_loop: &ActiveEventLoop) -> Result<AppState> {
    let window_attrs = Window::default_attributes()
        .with_title("vkrt")
        .with_inner_size(winit::dpi::LogicalSize::new(args.width, args.height));
    let window = event_loop
        .create_window(window_attrs)
        .map_err(|e| Error::Init(format!("failed to create window: {}", e)))?;

    let mut ctx = Context::new(&window, args.width, args.height)?;

    let manifest = SceneManifest::load(&args.scene)?;
    let mut models = Vec::new();
    for (name, path) in manifest.model_paths(&args.scene) {
        models.push(gltf_loader::load_model(&name, &path)?);
    }
    let scene_data = SceneData::assemble(&manifest, &models);
    info!(
        "Scene '{}': {} models, {} lights, {} vertices, {} instances",
        args.scene.display(),
        models.len(),
        scene_data.lights.len(),
        scene_data.vertices.len(),
        scene_data.instances.len()
    );

    // Stand-in atlas until an overlay collaborator attaches its own.
    let atlas = TextureImage {
        pixels: vec![255, 255, 255, 255],
        width: 1,
        height: 1,
    };

    let renderer = Renderer::new(
        &mut ctx,
        scene_data,
        &args.shaders,
        args.frames_in_flight as usize,
        &atlas,
    )?;

    Ok(AppState {
        renderer,
        ctx,
        window,
    })
}
