//! Instanced renderer viewer
//!
//! Controls:
//! - WASD / Space / Alt: move, Shift: sprint
//! - Right mouse button: look around
//! - F: toggle frustum culling
//! - R: reload the scene file
//! - Escape: quit

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use winit::event_loop::EventLoop;
use winit::keyboard::KeyCode;

use instanced_renderer::assets::load_scene;
use instanced_renderer::scene::{demo_scene, Camera, MeshInstances};
use instanced_renderer::{Renderer, RendererConfig, RendererError, RendererResult, Window, WindowEvents};

/// GPU-driven instanced renderer.
#[derive(Parser, Debug)]
#[command(
    name = "instanced-renderer",
    about = "Draws many instanced meshes with GPU frustum culling",
    version
)]
struct Args {
    /// Scene file (.json, .mp or .obj). A built-in grid is drawn when omitted.
    scene: Option<PathBuf>,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Wait for vertical sync (FIFO presentation).
    #[arg(long)]
    vsync: bool,

    /// Enable GPU validation layers.
    #[arg(long, conflicts_with = "no_validation")]
    validation: bool,

    /// Disable GPU validation layers.
    #[arg(long, conflicts_with = "validation")]
    no_validation: bool,

    /// Start with frustum culling disabled.
    #[arg(long)]
    no_culling: bool,

    /// Exit after rendering N frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

impl Args {
    fn config(&self) -> RendererConfig {
        let validation = self.validation || (!self.no_validation && cfg!(debug_assertions));
        RendererConfig::default()
            .with_size(self.width, self.height)
            .with_vsync(self.vsync)
            .with_validation(validation)
            .with_frustum_culling(!self.no_culling)
    }
}

fn load(path: Option<&Path>) -> RendererResult<Vec<MeshInstances>> {
    match path {
        Some(path) => load_scene(path),
        None => Ok(demo_scene(24, 24, 3.0)),
    }
}

fn run(args: Args) -> RendererResult<()> {
    let config = args.config();

    let mut event_loop = EventLoop::new()
        .map_err(|e| RendererError::InitializationFailed(format!("Failed to create event loop: {}", e)))?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let mut renderer = Renderer::new(&window, config)?;

    renderer.update_scene(&load(args.scene.as_deref())?)?;

    let mut camera = Camera::default();
    let mut last_frame = Instant::now();

    loop {
        window.pump(&mut event_loop, Some(Duration::ZERO));
        if window.should_close() {
            break;
        }

        for key in window.take_pressed_keys() {
            match key {
                KeyCode::KeyF => {
                    let enabled = !renderer.frustum_culling();
                    renderer.set_frustum_culling(enabled);
                }
                KeyCode::KeyR => match load(args.scene.as_deref()) {
                    Ok(scene) => renderer.update_scene(&scene)?,
                    Err(e) => log::warn!("Reload failed, keeping the current scene: {}", e),
                },
                _ => {}
            }
        }

        let now = Instant::now();
        let dt = (now - last_frame).as_secs_f32();
        last_frame = now;

        camera.update(window.input(), dt);
        window.input().reset_deltas();

        let mut events = WindowEvents::new(&mut event_loop, &mut window);
        renderer.draw(camera.view_matrix(), &mut events)?;

        if args
            .max_frames
            .is_some_and(|max| renderer.frame_number() >= max)
        {
            log::info!("Reached {} frames, exiting", renderer.frame_number());
            break;
        }
    }

    renderer.wait_idle()
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Args::parse()) {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
