//! Main renderer orchestrator

use std::path::Path;

use glam::Mat4;

use crate::assets;
use crate::backend::traits::{ExtentSource, RendererResult};
use crate::backend::vulkan::{FrameScheduler, FrameStatus, GpuScene, TextureHandle, VulkanRenderer};
use crate::scene::MeshInstances;
use crate::window::Window;
use crate::RendererConfig;

/// Instanced renderer: the Vulkan backend plus the frame loop that drives it.
pub struct Renderer {
    config: RendererConfig,
    scheduler: FrameScheduler,
    backend: VulkanRenderer,
}

impl Renderer {
    pub fn new(window: &Window, config: RendererConfig) -> RendererResult<Self> {
        let backend = VulkanRenderer::new(window.window(), &config)?;
        let scheduler = FrameScheduler::new(backend.frames_in_flight());

        Ok(Self {
            config,
            scheduler,
            backend,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Replace the scene drawn by subsequent frames.
    ///
    /// Blocks until the GPU is idle. An empty scene is valid and clears the screen.
    pub fn update_scene(&mut self, meshes: &[MeshInstances]) -> RendererResult<()> {
        self.backend.update_scene(meshes)
    }

    pub fn scene(&self) -> Option<&GpuScene> {
        self.backend.scene()
    }

    /// Draw one frame from `view`, recreating the swapchain when it goes stale.
    pub fn draw(&mut self, view: Mat4, window: &mut dyn ExtentSource) -> RendererResult<FrameStatus> {
        self.backend.set_view(view);
        self.scheduler.draw_frame(&mut self.backend, window)
    }

    pub fn set_frustum_culling(&mut self, enabled: bool) {
        self.config.frustum_culling = enabled;
        self.backend.set_frustum_culling(enabled);
        log::info!("Frustum culling {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn frustum_culling(&self) -> bool {
        self.backend.frustum_culling()
    }

    /// Decode an image file and upload it as a sampled RGBA8 texture.
    pub fn load_texture(&mut self, path: &Path) -> RendererResult<TextureHandle> {
        let texture = assets::load_texture(path)?;
        self.backend.load_texture(&texture)
    }

    pub fn frame_number(&self) -> u64 {
        self.scheduler.frame_number()
    }

    pub fn wait_idle(&self) -> RendererResult<()> {
        self.backend.wait_idle()
    }
}
