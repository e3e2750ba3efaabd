//! Instanced Renderer - A GPU-driven instanced renderer on Vulkan
//!
//! Many mesh archetypes, each replicated by a list of instance transforms, are
//! merged into one vertex buffer, one index buffer and one indirect draw command
//! per mesh. Every frame a compute pass tests each instance's bounding sphere
//! against the view frustum, then the scene is drawn with one indirect call per
//! mesh.
//!
//! # Features
//! - Scene batching into shared GPU buffers ([`scene::SceneBatch`])
//! - Frames in flight with per-slot fences and per-image semaphores
//! - Swapchain recreation on resize, minimize and stale presentation
//! - GPU frustum culling
//! - JSON, packed binary and OBJ scene loading

pub mod assets;
pub mod backend;
pub mod engine;
pub mod scene;
pub mod window;

pub use backend::traits::{RendererError, RendererResult};
pub use engine::Renderer;
pub use window::{Window, WindowEvents};

use backend::vulkan::MAX_FRAMES_IN_FLIGHT;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Force FIFO presentation instead of preferring MAILBOX
    pub vsync: bool,
    /// Enable the Khronos validation layer when it is installed
    pub validation: bool,
    pub frustum_culling: bool,
    /// Vertical field of view in degrees
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// RGBA clear color
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Instanced Renderer".to_string(),
            width: 1280,
            height: 720,
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            vsync: false,
            validation: cfg!(debug_assertions),
            frustum_culling: true,
            fov_y_degrees: 45.0,
            near: 0.01,
            far: 100.0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frustum_culling(mut self, enabled: bool) -> Self {
        self.frustum_culling = enabled;
        self
    }

    pub fn with_projection(mut self, fov_y_degrees: f32, near: f32, far: f32) -> Self {
        self.fov_y_degrees = fov_y_degrees;
        self.near = near;
        self.far = far;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }
}
