//! Core renderer abstraction traits
//!
//! Defines the crate error type and the seams the frame loop drives: the GPU side
//! ([`FrameBackend`]) and the window side ([`ExtentSource`]). Both are implemented
//! by the Vulkan renderer and the window wrapper, and by in-memory mocks in tests.

use ash::vk;
use thiserror::Error;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("No suitable physical device: {0}")]
    NoSuitableDevice(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Command submission failed: {0}")]
    CommandFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Invalid scene: {0}")]
    InvalidScene(String),
    #[error("Failed to load asset '{path}': {reason}")]
    AssetLoad { path: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RendererError {
    /// Map a raw Vulkan result to an error, keeping memory exhaustion and device
    /// loss distinguishable from ordinary command failures.
    pub fn from_vk(context: &str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RendererError::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => RendererError::DeviceLost,
            other => RendererError::CommandFailed(format!("{}: {:?}", context, other)),
        }
    }
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface no longer matches the swapchain; nothing was acquired.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreation(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// GPU-side operations sequenced by the frame scheduler.
///
/// `slot` is the frame-in-flight index and selects the fence, command buffer,
/// image-available semaphore and descriptor set. `image_index` is the swapchain
/// image and selects the framebuffer and render-finished semaphore. The two are
/// never interchangeable.
pub trait FrameBackend {
    /// Block until the previous submission on `slot` has completed.
    fn wait_for_slot(&mut self, slot: usize) -> RendererResult<()>;

    /// Acquire the next presentable image, signalling the slot's image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> RendererResult<AcquireOutcome>;

    /// Reset the slot's fence and command buffer. Only called after a successful acquire.
    fn reset_slot(&mut self, slot: usize) -> RendererResult<()>;

    /// Record the whole frame into the slot's command buffer.
    fn record(&mut self, slot: usize, image_index: u32) -> RendererResult<()>;

    /// Submit the slot's command buffer, signalling the image's render-finished
    /// semaphore and the slot's fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> RendererResult<()>;

    /// Present `image_index`, waiting on its render-finished semaphore.
    fn present(&mut self, slot: usize, image_index: u32) -> RendererResult<PresentOutcome>;

    /// Rebuild the swapchain and everything sized by it.
    fn recreate_swapchain(&mut self, window: &mut dyn ExtentSource) -> RendererResult<()>;
}

/// Window-side state the renderer needs: framebuffer size, the latched resize
/// flag, and a way to block until the window system has something new.
pub trait ExtentSource {
    /// Current framebuffer extent in pixels. Zero in either dimension while minimized.
    fn framebuffer_extent(&self) -> (u32, u32);

    fn resize_pending(&self) -> bool;

    fn clear_resize(&mut self);

    /// Block until at least one window event has been processed. Returns false
    /// once the window is closing and waiting should stop.
    fn wait_events(&mut self) -> bool;
}
