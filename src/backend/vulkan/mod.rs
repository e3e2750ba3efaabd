//! Vulkan backend via ash
//!
//! [`VulkanRenderer`] owns the device, swapchain, pipelines and scene buffers and
//! implements [`FrameBackend`](crate::backend::FrameBackend). The protocol that
//! drives it lives in [`frame::FrameScheduler`].

pub mod debug;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod swapchain;

pub use device::{QueueFamilies, VulkanContext};
pub use frame::{FrameResources, FrameScheduler, FrameStatus, MAX_FRAMES_IN_FLIGHT};
pub use renderer::{GpuScene, TextureHandle, VulkanRenderer};
pub use resources::{BufferDesc, GpuBuffer, GpuImage, ImageDesc, ResourceManager};
pub use swapchain::{SwapchainDesc, SwapchainState};
