//! Swapchain and everything sized by it: image views, depth buffer, framebuffers
//! and the per-image render-finished semaphores.

use ash::vk;

use super::device::VulkanContext;
use super::resources::{create_image_view, GpuImage, ResourceManager};
use crate::backend::traits::{AcquireOutcome, ExtentSource, PresentOutcome, RendererError, RendererResult};

/// Swapchain construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Window framebuffer size, used when the surface leaves the extent to us.
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub render_pass: vk::RenderPass,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when available and vsync is off, otherwise FIFO (always supported).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped when the surface has a maximum.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Block on window events until the framebuffer has a non-zero area.
///
/// `None` when the window starts closing while minimized.
pub fn wait_for_nonzero_extent(window: &mut dyn ExtentSource) -> Option<(u32, u32)> {
    let mut extent = window.framebuffer_extent();
    if extent.0 == 0 || extent.1 == 0 {
        log::debug!("Window minimized, waiting for a non-zero framebuffer");
    }
    while extent.0 == 0 || extent.1 == 0 {
        if !window.wait_events() {
            return None;
        }
        extent = window.framebuffer_extent();
    }
    Some(extent)
}

/// The format swapchains on this surface will use. Needed before the first
/// swapchain exists to build a compatible render pass.
pub fn query_surface_format(context: &VulkanContext) -> RendererResult<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        context
            .surface_fn()
            .get_physical_device_surface_formats(context.physical_device(), context.surface())
    }
    .map_err(|e| RendererError::SwapchainCreationFailed(format!("surface formats: {:?}", e)))?;
    choose_surface_format(&formats)
        .ok_or_else(|| RendererError::SwapchainCreationFailed("surface reports no formats".into()))
}

pub struct SwapchainState {
    device: ash::Device,
    swapchain_fn: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    depth: Option<GpuImage>,
    framebuffers: Vec<vk::Framebuffer>,
    /// Indexed by swapchain image, not by frame slot.
    render_finished: Vec<vk::Semaphore>,
}

impl SwapchainState {
    pub fn new(
        context: &VulkanContext,
        resources: &ResourceManager,
        desc: SwapchainDesc,
    ) -> RendererResult<Self> {
        let surface_fn = context.surface_fn();
        let surface = context.surface();
        let physical_device = context.physical_device();

        let capabilities = unsafe {
            surface_fn.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(|e| RendererError::SwapchainCreationFailed(format!("surface capabilities: {:?}", e)))?;
        let present_modes = unsafe {
            surface_fn.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(|e| RendererError::SwapchainCreationFailed(format!("present modes: {:?}", e)))?;

        let surface_format = query_surface_format(context)?;
        let present_mode = choose_present_mode(&present_modes, desc.vsync);
        let extent = choose_extent(&capabilities, desc.width, desc.height);
        let image_count = choose_image_count(&capabilities);

        let families = context.queue_families().unique();
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());
        create_info = if families.len() > 1 {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain_fn = context.swapchain_fn().clone();
        let swapchain = unsafe { swapchain_fn.create_swapchain(&create_info, None) }
            .map_err(|e| RendererError::SwapchainCreationFailed(format!("{:?}", e)))?;

        // Partially built state still cleans up through `Drop`
        let mut state = Self {
            device: context.device().clone(),
            swapchain_fn,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            depth: None,
            framebuffers: Vec::new(),
            render_finished: Vec::new(),
        };

        state.images = unsafe { state.swapchain_fn.get_swapchain_images(swapchain) }
            .map_err(|e| RendererError::SwapchainCreationFailed(format!("swapchain images: {:?}", e)))?;

        for &image in &state.images {
            let view = create_image_view(
                &state.device,
                image,
                state.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            state.image_views.push(view);
        }

        let depth = resources.create_depth_image(extent, context.depth_format())?;
        let depth_view = depth.view();
        state.depth = Some(depth);

        for &view in &state.image_views {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(desc.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { state.device.create_framebuffer(&framebuffer_info, None) }
                .map_err(|e| RendererError::SwapchainCreationFailed(format!("framebuffer: {:?}", e)))?;
            state.framebuffers.push(framebuffer);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..state.images.len() {
            let semaphore = unsafe { state.device.create_semaphore(&semaphore_info, None) }
                .map_err(|e| RendererError::from_vk("create render finished semaphore", e))?;
            state.render_finished.push(semaphore);
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            state.images.len(),
            state.format,
            present_mode
        );

        Ok(state)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> RendererResult<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| RendererError::CommandFailed(format!("no framebuffer for image {}", image_index)))
    }

    pub fn render_finished(&self, image_index: u32) -> RendererResult<vk::Semaphore> {
        self.render_finished
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| RendererError::CommandFailed(format!("no semaphore for image {}", image_index)))
    }

    pub fn acquire(&self, image_available: vk::Semaphore) -> RendererResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date on acquire");
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RendererError::DeviceLost),
            Err(e) => Err(RendererError::AcquireImageFailed(format!("{:?}", e))),
        }
    }

    pub fn present(&self, queue: vk::Queue, image_index: u32) -> RendererResult<PresentOutcome> {
        let wait_semaphores = [self.render_finished(image_index)?];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_fn.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => {
                log::debug!("Swapchain suboptimal on present");
                Ok(PresentOutcome::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date on present");
                Ok(PresentOutcome::OutOfDate)
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RendererError::DeviceLost),
            Err(e) => Err(RendererError::PresentFailed(format!("{:?}", e))),
        }
    }

    /// Release everything in dependency order. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(mut depth) = self.depth.take() {
            depth.destroy();
        }
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
            for semaphore in self.render_finished.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
        }
        self.images.clear();
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        self.destroy();
    }
}
