//! Vulkan instance, surface, device and allocator bootstrap.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::debug;
use crate::backend::traits::{RendererError, RendererResult};
use crate::RendererConfig;

/// Queue family indices a device must provide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family supporting both graphics and compute.
    pub graphics_compute: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilies {
    /// Pick queue families, preferring one family that can do everything.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Self {
        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let mut selected = QueueFamilies::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let capable = family.queue_count > 0 && family.queue_flags.contains(required);
            let present = supports_present(index);

            if capable && present {
                return QueueFamilies {
                    graphics_compute: Some(index),
                    present: Some(index),
                };
            }
            if capable && selected.graphics_compute.is_none() {
                selected.graphics_compute = Some(index);
            }
            if present && selected.present.is_none() {
                selected.present = Some(index);
            }
        }
        selected
    }

    pub fn is_complete(&self) -> bool {
        self.graphics_compute.is_some() && self.present.is_some()
    }

    /// Distinct family indices, for queue creation and concurrent sharing.
    pub fn unique(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = [self.graphics_compute, self.present]
            .into_iter()
            .flatten()
            .collect();
        indices.dedup();
        indices
    }
}

/// Rank a device type; higher is better.
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// Whether `extensions` lists `name`.
pub fn supports_extension(extensions: &[vk::ExtensionProperties], name: &CStr) -> bool {
    extensions.iter().any(|ext| {
        let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        ext_name == name
    })
}

/// Everything tied to the lifetime of the Vulkan device.
pub struct VulkanContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_fn: swapchain::Device,
    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: vk::CommandPool,
    depth_format: vk::Format,
    allocator: Option<Arc<Mutex<Allocator>>>,
}

impl VulkanContext {
    pub fn new(window: &winit::window::Window, config: &RendererConfig) -> RendererResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

        let display_handle = window
            .display_handle()
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

        let validation = config.validation && debug::validation_layer_available(&entry);
        if config.validation && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let instance = Self::create_instance(&entry, display_handle.as_raw(), &config.title, validation)?;

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = debug::create_debug_messenger(&loader)?;
            Some((loader, messenger))
        } else {
            None
        };

        let surface_fn = surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| RendererError::SurfaceCreationFailed(e.to_string()))?;

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_fn, surface)?;

        let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;

        // `pick_physical_device` only returns complete families
        let graphics_family = queue_families.graphics_compute.unwrap_or_default();
        let present_family = queue_families.present.unwrap_or(graphics_family);
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let swapchain_fn = swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
            RendererError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
        })?;

        let depth_format = Self::find_depth_format(&instance, physical_device)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            RendererError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
        })?;

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            surface_fn,
            surface,
            physical_device,
            device,
            swapchain_fn,
            queue_families,
            graphics_queue,
            present_queue,
            command_pool,
            depth_format,
            allocator: Some(Arc::new(Mutex::new(allocator))),
        })
    }

    fn create_instance(
        entry: &ash::Entry,
        display_handle: raw_window_handle::RawDisplayHandle,
        title: &str,
        validation: bool,
    ) -> RendererResult<ash::Instance> {
        let app_name = CString::new(title).unwrap_or_default();
        let engine_name = c"Instanced Renderer";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
            .to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layers = if validation {
            vec![debug::VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            RendererError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
        })
    }

    /// Choose the best device with complete queue families, swapchain support and
    /// at least one surface format and present mode.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> RendererResult<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| RendererError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e)))?;

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;

        for physical_device in devices {
            let properties = unsafe { instance.get_physical_device_properties(physical_device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();

            let families = unsafe {
                instance.get_physical_device_queue_family_properties(physical_device)
            };
            let queue_families = QueueFamilies::select(&families, |index| unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            });
            if !queue_families.is_complete() {
                log::debug!("Skipping {}: missing graphics/compute or present queue", name);
                continue;
            }

            let has_swapchain = unsafe {
                instance.enumerate_device_extension_properties(physical_device)
            }
            .map(|extensions| supports_extension(&extensions, swapchain::NAME))
            .unwrap_or(false);
            if !has_swapchain {
                log::debug!("Skipping {}: no swapchain extension", name);
                continue;
            }

            let formats = unsafe {
                surface_fn.get_physical_device_surface_formats(physical_device, surface)
            }
            .unwrap_or_default();
            let present_modes = unsafe {
                surface_fn.get_physical_device_surface_present_modes(physical_device, surface)
            }
            .unwrap_or_default();
            if formats.is_empty() || present_modes.is_empty() {
                log::debug!("Skipping {}: surface has no formats or present modes", name);
                continue;
            }

            let score = device_type_score(properties.device_type);
            if best.map_or(true, |(best_score, _, _)| score > best_score) {
                best = Some((score, physical_device, queue_families));
            }
        }

        let (_, physical_device, queue_families) = best.ok_or_else(|| {
            RendererError::NoSuitableDevice(
                "no GPU offers graphics+compute, presentation and a swapchain".into(),
            )
        })?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );

        Ok((physical_device, queue_families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilies,
    ) -> RendererResult<ash::Device> {
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let extensions = [swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| RendererError::DeviceCreationFailed(format!("{:?}", e)))
    }

    fn find_depth_format(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> RendererResult<vk::Format> {
        [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ]
        .into_iter()
        .find(|&format| {
            let properties =
                unsafe { instance.get_physical_device_format_properties(physical_device, format) };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| RendererError::InitializationFailed("No supported depth format".into()))
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn surface_fn(&self) -> &surface::Instance {
        &self.surface_fn
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn swapchain_fn(&self) -> &swapchain::Device {
        &self.swapchain_fn
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn allocator(&self) -> RendererResult<Arc<Mutex<Allocator>>> {
        self.allocator
            .clone()
            .ok_or_else(|| RendererError::InitializationFailed("Allocator not available".into()))
    }

    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RendererError::from_vk("device_wait_idle", e))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Every GPU resource holding an allocator handle is dropped before the
            // context, so this releases the last reference.
            drop(self.allocator.take());

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
