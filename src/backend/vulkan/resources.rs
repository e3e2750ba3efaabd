//! GPU buffers and images with scoped ownership, plus staged uploads.
//!
//! Every upload goes through a host-visible staging buffer and a one-shot command
//! buffer that is waited on before returning. The staging buffer is a [`GpuBuffer`]
//! local, so it is released on every exit path.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::device::VulkanContext;
use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::BufferUsage;

/// Buffer construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

/// Image construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// A device buffer and its memory. Released on drop.
pub struct GpuBuffer {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn new(
        device: &ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        desc: &BufferDesc,
    ) -> RendererResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| RendererError::BufferCreationFailed(format!("{}: {:?}", desc.label, e)))?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.label,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(RendererError::BufferCreationFailed(format!("{}: {}", desc.label, e)));
            }
        };

        // From here on `Drop` owns cleanup
        let gpu_buffer = Self {
            device: device.clone(),
            allocator,
            buffer,
            allocation: Some(allocation),
            size: desc.size,
        };

        if let Some(allocation) = gpu_buffer.allocation.as_ref() {
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
                .map_err(|e| RendererError::BufferCreationFailed(format!("{}: {:?}", desc.label, e)))?;
        }

        Ok(gpu_buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` into the buffer at `offset`. Only valid for host-visible memory.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> RendererResult<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| RendererError::BufferCreationFailed("buffer is not host-mapped".into()))?;

        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= mapped.len())
            .ok_or_else(|| {
                RendererError::BufferCreationFailed(format!(
                    "write of {} bytes at {} exceeds buffer of {} bytes",
                    data.len(),
                    offset,
                    mapped.len()
                ))
            })?;
        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Release the buffer now. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.buffer == vk::Buffer::null() {
            return;
        }
        unsafe { self.device.destroy_buffer(self.buffer, None) };
        self.buffer = vk::Buffer::null();
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A device image, its memory and a full view. Released on drop.
pub struct GpuImage {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl GpuImage {
    pub fn new(
        device: &ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        desc: &ImageDesc,
    ) -> RendererResult<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| RendererError::ImageCreationFailed(format!("{}: {:?}", desc.label, e)))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.label,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(RendererError::ImageCreationFailed(format!("{}: {}", desc.label, e)));
            }
        };

        let mut gpu_image = Self {
            device: device.clone(),
            allocator,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            format: desc.format,
        };

        if let Some(allocation) = gpu_image.allocation.as_ref() {
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                .map_err(|e| RendererError::ImageCreationFailed(format!("{}: {:?}", desc.label, e)))?;
        }

        gpu_image.view = create_image_view(device, image, desc.format, desc.aspect)?;
        Ok(gpu_image)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Release the view, image and memory now. Safe to call more than once.
    pub fn destroy(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                self.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free image memory: {}", e);
            }
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> RendererResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    unsafe { device.create_image_view(&view_info, None) }
        .map_err(|e| RendererError::ImageCreationFailed(format!("image view: {:?}", e)))
}

/// Source and destination masks for the layout transitions used by uploads.
pub fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> RendererResult<(vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags)> {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok((
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => Ok((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        (old, new) => Err(RendererError::ImageCreationFailed(format!(
            "unsupported layout transition {:?} -> {:?}",
            old, new
        ))),
    }
}

/// Creates GPU resources and performs blocking staged uploads on the graphics queue.
pub struct ResourceManager {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl ResourceManager {
    pub fn new(context: &VulkanContext) -> RendererResult<Self> {
        Ok(Self {
            device: context.device().clone(),
            allocator: context.allocator()?,
            queue: context.graphics_queue(),
            command_pool: context.command_pool(),
        })
    }

    /// Upload `data` to a device-local buffer. `COPY_DST` is added to `usage`.
    ///
    /// Empty data yields `None`: Vulkan forbids zero-sized buffers.
    pub fn create_buffer(
        &self,
        label: &str,
        data: &[u8],
        usage: BufferUsage,
    ) -> RendererResult<Option<GpuBuffer>> {
        if data.is_empty() {
            return Ok(None);
        }
        let size = data.len() as vk::DeviceSize;

        let mut staging = GpuBuffer::new(
            &self.device,
            self.allocator.clone(),
            &BufferDesc {
                label: "staging",
                size,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        staging.write(0, data)?;

        let buffer = GpuBuffer::new(
            &self.device,
            self.allocator.clone(),
            &BufferDesc {
                label,
                size,
                usage: usage | BufferUsage::COPY_DST,
                location: MemoryLocation::GpuOnly,
            },
        )?;

        self.one_shot(|device, cmd| unsafe {
            let region = vk::BufferCopy::default().size(size);
            device.cmd_copy_buffer(cmd, staging.handle(), buffer.handle(), &[region]);
        })?;

        Ok(Some(buffer))
    }

    /// Host-visible uniform buffer that stays mapped for its whole lifetime.
    pub fn create_uniform_buffer(&self, label: &str, size: usize) -> RendererResult<GpuBuffer> {
        GpuBuffer::new(
            &self.device,
            self.allocator.clone(),
            &BufferDesc {
                label,
                size: size as vk::DeviceSize,
                usage: BufferUsage::UNIFORM,
                location: MemoryLocation::CpuToGpu,
            },
        )
    }

    /// Upload tightly packed pixels into a sampled image left in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn create_image(
        &self,
        label: &str,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RendererResult<GpuImage> {
        if pixels.is_empty() || width == 0 || height == 0 {
            return Err(RendererError::ImageCreationFailed(format!(
                "{}: empty image {}x{}",
                label, width, height
            )));
        }

        let mut staging = GpuBuffer::new(
            &self.device,
            self.allocator.clone(),
            &BufferDesc {
                label: "image staging",
                size: pixels.len() as vk::DeviceSize,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        staging.write(0, pixels)?;

        let image = GpuImage::new(
            &self.device,
            self.allocator.clone(),
            &ImageDesc {
                label,
                width,
                height,
                format,
                usage: usage | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        self.transition_image_layout(
            image.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        self.one_shot(|device, cmd| unsafe {
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })?;

        self.transition_image_layout(
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        Ok(image)
    }

    /// Depth attachment sized to the swapchain. Its layout is set by the render pass.
    pub fn create_depth_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> RendererResult<GpuImage> {
        GpuImage::new(
            &self.device,
            self.allocator.clone(),
            &ImageDesc {
                label: "depth",
                width: extent.width,
                height: extent.height,
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
        )
    }

    fn transition_image_layout(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> RendererResult<()> {
        let (src_access, dst_access, src_stage, dst_stage) =
            transition_masks(old_layout, new_layout)?;

        self.one_shot(|device, cmd| unsafe {
            let barrier = vk::ImageMemoryBarrier::default()
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .src_access_mask(src_access)
                .dst_access_mask(dst_access);
            device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Record `record` into a fresh command buffer, submit it and wait for the
    /// queue to drain.
    fn one_shot(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> RendererResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RendererError::from_vk("allocate transfer command buffer", e))?[0];

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
                .map_err(|e| RendererError::from_vk("begin transfer commands", e))?;

            record(&self.device, cmd);

            unsafe { self.device.end_command_buffer(cmd) }
                .map_err(|e| RendererError::from_vk("end transfer commands", e))?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            unsafe {
                self.device
                    .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                    .map_err(|e| RendererError::from_vk("submit transfer commands", e))?;
                self.device
                    .queue_wait_idle(self.queue)
                    .map_err(|e| RendererError::from_vk("wait for transfer", e))
            }
        })();

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions() {
        let (src, dst, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (src, dst, _, dst_stage) = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_unsupported_transition() {
        assert!(matches!(
            transition_masks(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::UNDEFINED
            ),
            Err(RendererError::ImageCreationFailed(_))
        ));
    }
}
