//! The Vulkan frame backend: owns every GPU object and implements the per-frame
//! operations the [`FrameScheduler`](super::frame::FrameScheduler) sequences.

use ash::vk;
use glam::Mat4;

use super::device::VulkanContext;
use super::frame::FrameResources;
use super::pipeline::{binding, CullPushConstants, ScenePipelines};
use super::resources::{GpuBuffer, GpuImage, ResourceManager};
use super::swapchain::{query_surface_format, wait_for_nonzero_extent, SwapchainDesc, SwapchainState};
use crate::assets::TextureData;
use crate::backend::traits::{
    AcquireOutcome, ExtentSource, FrameBackend, PresentOutcome, RendererError, RendererResult,
};
use crate::backend::types::{BufferUsage, DrawCommand, UniformBufferObject};
use crate::scene::{MeshInstances, SceneBatch};
use crate::RendererConfig;

/// Index of a texture uploaded through [`VulkanRenderer::load_texture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub usize);

/// Device-resident copy of a [`SceneBatch`].
///
/// Geometry, instances, bounds and draw commands are read-only and shared by all
/// frame slots. Culled flags get one buffer per slot, since the cull pass of
/// frame `n` may write them while frame `n - 1` is still drawing.
pub struct GpuScene {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    instance_buffer: GpuBuffer,
    bounding_buffer: GpuBuffer,
    indirect_buffer: GpuBuffer,
    culled_buffers: Vec<GpuBuffer>,
    draw_count: usize,
    instance_count: u32,
}

impl GpuScene {
    fn upload(
        resources: &ResourceManager,
        batch: &SceneBatch,
        frames_in_flight: usize,
    ) -> RendererResult<Self> {
        let required = |buffer: Option<GpuBuffer>, what: &str| {
            buffer.ok_or_else(|| RendererError::InvalidScene(format!("scene has no {}", what)))
        };

        let vertex_buffer = required(
            resources.create_buffer(
                "scene vertices",
                bytemuck::cast_slice(&batch.scene_vertices),
                BufferUsage::VERTEX,
            )?,
            "vertices",
        )?;
        let index_buffer = required(
            resources.create_buffer(
                "scene indices",
                bytemuck::cast_slice(&batch.scene_indices),
                BufferUsage::INDEX,
            )?,
            "indices",
        )?;
        let instance_buffer = required(
            resources.create_buffer(
                "instance data",
                bytemuck::cast_slice(&batch.instance_data),
                BufferUsage::STORAGE,
            )?,
            "instances",
        )?;
        let bounding_buffer = required(
            resources.create_buffer(
                "bounding data",
                bytemuck::cast_slice(&batch.bounding_data),
                BufferUsage::STORAGE,
            )?,
            "bounding data",
        )?;

        let indirect_buffer = required(
            resources.create_buffer(
                "draw commands",
                bytemuck::cast_slice(&batch.draw_commands),
                BufferUsage::INDIRECT,
            )?,
            "draw commands",
        )?;

        // Zero means visible until the first cull pass runs
        let visible = vec![0u32; batch.instance_count() as usize];
        let mut culled_buffers = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            culled_buffers.push(required(
                resources.create_buffer(
                    "culled flags",
                    bytemuck::cast_slice(&visible),
                    BufferUsage::STORAGE,
                )?,
                "culled flags",
            )?);
        }

        Ok(Self {
            vertex_buffer,
            index_buffer,
            instance_buffer,
            bounding_buffer,
            indirect_buffer,
            culled_buffers,
            draw_count: batch.draw_commands.len(),
            instance_count: batch.instance_count(),
        })
    }

    pub fn draw_count(&self) -> usize {
        self.draw_count
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}

/// View-dependent settings for the next recorded frame.
#[derive(Debug, Clone, Copy)]
struct FrameSettings {
    view: Mat4,
    clear_color: [f32; 4],
    fov_y_degrees: f32,
    near: f32,
    far: f32,
    frustum_culling: bool,
}

pub struct VulkanRenderer {
    // Field order is drop order: everything holding device handles goes before `context`
    scene: Option<GpuScene>,
    textures: Vec<GpuImage>,
    frames: Vec<FrameResources>,
    swapchain: SwapchainState,
    pipelines: ScenePipelines,
    resources: ResourceManager,
    settings: FrameSettings,
    vsync: bool,
    context: VulkanContext,
}

impl VulkanRenderer {
    pub fn new(window: &winit::window::Window, config: &RendererConfig) -> RendererResult<Self> {
        let context = VulkanContext::new(window, config)?;
        let resources = ResourceManager::new(&context)?;
        let frames_in_flight = config.frames_in_flight.max(1);

        let surface_format = query_surface_format(&context)?;
        let pipelines = ScenePipelines::new(
            context.device(),
            surface_format.format,
            context.depth_format(),
            frames_in_flight,
        )?;

        let size = window.inner_size();
        let swapchain = SwapchainState::new(
            &context,
            &resources,
            SwapchainDesc {
                width: size.width,
                height: size.height,
                vsync: config.vsync,
                render_pass: pipelines.render_pass,
            },
        )?;

        let descriptor_sets = pipelines.allocate_descriptor_sets(frames_in_flight)?;
        let mut frames = Vec::with_capacity(frames_in_flight);
        for descriptor_set in descriptor_sets {
            let uniform_buffer = resources.create_uniform_buffer(
                "frame uniforms",
                std::mem::size_of::<UniformBufferObject>(),
            )?;
            frames.push(FrameResources::new(
                context.device(),
                context.command_pool(),
                descriptor_set,
                uniform_buffer,
            )?);
        }

        log::info!(
            "Vulkan renderer ready: {}x{}, {} swapchain images, {} frames in flight",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count(),
            frames_in_flight
        );

        let renderer = Self {
            scene: None,
            textures: Vec::new(),
            frames,
            swapchain,
            pipelines,
            resources,
            settings: FrameSettings {
                view: Mat4::IDENTITY,
                clear_color: config.clear_color,
                fov_y_degrees: config.fov_y_degrees,
                near: config.near,
                far: config.far,
                frustum_culling: config.frustum_culling,
            },
            vsync: config.vsync,
            context,
        };
        renderer.write_uniform_descriptors();
        Ok(renderer)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.settings.view = view;
    }

    pub fn set_frustum_culling(&mut self, enabled: bool) {
        self.settings.frustum_culling = enabled;
    }

    pub fn frustum_culling(&self) -> bool {
        self.settings.frustum_culling
    }

    pub fn scene(&self) -> Option<&GpuScene> {
        self.scene.as_ref()
    }

    pub fn wait_idle(&self) -> RendererResult<()> {
        self.context.wait_idle()
    }

    /// Replace the GPU scene. Input is validated and batched before any GPU
    /// state is touched, so a rejected scene leaves the current one in place.
    pub fn update_scene(&mut self, meshes: &[MeshInstances]) -> RendererResult<()> {
        let batch = SceneBatch::build(meshes)?;

        self.context.wait_idle()?;
        self.scene = None;

        if batch.is_empty() || batch.instance_count() == 0 {
            log::info!("Scene is empty, frames will only clear");
            return Ok(());
        }

        let scene = GpuScene::upload(&self.resources, &batch, self.frames.len())?;
        log::info!(
            "Uploaded scene: {} meshes, {} instances, {} vertices, {} indices",
            batch.draw_commands.len(),
            batch.instance_count(),
            batch.scene_vertices.len(),
            batch.scene_indices.len()
        );

        self.scene = Some(scene);
        self.write_scene_descriptors();
        Ok(())
    }

    /// Upload an RGBA8 texture. It lives until the renderer is dropped.
    pub fn load_texture(&mut self, texture: &TextureData) -> RendererResult<TextureHandle> {
        let image = self.resources.create_image(
            "texture",
            &texture.pixels,
            texture.width,
            texture.height,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        self.textures.push(image);
        Ok(TextureHandle(self.textures.len() - 1))
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&GpuImage> {
        self.textures.get(handle.0)
    }

    fn write_uniform_descriptors(&self) {
        for frame in &self.frames {
            let uniform_info = [vk::DescriptorBufferInfo::default()
                .buffer(frame.uniform_buffer.handle())
                .offset(0)
                .range(vk::WHOLE_SIZE)];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(frame.descriptor_set)
                .dst_binding(binding::UNIFORMS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info);
            unsafe { self.context.device().update_descriptor_sets(&[write], &[]) };
        }
    }

    fn write_scene_descriptors(&self) {
        let Some(scene) = self.scene.as_ref() else {
            return;
        };

        for (slot, frame) in self.frames.iter().enumerate() {
            let whole = |buffer: &GpuBuffer| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(buffer.handle())
                    .offset(0)
                    .range(vk::WHOLE_SIZE)]
            };
            let instances = whole(&scene.instance_buffer);
            let bounds = whole(&scene.bounding_buffer);
            let culled = whole(&scene.culled_buffers[slot]);

            let writes = [
                storage_write(frame.descriptor_set, binding::INSTANCES, &instances),
                storage_write(frame.descriptor_set, binding::BOUNDING, &bounds),
                storage_write(frame.descriptor_set, binding::CULLED, &culled),
            ];
            unsafe { self.context.device().update_descriptor_sets(&writes, &[]) };
        }
    }

    fn frame(&self, slot: usize) -> RendererResult<&FrameResources> {
        self.frames
            .get(slot)
            .ok_or_else(|| RendererError::CommandFailed(format!("no frame slot {}", slot)))
    }

    fn record_cull_pass(&self, cmd: vk::CommandBuffer, frame: &FrameResources, scene: &GpuScene, slot: usize) {
        let device = self.context.device();
        let push = CullPushConstants::new(scene.instance_count, self.settings.frustum_culling);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipelines.cull_pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipelines.pipeline_layout,
                0,
                &[frame.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipelines.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cmd, push.workgroups(), 1, 1);

            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(scene.culled_buffers[slot].handle())
                .offset(0)
                .size(vk::WHOLE_SIZE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::VERTEX_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    fn record_draws(&self, cmd: vk::CommandBuffer, frame: &FrameResources, scene: &GpuScene) {
        let device = self.context.device();
        let indirect = scene.indirect_buffer.handle();

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipelines.graphics_pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.pipeline_layout,
                0,
                &[frame.descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[scene.vertex_buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(cmd, scene.index_buffer.handle(), 0, vk::IndexType::UINT32);

            // One call per mesh; the instance count is read from the GPU copy
            for i in 0..scene.draw_count {
                device.cmd_draw_indexed_indirect(cmd, indirect, DrawCommand::offset_of(i), 1, DrawCommand::STRIDE);
            }
        }
    }
}

fn storage_write(
    set: vk::DescriptorSet,
    dst_binding: u32,
    info: &[vk::DescriptorBufferInfo],
) -> vk::WriteDescriptorSet<'_> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(dst_binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(info)
}

impl FrameBackend for VulkanRenderer {
    fn wait_for_slot(&mut self, slot: usize) -> RendererResult<()> {
        let fence = self.frame(slot)?.in_flight;
        unsafe { self.context.device().wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|e| RendererError::from_vk("wait for in-flight fence", e))
    }

    fn acquire_image(&mut self, slot: usize) -> RendererResult<AcquireOutcome> {
        let image_available = self.frame(slot)?.image_available;
        self.swapchain.acquire(image_available)
    }

    fn reset_slot(&mut self, slot: usize) -> RendererResult<()> {
        let frame = self.frame(slot)?;
        let device = self.context.device();
        unsafe {
            device
                .reset_fences(&[frame.in_flight])
                .map_err(|e| RendererError::from_vk("reset in-flight fence", e))?;
            device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RendererError::from_vk("reset command buffer", e))
        }
    }

    fn record(&mut self, slot: usize, image_index: u32) -> RendererResult<()> {
        let extent = self.swapchain.extent();
        let settings = self.settings;
        let ubo = UniformBufferObject::new(
            settings.view,
            extent.width,
            extent.height,
            settings.fov_y_degrees,
            settings.near,
            settings.far,
        );
        self.frames
            .get_mut(slot)
            .ok_or_else(|| RendererError::CommandFailed(format!("no frame slot {}", slot)))?
            .uniform_buffer
            .write(0, bytemuck::bytes_of(&ubo))?;

        let frame = self.frame(slot)?;
        let cmd = frame.command_buffer;
        let framebuffer = self.swapchain.framebuffer(image_index)?;
        let device = self.context.device();

        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| RendererError::from_vk("begin frame commands", e))?;

        if let Some(scene) = self.scene.as_ref() {
            self.record_cull_pass(cmd, frame, scene, slot);
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: settings.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.pipelines.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        if let Some(scene) = self.scene.as_ref() {
            self.record_draws(cmd, frame, scene);
        }

        unsafe {
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .map_err(|e| RendererError::from_vk("end frame commands", e))
        }
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> RendererResult<()> {
        let frame = self.frame(slot)?;
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [self.swapchain.render_finished(image_index)?];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.context.device().queue_submit(
                self.context.graphics_queue(),
                &[submit_info],
                frame.in_flight,
            )
        }
        .map_err(|e| RendererError::from_vk("submit frame", e))
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> RendererResult<PresentOutcome> {
        self.swapchain.present(self.context.present_queue(), image_index)
    }

    fn recreate_swapchain(&mut self, window: &mut dyn ExtentSource) -> RendererResult<()> {
        let Some((width, height)) = wait_for_nonzero_extent(window) else {
            log::debug!("Window closed while minimized, keeping the old swapchain");
            return Ok(());
        };
        self.context.wait_idle()?;

        let old_format = self.swapchain.format();
        self.swapchain.destroy();
        self.swapchain = SwapchainState::new(
            &self.context,
            &self.resources,
            SwapchainDesc {
                width,
                height,
                vsync: self.vsync,
                render_pass: self.pipelines.render_pass,
            },
        )?;

        if self.swapchain.format() != old_format {
            return Err(RendererError::SwapchainCreationFailed(format!(
                "surface format changed from {:?} to {:?}",
                old_format,
                self.swapchain.format()
            )));
        }

        log::info!(
            "Recreated swapchain: {}x{}, {} images, {} frames in flight",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            self.swapchain.image_count(),
            self.frames.len()
        );
        Ok(())
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {}", e);
        }
    }
}
