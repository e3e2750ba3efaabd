//! Render pass, descriptor layout and the two pipelines: the instanced scene
//! pipeline and the frustum cull compute pipeline. Shaders are WGSL compiled to
//! SPIR-V with naga at startup.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::Vertex;

/// Threads per cull workgroup. Must match `@workgroup_size` in [`CULL_SHADER`].
pub const CULL_WORKGROUP_SIZE: u32 = 64;

pub const SCENE_SHADER: &str = r#"
struct Uniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    frustum_planes: array<vec4<f32>, 6>,
}

struct Instance {
    model: mat4x4<f32>,
    usage: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) color: vec3<f32>,
    @location(2) tex_coord: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) color: vec3<f32>,
    @location(1) tex_coord: vec2<f32>,
}

@group(0) @binding(0) var<uniform> ubo: Uniforms;
@group(0) @binding(1) var<storage, read> instances: array<Instance>;
@group(0) @binding(3) var<storage, read> culled: array<u32>;

@vertex
fn vs_main(input: VertexInput, @builtin(instance_index) instance_index: u32) -> VertexOutput {
    var output: VertexOutput;
    output.color = input.color;
    output.tex_coord = input.tex_coord;

    if (culled[instance_index] != 0u) {
        // Every vertex lands on one point, so the triangles rasterize nothing
        output.clip_position = vec4<f32>(0.0);
        return output;
    }

    let model = instances[instance_index].model;
    output.clip_position = ubo.proj * ubo.view * model * vec4<f32>(input.position, 1.0);
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(input.color, 1.0);
}
"#;

pub const CULL_SHADER: &str = r#"
struct Uniforms {
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    frustum_planes: array<vec4<f32>, 6>,
}

struct Bounding {
    center: vec4<f32>,
    radius: vec4<f32>,
}

struct CullParams {
    instance_count: u32,
    cull_enabled: u32,
}

@group(0) @binding(0) var<uniform> ubo: Uniforms;
@group(0) @binding(2) var<storage, read> bounds: array<Bounding>;
@group(0) @binding(3) var<storage, read_write> culled: array<u32>;

var<push_constant> params: CullParams;

@compute @workgroup_size(64)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.instance_count) {
        return;
    }

    var hidden = 0u;
    if (params.cull_enabled != 0u) {
        let center = bounds[i].center.xyz;
        let radius = bounds[i].radius.x;
        for (var p = 0u; p < 6u; p = p + 1u) {
            let plane = ubo.frustum_planes[p];
            if (dot(plane.xyz, center) + plane.w < -radius) {
                hidden = 1u;
            }
        }
    }
    culled[i] = hidden;
}
"#;

/// Push constants of the cull pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CullPushConstants {
    pub instance_count: u32,
    pub cull_enabled: u32,
}

impl CullPushConstants {
    pub fn new(instance_count: u32, cull_enabled: bool) -> Self {
        Self {
            instance_count,
            cull_enabled: cull_enabled as u32,
        }
    }

    /// Workgroups needed to cover every instance.
    pub fn workgroups(&self) -> u32 {
        self.instance_count.div_ceil(CULL_WORKGROUP_SIZE)
    }
}

/// Descriptor bindings of the single scene set.
pub mod binding {
    pub const UNIFORMS: u32 = 0;
    pub const INSTANCES: u32 = 1;
    pub const BOUNDING: u32 = 2;
    pub const CULLED: u32 = 3;
}

/// Layout of the scene descriptor set, shared by both pipelines.
pub fn descriptor_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 4] {
    fn entry(
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
    }
    [
        entry(
            binding::UNIFORMS,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
        ),
        entry(
            binding::INSTANCES,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::VERTEX,
        ),
        entry(
            binding::BOUNDING,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        ),
        entry(
            binding::CULLED,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
        ),
    ]
}

/// Compile WGSL to SPIR-V words for one entry point.
pub fn compile_wgsl(source: &str, stage: naga::ShaderStage, entry_point: &str) -> RendererResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| RendererError::ShaderCreationFailed(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| RendererError::ShaderCreationFailed(format!("Validation error: {e}")))?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage)
    {
        return Err(RendererError::ShaderCreationFailed(format!(
            "Entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| RendererError::ShaderCreationFailed(format!("SPIR-V generation error: {e}")))
}

fn create_shader_module(
    device: &ash::Device,
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> RendererResult<vk::ShaderModule> {
    let spv = compile_wgsl(source, stage, entry_point)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
        RendererError::ShaderCreationFailed(format!("Failed to create shader module: {:?}", e))
    })
}

/// Everything needed to record a scene frame apart from buffers.
pub struct ScenePipelines {
    device: ash::Device,
    pub render_pass: vk::RenderPass,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub pipeline_layout: vk::PipelineLayout,
    pub graphics_pipeline: vk::Pipeline,
    pub cull_pipeline: vk::Pipeline,
}

impl ScenePipelines {
    pub fn new(
        device: &ash::Device,
        color_format: vk::Format,
        depth_format: vk::Format,
        frames_in_flight: usize,
    ) -> RendererResult<Self> {
        // Handles start null and are filled in as they are created, so `Drop`
        // releases whatever exists if a later step fails.
        let mut pipelines = Self {
            device: device.clone(),
            render_pass: vk::RenderPass::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            graphics_pipeline: vk::Pipeline::null(),
            cull_pipeline: vk::Pipeline::null(),
        };

        pipelines.render_pass = create_render_pass(device, color_format, depth_format)?;

        let bindings = descriptor_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        pipelines.descriptor_set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| {
                RendererError::PipelineCreationFailed(format!("Failed to create descriptor set layout: {:?}", e))
            })?;

        let sets = frames_in_flight as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 4 * sets,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(sets)
            .pool_sizes(&pool_sizes);
        pipelines.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| {
                RendererError::PipelineCreationFailed(format!("Failed to create descriptor pool: {:?}", e))
            })?;

        let set_layouts = [pipelines.descriptor_set_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<CullPushConstants>() as u32)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        pipelines.pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(|e| {
                RendererError::PipelineCreationFailed(format!("Failed to create pipeline layout: {:?}", e))
            })?;

        pipelines.graphics_pipeline =
            create_graphics_pipeline(device, pipelines.render_pass, pipelines.pipeline_layout)?;
        pipelines.cull_pipeline = create_cull_pipeline(device, pipelines.pipeline_layout)?;

        log::debug!("Created scene and cull pipelines for {:?}/{:?}", color_format, depth_format);

        Ok(pipelines)
    }

    /// One descriptor set per frame slot. Buffers are written later by the scene upload.
    pub fn allocate_descriptor_sets(&self, count: usize) -> RendererResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![self.descriptor_set_layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
            RendererError::PipelineCreationFailed(format!("Failed to allocate descriptor sets: {:?}", e))
        })
    }
}

impl Drop for ScenePipelines {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.cull_pipeline, None);
            self.device.destroy_pipeline(self.graphics_pipeline, None);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> RendererResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)];

    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }.map_err(|e| {
        RendererError::PipelineCreationFailed(format!("Failed to create render pass: {:?}", e))
    })
}

fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> RendererResult<vk::Pipeline> {
    let vertex_module = create_shader_module(device, SCENE_SHADER, naga::ShaderStage::Vertex, "vs_main")?;
    let fragment_module =
        match create_shader_module(device, SCENE_SHADER, naga::ShaderStage::Fragment, "fs_main") {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"vs_main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(c"fs_main"),
    ];

    let binding_descriptions = [Vertex::binding_description()];
    let attribute_descriptions = Vertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA)];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }

    result.map(|pipelines| pipelines[0]).map_err(|(_, e)| {
        RendererError::PipelineCreationFailed(format!("Failed to create graphics pipeline: {:?}", e))
    })
}

fn create_cull_pipeline(device: &ash::Device, layout: vk::PipelineLayout) -> RendererResult<vk::Pipeline> {
    let module = create_shader_module(device, CULL_SHADER, naga::ShaderStage::Compute, "cs_main")?;

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"cs_main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let result = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe { device.destroy_shader_module(module, None) };

    result.map(|pipelines| pipelines[0]).map_err(|(_, e)| {
        RendererError::PipelineCreationFailed(format!("Failed to create cull pipeline: {:?}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::vertex(SCENE_SHADER, naga::ShaderStage::Vertex, "vs_main")]
    #[case::fragment(SCENE_SHADER, naga::ShaderStage::Fragment, "fs_main")]
    #[case::cull(CULL_SHADER, naga::ShaderStage::Compute, "cs_main")]
    fn test_shaders_compile(#[case] source: &str, #[case] stage: naga::ShaderStage, #[case] entry: &str) {
        let spv = compile_wgsl(source, stage, entry).unwrap();
        // SPIR-V magic number
        assert_eq!(spv[0], 0x0723_0203);
    }

    #[test]
    fn test_missing_entry_point() {
        let err = compile_wgsl(SCENE_SHADER, naga::ShaderStage::Compute, "vs_main").unwrap_err();
        assert!(matches!(err, RendererError::ShaderCreationFailed(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = compile_wgsl("fn broken(", naga::ShaderStage::Vertex, "vs_main").unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_cull_workgroup_size_matches_shader() {
        let module = naga::front::wgsl::parse_str(CULL_SHADER).unwrap();
        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.name == "cs_main")
            .unwrap();
        assert_eq!(entry.workgroup_size, [CULL_WORKGROUP_SIZE, 1, 1]);
    }

    #[rstest]
    #[case::none(0, 0)]
    #[case::one(1, 1)]
    #[case::exact(64, 1)]
    #[case::spill(65, 2)]
    #[case::many(1000, 16)]
    fn test_cull_workgroups(#[case] instances: u32, #[case] groups: u32) {
        assert_eq!(CullPushConstants::new(instances, true).workgroups(), groups);
    }

    #[test]
    fn test_push_constants_layout() {
        assert_eq!(std::mem::size_of::<CullPushConstants>(), 8);
        let push = CullPushConstants::new(7, false);
        let bytes = bytemuck::bytes_of(&push);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..], &0u32.to_le_bytes());
    }

    #[test]
    fn test_descriptor_bindings() {
        let bindings = descriptor_bindings();
        for (i, b) in bindings.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
        }
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(bindings[binding::CULLED as usize]
            .stage_flags
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE));
        assert_eq!(bindings[binding::BOUNDING as usize].stage_flags, vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_every_binding_is_used_by_a_shader() {
        let mut used = std::collections::BTreeSet::new();
        for source in [SCENE_SHADER, CULL_SHADER] {
            let module = naga::front::wgsl::parse_str(source).unwrap();
            for (_, var) in module.global_variables.iter() {
                if let Some(rb) = &var.binding {
                    assert_eq!(rb.group, 0);
                    used.insert(rb.binding);
                }
            }
        }
        let declared: std::collections::BTreeSet<u32> =
            descriptor_bindings().iter().map(|b| b.binding).collect();
        assert_eq!(used, declared);
    }
}
