//! GPU-facing data layouts shared by the batcher, the resource manager and the shaders

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::hash::{Hash, Hasher};

/// Vertex used by the merged scene vertex buffer.
///
/// Equality and hashing are bitwise over all components so a vertex can key a
/// `HashMap` when deduplicating face data. `-0.0` and `0.0` are distinct keys.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub color: Vec3,
    /// Zero when the source has no texture coordinates.
    pub tex_coord: Vec2,
}

impl Vertex {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self {
            position,
            color,
            tex_coord: Vec2::ZERO,
        }
    }

    pub fn with_tex_coord(mut self, tex_coord: Vec2) -> Self {
        self.tex_coord = tex_coord;
        self
    }

    fn key(&self) -> [u32; 8] {
        [
            self.position.x.to_bits(),
            self.position.y.to_bits(),
            self.position.z.to_bits(),
            self.color.x.to_bits(),
            self.color.y.to_bits(),
            self.color.z.to_bits(),
            self.tex_coord.x.to_bits(),
            self.tex_coord.y.to_bits(),
        ]
    }

    /// Vertex buffer binding for binding slot 0.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Attribute layout: location 0 position, 1 color, 2 tex coord.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(24),
        ]
    }
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Per-instance record read by the vertex stage (std430, 80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: Mat4,
    /// `x` holds a usage/visibility scalar, zero on creation. `yzw` are padding.
    pub usage: Vec4,
}

impl InstanceData {
    pub fn new(model: Mat4) -> Self {
        Self {
            model,
            usage: Vec4::ZERO,
        }
    }
}

/// Per-instance bounding sphere read by the cull stage (std430, 32 bytes).
///
/// `radius.x` is measured in the mesh's local space and is not adjusted for the
/// instance transform's scale.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoundingData {
    pub center: Vec4,
    pub radius: Vec4,
}

impl BoundingData {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self {
            center: center.extend(1.0),
            radius: Vec4::new(radius, 0.0, 0.0, 0.0),
        }
    }
}

/// Indirect indexed draw, laid out exactly like `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl DrawCommand {
    /// Byte stride between consecutive commands in an indirect buffer.
    pub const STRIDE: u32 = std::mem::size_of::<DrawCommand>() as u32;

    /// Byte offset of command `index` inside an indirect buffer.
    pub fn offset_of(index: usize) -> vk::DeviceSize {
        index as vk::DeviceSize * Self::STRIDE as vk::DeviceSize
    }
}

/// Per-frame uniform shared by the vertex and cull stages.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub view: Mat4,
    pub proj: Mat4,
    /// Left, right, top, bottom, near, far. `xyz` is the unit normal, `w` the distance.
    pub frustum_planes: [Vec4; 6],
}

impl UniformBufferObject {
    /// Build the uniform for a framebuffer of `width`x`height` with Vulkan's
    /// flipped Y clip space.
    pub fn new(view: Mat4, width: u32, height: u32, fov_y_degrees: f32, near: f32, far: f32) -> Self {
        let aspect = width as f32 / height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(fov_y_degrees.to_radians(), aspect, near, far);
        proj.y_axis.y *= -1.0;

        Self {
            view,
            proj,
            frustum_planes: frustum_planes(proj * view),
        }
    }
}

/// Extract normalised frustum planes from a view-projection matrix with a 0..1 depth range.
pub fn frustum_planes(view_proj: Mat4) -> [Vec4; 6] {
    let r0 = view_proj.row(0);
    let r1 = view_proj.row(1);
    let r2 = view_proj.row(2);
    let r3 = view_proj.row(3);

    let mut planes = [r3 + r0, r3 - r0, r3 - r1, r3 + r1, r2, r3 - r2];
    for plane in &mut planes {
        let length = plane.truncate().length();
        if length > 0.0 {
            *plane /= length;
        }
    }
    planes
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const INDEX: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);
    pub const STORAGE: Self = Self(1 << 5);
    pub const INDIRECT: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::COPY_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn test_gpu_layout_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::size_of::<InstanceData>(), 80);
        assert_eq!(std::mem::size_of::<BoundingData>(), 32);
        assert_eq!(
            std::mem::size_of::<DrawCommand>(),
            std::mem::size_of::<vk::DrawIndexedIndirectCommand>()
        );
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 64 * 2 + 16 * 6);
    }

    #[test]
    fn test_indirect_offsets() {
        assert_eq!(DrawCommand::offset_of(0), 0);
        assert_eq!(DrawCommand::offset_of(3), 60);
    }

    #[test]
    fn test_vertex_dedup_key() {
        let a = Vertex::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE);
        let b = Vertex::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE);
        let c = a.with_tex_coord(Vec2::new(0.5, 0.5));

        let mut map = HashMap::new();
        map.insert(a, 0u32);
        assert_eq!(map.get(&b), Some(&0));
        assert!(!map.contains_key(&c));
        assert_ne!(a, c);
    }

    #[test]
    fn test_buffer_usage_to_vk() {
        let usage = BufferUsage::STORAGE | BufferUsage::INDIRECT | BufferUsage::COPY_DST;
        let flags = usage.to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
    }

    #[test]
    fn test_projection_flips_y() {
        let ubo = UniformBufferObject::new(Mat4::IDENTITY, 800, 600, 45.0, 0.01, 100.0);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);
    }

    #[rstest]
    #[case::ahead(Vec3::new(0.0, 0.0, -5.0), true)]
    #[case::behind(Vec3::new(0.0, 0.0, 5.0), false)]
    #[case::far_left(Vec3::new(-500.0, 0.0, -5.0), false)]
    #[case::beyond_far(Vec3::new(0.0, 0.0, -500.0), false)]
    fn test_frustum_planes_classify_points(#[case] point: Vec3, #[case] inside: bool) {
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let ubo = UniformBufferObject::new(view, 800, 600, 45.0, 0.01, 100.0);

        let all_positive = ubo
            .frustum_planes
            .iter()
            .all(|plane| plane.truncate().dot(point) + plane.w >= 0.0);
        assert_eq!(all_positive, inside);
    }

    #[test]
    fn test_frustum_planes_are_normalised() {
        let view = Mat4::look_at_rh(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, Vec3::Y);
        let ubo = UniformBufferObject::new(view, 1280, 720, 45.0, 0.01, 100.0);
        for plane in ubo.frustum_planes {
            assert!((plane.truncate().length() - 1.0).abs() < 1e-4);
        }
    }
}
