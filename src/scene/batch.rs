//! Scene batching
//!
//! Merges a list of [`MeshInstances`] into one vertex buffer, one index buffer,
//! one indirect draw command per mesh, and flat per-instance transform and
//! bounding arrays. The draw command for mesh `i` covers instance range
//! `first_instance..first_instance + instance_count` of both per-instance arrays.

use crate::backend::traits::RendererResult;
use crate::backend::types::{BoundingData, DrawCommand, InstanceData, Vertex};
use crate::scene::mesh::MeshInstances;
use glam::Vec3;

/// Flat GPU-ready view of a scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneBatch {
    pub scene_vertices: Vec<Vertex>,
    /// Indices already rebased into `scene_vertices`.
    pub scene_indices: Vec<u32>,
    pub draw_commands: Vec<DrawCommand>,
    pub instance_data: Vec<InstanceData>,
    pub bounding_data: Vec<BoundingData>,
}

impl SceneBatch {
    /// Batch `meshes` in order.
    ///
    /// Meshes without vertices or indices are skipped and leave every offset
    /// untouched. Input that breaks the instance or index invariants is rejected
    /// before anything is merged.
    pub fn build(meshes: &[MeshInstances]) -> RendererResult<Self> {
        for entry in meshes {
            entry.validate()?;
        }

        let mut batch = SceneBatch::default();
        let mut first_instance = 0u32;

        for entry in meshes {
            let mesh = &entry.mesh;
            if mesh.is_empty() {
                log::debug!("Skipping mesh '{}' with no geometry", mesh.name);
                continue;
            }

            let vertex_offset = batch.scene_vertices.len() as u32;
            let first_index = batch.scene_indices.len() as u32;

            batch.scene_vertices.extend_from_slice(&mesh.vertices);
            batch
                .scene_indices
                .extend(mesh.indices.iter().map(|&index| index + vertex_offset));

            let centroid = local_centroid(&mesh.vertices);
            let radius = local_radius(&mesh.vertices);

            for model in &entry.instance_model_matrices {
                let center = model.w_axis.truncate() + centroid;
                batch.bounding_data.push(BoundingData::new(center, radius));
                batch.instance_data.push(InstanceData::new(*model));
            }

            batch.draw_commands.push(DrawCommand {
                index_count: mesh.indices.len() as u32,
                instance_count: entry.instance_count,
                first_index,
                vertex_offset: 0,
                first_instance,
            });

            first_instance += entry.instance_count;
        }

        Ok(batch)
    }

    /// Total number of instances across all draw commands.
    pub fn instance_count(&self) -> u32 {
        self.instance_data.len() as u32
    }

    /// True when there is nothing to draw.
    pub fn is_empty(&self) -> bool {
        self.draw_commands.is_empty()
    }

    /// Bounding radius of `instance` grown by the largest axis scale of its transform.
    ///
    /// The stored radius stays in local space; this is an opt-in correction for
    /// callers that scale instances.
    pub fn scaled_radius(&self, instance: usize) -> Option<f32> {
        let model = self.instance_data.get(instance)?.model;
        let bounds = self.bounding_data.get(instance)?;
        let scale = model
            .x_axis
            .truncate()
            .length()
            .max(model.y_axis.truncate().length())
            .max(model.z_axis.truncate().length());
        Some(bounds.radius.x * scale)
    }
}

/// Mean of all vertex positions.
fn local_centroid(vertices: &[Vertex]) -> Vec3 {
    let sum: Vec3 = vertices.iter().map(|v| v.position).sum();
    sum / vertices.len() as f32
}

/// Largest distance from the mesh origin to any vertex.
fn local_radius(vertices: &[Vertex]) -> f32 {
    vertices
        .iter()
        .map(|v| v.position.length())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::RendererError;
    use crate::scene::mesh::Mesh;
    use glam::{Mat4, Vec3};
    use rstest::rstest;

    fn quad() -> Mesh {
        let white = Vec3::ONE;
        Mesh::from_parts(
            "quad",
            vec![
                Vertex::new(Vec3::new(-1.0, -1.0, 0.0), white),
                Vertex::new(Vec3::new(1.0, -1.0, 0.0), white),
                Vertex::new(Vec3::new(1.0, 1.0, 0.0), white),
                Vertex::new(Vec3::new(-1.0, 1.0, 0.0), white),
            ],
            vec![0, 1, 2, 0, 2, 3],
        )
    }

    fn triangle() -> Mesh {
        let white = Vec3::ONE;
        Mesh::from_parts(
            "triangle",
            vec![
                Vertex::new(Vec3::new(0.0, 0.0, 0.0), white),
                Vertex::new(Vec3::new(3.0, 0.0, 0.0), white),
                Vertex::new(Vec3::new(0.0, 3.0, 0.0), white),
            ],
            vec![0, 1, 2],
        )
    }

    fn translations(count: usize) -> Vec<Mat4> {
        (0..count)
            .map(|i| Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, -(i as f32))))
            .collect()
    }

    fn mixed_scene() -> Vec<MeshInstances> {
        vec![
            MeshInstances::new(quad(), translations(2)),
            MeshInstances::new(Mesh::new("empty"), translations(4)),
            MeshInstances::new(Mesh::cube(), translations(5)),
            MeshInstances::new(triangle(), translations(1)),
            MeshInstances::new(Mesh::pyramid(), translations(3)),
        ]
    }

    fn scenes() -> Vec<Vec<MeshInstances>> {
        vec![
            Vec::new(),
            vec![MeshInstances::new(quad(), translations(2))],
            mixed_scene(),
            vec![
                MeshInstances::new(Mesh::cube(), translations(0)),
                MeshInstances::new(triangle(), translations(7)),
            ],
        ]
    }

    #[test]
    fn test_single_quad_two_instances() {
        let batch = SceneBatch::build(&[MeshInstances::new(quad(), translations(2))]).unwrap();

        assert_eq!(batch.draw_commands.len(), 1);
        assert_eq!(batch.instance_data.len(), 2);
        assert_eq!(batch.scene_vertices.len(), 4);
        assert_eq!(
            batch.draw_commands[0],
            DrawCommand {
                index_count: 6,
                instance_count: 2,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            }
        );
    }

    #[test]
    fn test_empty_mesh_is_ignored() {
        let batch = SceneBatch::build(&[
            MeshInstances::new(Mesh::new("empty"), translations(1)),
            MeshInstances::new(triangle(), translations(1)),
        ])
        .unwrap();

        assert_eq!(batch.draw_commands.len(), 1);
        assert_eq!(batch.draw_commands[0].first_instance, 0);
        assert_eq!(batch.draw_commands[0].first_index, 0);
        assert_eq!(batch.scene_vertices.len(), 3);
        assert_eq!(batch.scene_indices, vec![0, 1, 2]);
        assert_eq!(batch.instance_data.len(), 1);
        assert_eq!(batch.bounding_data.len(), 1);
    }

    #[test]
    fn test_mesh_without_indices_is_ignored() {
        let mut no_indices = quad();
        no_indices.indices.clear();
        let batch = SceneBatch::build(&[
            MeshInstances::new(no_indices, translations(3)),
            MeshInstances::new(quad(), translations(1)),
        ])
        .unwrap();

        assert_eq!(batch.draw_commands.len(), 1);
        assert_eq!(batch.scene_vertices.len(), 4);
        assert_eq!(batch.instance_count(), 1);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::single(1)]
    #[case::mixed(2)]
    #[case::zero_instances(3)]
    fn test_instance_totals_agree(#[case] scene: usize) {
        let batch = SceneBatch::build(&scenes()[scene]).unwrap();
        let total: u32 = batch.draw_commands.iter().map(|c| c.instance_count).sum();
        assert_eq!(total as usize, batch.instance_data.len());
        assert_eq!(batch.instance_data.len(), batch.bounding_data.len());
    }

    #[rstest]
    #[case::single(1)]
    #[case::mixed(2)]
    #[case::zero_instances(3)]
    fn test_indices_stay_inside_their_mesh(#[case] scene: usize) {
        let input = &scenes()[scene];
        let batch = SceneBatch::build(input).unwrap();
        let retained: Vec<&Mesh> = input
            .iter()
            .map(|entry| &entry.mesh)
            .filter(|mesh| !mesh.is_empty())
            .collect();
        assert_eq!(retained.len(), batch.draw_commands.len());

        let mut vertex_offset = 0u32;
        for (mesh, command) in retained.iter().zip(&batch.draw_commands) {
            let start = command.first_index as usize;
            let end = start + command.index_count as usize;
            let upper = vertex_offset + mesh.vertex_count() as u32;
            for &index in &batch.scene_indices[start..end] {
                assert!(index >= vertex_offset && index < upper);
            }
            vertex_offset = upper;
        }
        assert_eq!(vertex_offset as usize, batch.scene_vertices.len());
    }

    #[rstest]
    #[case::single(1)]
    #[case::mixed(2)]
    #[case::zero_instances(3)]
    fn test_first_instance_partitions_range(#[case] scene: usize) {
        let batch = SceneBatch::build(&scenes()[scene]).unwrap();
        let mut expected = 0;
        for command in &batch.draw_commands {
            assert_eq!(command.first_instance, expected);
            expected += command.instance_count;
        }
        assert_eq!(expected, batch.instance_count());
    }

    #[test]
    fn test_empty_meshes_do_not_perturb_offsets() {
        let mut with_gaps = mixed_scene();
        with_gaps.insert(0, MeshInstances::new(Mesh::new("leading"), translations(2)));
        with_gaps.push(MeshInstances::new(Mesh::new("trailing"), translations(1)));

        let without: Vec<MeshInstances> = mixed_scene()
            .into_iter()
            .filter(|entry| !entry.mesh.is_empty())
            .collect();

        assert_eq!(
            SceneBatch::build(&with_gaps).unwrap(),
            SceneBatch::build(&without).unwrap()
        );
    }

    #[test]
    fn test_batching_is_deterministic() {
        let input = mixed_scene();
        let first = SceneBatch::build(&input).unwrap();
        let second = SceneBatch::build(&input).unwrap();
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&first.scene_vertices),
            bytemuck::cast_slice::<_, u8>(&second.scene_vertices)
        );
        assert_eq!(first.scene_indices, second.scene_indices);
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&first.instance_data),
            bytemuck::cast_slice::<_, u8>(&second.instance_data)
        );
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(&first.bounding_data),
            bytemuck::cast_slice::<_, u8>(&second.bounding_data)
        );
        assert_eq!(first.draw_commands, second.draw_commands);
    }

    #[test]
    fn test_bounding_data() {
        let model = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let batch = SceneBatch::build(&[MeshInstances::new(triangle(), vec![model])]).unwrap();

        let bounds = batch.bounding_data[0];
        assert_eq!(bounds.center, glam::Vec4::new(11.0, 1.0, 0.0, 1.0));
        assert_eq!(bounds.radius.x, 3.0);
        assert_eq!(batch.instance_data[0].model, model);
        assert_eq!(batch.instance_data[0].usage, glam::Vec4::ZERO);
    }

    #[test]
    fn test_radius_ignores_instance_scale() {
        let scaled = Mat4::from_scale(Vec3::splat(4.0));
        let batch = SceneBatch::build(&[MeshInstances::new(triangle(), vec![scaled])]).unwrap();

        assert_eq!(batch.bounding_data[0].radius.x, 3.0);
        assert_eq!(batch.scaled_radius(0), Some(12.0));
        assert_eq!(batch.scaled_radius(1), None);
    }

    #[test]
    fn test_zero_instance_mesh_keeps_geometry() {
        let batch = SceneBatch::build(&[
            MeshInstances::new(quad(), Vec::new()),
            MeshInstances::new(triangle(), translations(1)),
        ])
        .unwrap();

        assert_eq!(batch.draw_commands.len(), 2);
        assert_eq!(batch.draw_commands[0].instance_count, 0);
        assert_eq!(batch.draw_commands[1].first_instance, 0);
        assert_eq!(batch.draw_commands[1].first_index, 6);
        assert_eq!(batch.instance_count(), 1);
    }

    #[test]
    fn test_matrix_count_mismatch_is_rejected() {
        let mut bad = MeshInstances::new(quad(), translations(2));
        bad.instance_count = 5;
        let err = SceneBatch::build(&[bad]).unwrap_err();
        assert!(matches!(err, RendererError::InvalidScene(_)));
    }
}
