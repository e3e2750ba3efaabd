//! Mesh data structures and generation

use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::Vertex;
use glam::{Mat4, Vec2, Vec3};
use std::collections::HashMap;

/// Unique vertices plus an index list referencing them by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn from_parts(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            vertices,
            indices,
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// True when the mesh has nothing to draw.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Check that every index refers to an existing vertex.
    pub fn validate(&self) -> RendererResult<()> {
        let vertex_count = self.vertices.len();
        if let Some((position, &index)) = self
            .indices
            .iter()
            .enumerate()
            .find(|(_, &index)| index as usize >= vertex_count)
        {
            return Err(RendererError::InvalidScene(format!(
                "mesh '{}': index {} at position {} is out of range for {} vertices",
                self.name, index, position, vertex_count
            )));
        }
        Ok(())
    }

    /// Build a mesh from a triangle soup, merging identical vertices.
    pub fn from_triangles(name: &str, corners: &[Vertex]) -> Self {
        let mut builder = MeshBuilder::new(name);
        for &vertex in corners {
            builder.push(vertex);
        }
        builder.build()
    }

    /// Unit cube centered at origin, one colour per face.
    pub fn cube() -> Self {
        const FACES: [([Vec3; 4], Vec3); 6] = [
            // +Z
            (
                [
                    Vec3::new(-0.5, -0.5, 0.5),
                    Vec3::new(0.5, -0.5, 0.5),
                    Vec3::new(0.5, 0.5, 0.5),
                    Vec3::new(-0.5, 0.5, 0.5),
                ],
                Vec3::new(0.9, 0.2, 0.2),
            ),
            // -Z
            (
                [
                    Vec3::new(0.5, -0.5, -0.5),
                    Vec3::new(-0.5, -0.5, -0.5),
                    Vec3::new(-0.5, 0.5, -0.5),
                    Vec3::new(0.5, 0.5, -0.5),
                ],
                Vec3::new(0.2, 0.9, 0.2),
            ),
            // +X
            (
                [
                    Vec3::new(0.5, -0.5, 0.5),
                    Vec3::new(0.5, -0.5, -0.5),
                    Vec3::new(0.5, 0.5, -0.5),
                    Vec3::new(0.5, 0.5, 0.5),
                ],
                Vec3::new(0.2, 0.2, 0.9),
            ),
            // -X
            (
                [
                    Vec3::new(-0.5, -0.5, -0.5),
                    Vec3::new(-0.5, -0.5, 0.5),
                    Vec3::new(-0.5, 0.5, 0.5),
                    Vec3::new(-0.5, 0.5, -0.5),
                ],
                Vec3::new(0.9, 0.9, 0.2),
            ),
            // +Y
            (
                [
                    Vec3::new(-0.5, 0.5, 0.5),
                    Vec3::new(0.5, 0.5, 0.5),
                    Vec3::new(0.5, 0.5, -0.5),
                    Vec3::new(-0.5, 0.5, -0.5),
                ],
                Vec3::new(0.2, 0.9, 0.9),
            ),
            // -Y
            (
                [
                    Vec3::new(-0.5, -0.5, -0.5),
                    Vec3::new(0.5, -0.5, -0.5),
                    Vec3::new(0.5, -0.5, 0.5),
                    Vec3::new(-0.5, -0.5, 0.5),
                ],
                Vec3::new(0.9, 0.2, 0.9),
            ),
        ];

        let uvs = [
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ];

        let mut mesh = Mesh::new("cube");
        for (corners, color) in FACES {
            let base = mesh.vertices.len() as u32;
            for (position, uv) in corners.into_iter().zip(uvs) {
                mesh.vertices
                    .push(Vertex::new(position, color).with_tex_coord(uv));
            }
            mesh.indices.extend_from_slice(&[
                base,
                base + 1,
                base + 2,
                base,
                base + 2,
                base + 3,
            ]);
        }
        mesh
    }

    /// Square pyramid with its base on y = -0.5 and apex at y = 0.5.
    pub fn pyramid() -> Self {
        let apex = Vertex::new(Vec3::new(0.0, 0.5, 0.0), Vec3::ONE);
        let base = [
            Vec3::new(-0.5, -0.5, 0.5),
            Vec3::new(0.5, -0.5, 0.5),
            Vec3::new(0.5, -0.5, -0.5),
            Vec3::new(-0.5, -0.5, -0.5),
        ]
        .map(|p| Vertex::new(p, Vec3::new(0.8, 0.5, 0.1)));

        let mut corners = Vec::with_capacity(18);
        for i in 0..4 {
            corners.extend_from_slice(&[base[i], base[(i + 1) % 4], apex]);
        }
        // Base, facing down
        corners.extend_from_slice(&[base[0], base[3], base[2], base[0], base[2], base[1]]);

        Self::from_triangles("pyramid", &corners)
    }
}

/// Incrementally builds a mesh, deduplicating vertices by value.
pub struct MeshBuilder {
    name: String,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    unique: HashMap<Vertex, u32>,
}

impl MeshBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
            indices: Vec::new(),
            unique: HashMap::new(),
        }
    }

    /// Append one corner. Returns the index it resolved to.
    pub fn push(&mut self, vertex: Vertex) -> u32 {
        let next = self.vertices.len() as u32;
        let index = *self.unique.entry(vertex).or_insert(next);
        if index == next {
            self.vertices.push(vertex);
        }
        self.indices.push(index);
        index
    }

    pub fn build(self) -> Mesh {
        Mesh {
            vertices: self.vertices,
            indices: self.indices,
            name: self.name,
        }
    }
}

/// A mesh replicated by a list of model matrices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshInstances {
    pub mesh: Mesh,
    pub instance_count: u32,
    pub instance_model_matrices: Vec<Mat4>,
}

impl MeshInstances {
    pub fn new(mesh: Mesh, instance_model_matrices: Vec<Mat4>) -> Self {
        Self {
            mesh,
            instance_count: instance_model_matrices.len() as u32,
            instance_model_matrices,
        }
    }

    /// A single instance at the origin.
    pub fn single(mesh: Mesh) -> Self {
        Self::new(mesh, vec![Mat4::IDENTITY])
    }

    /// Check the ingestion invariants: one matrix per instance and indices in range.
    pub fn validate(&self) -> RendererResult<()> {
        if self.instance_model_matrices.len() != self.instance_count as usize {
            return Err(RendererError::InvalidScene(format!(
                "mesh '{}': instance_count is {} but {} model matrices were supplied",
                self.mesh.name,
                self.instance_count,
                self.instance_model_matrices.len()
            )));
        }
        self.mesh.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_geometry() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.index_count(), 36);
        assert!(cube.validate().is_ok());
    }

    #[test]
    fn test_pyramid_dedups_shared_corners() {
        let pyramid = Mesh::pyramid();
        // Four base corners plus the apex
        assert_eq!(pyramid.vertex_count(), 5);
        assert_eq!(pyramid.index_count(), 18);
        assert!(pyramid.validate().is_ok());
    }

    #[test]
    fn test_builder_reuses_indices() {
        let a = Vertex::new(Vec3::ZERO, Vec3::ONE);
        let b = Vertex::new(Vec3::X, Vec3::ONE);
        let mut builder = MeshBuilder::new("strip");
        assert_eq!(builder.push(a), 0);
        assert_eq!(builder.push(b), 1);
        assert_eq!(builder.push(a), 0);
        let mesh = builder.build();
        assert_eq!(mesh.vertices, vec![a, b]);
        assert_eq!(mesh.indices, vec![0, 1, 0]);
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mut mesh = Mesh::cube();
        mesh.indices.push(24);
        let err = mesh.validate().unwrap_err();
        assert!(matches!(err, RendererError::InvalidScene(_)));
    }

    #[test]
    fn test_validate_rejects_matrix_count_mismatch() {
        let mut instances = MeshInstances::single(Mesh::cube());
        instances.instance_count = 3;
        let err = instances.validate().unwrap_err();
        assert!(err.to_string().contains("instance_count is 3"));
    }
}
