//! Packed binary scene format (`.mp`)
//!
//! All fields little-endian:
//!
//! ```text
//! header   u32 object_count
//!          u32 object_offsets[object_count]   absolute byte offsets
//! object   u32 vertex_count, index_count, normal_count, instance_count
//!          f32 vertices[vertex_count * 3]
//!          u16 indices[index_count]
//!          f32 normals[normal_count * 3]
//!          f32 instances[instance_count * 16] row-major
//! ```
//!
//! Objects are independent, so they are decoded on scoped worker threads that
//! each own a contiguous range of object indices. Results are joined in order.

use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::Vertex;
use crate::scene::mesh::{Mesh, MeshInstances};
use glam::{Mat4, Vec3};
use std::path::Path;

/// Bounds-checked little-endian reader over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn at(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    fn take(&mut self, len: usize, what: &str) -> RendererResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                RendererError::InvalidScene(format!(
                    "truncated packed scene: {} needs {} bytes at offset {}, file has {}",
                    what,
                    len,
                    self.position,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &str) -> RendererResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s(&mut self, count: usize, what: &str) -> RendererResult<Vec<f32>> {
        let len = count.checked_mul(4).ok_or_else(|| {
            RendererError::InvalidScene(format!("{} count {} overflows", what, count))
        })?;
        Ok(self
            .take(len, what)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn u16s(&mut self, count: usize, what: &str) -> RendererResult<Vec<u16>> {
        let len = count.checked_mul(2).ok_or_else(|| {
            RendererError::InvalidScene(format!("{} count {} overflows", what, count))
        })?;
        Ok(self
            .take(len, what)?
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect())
    }
}

fn parse_object(bytes: &[u8], index: usize, offset: u32) -> RendererResult<MeshInstances> {
    let mut reader = Reader::at(bytes, offset as usize);

    let vertex_count = reader.u32("vertex count")? as usize;
    let index_count = reader.u32("index count")? as usize;
    let normal_count = reader.u32("normal count")? as usize;
    let instance_count = reader.u32("instance count")?;

    let positions = reader.f32s(vertex_count.saturating_mul(3), "vertices")?;
    let indices = reader.u16s(index_count, "indices")?;
    // Normals are not part of the vertex layout
    reader.take(normal_count.saturating_mul(12), "normals")?;
    let matrices = reader.f32s((instance_count as usize).saturating_mul(16), "instances")?;

    let vertices = positions
        .chunks_exact(3)
        .map(|p| Vertex::new(Vec3::new(p[0], p[1], p[2]), Vec3::ONE))
        .collect();

    let instances = MeshInstances {
        mesh: Mesh::from_parts(
            &format!("object_{}", index),
            vertices,
            indices.into_iter().map(u32::from).collect(),
        ),
        instance_count,
        instance_model_matrices: matrices
            .chunks_exact(16)
            .map(|m| Mat4::from_cols_slice(m).transpose())
            .collect(),
    };
    instances.validate()?;
    Ok(instances)
}

/// Decode a packed scene held in memory.
pub fn parse_packed_scene(bytes: &[u8]) -> RendererResult<Vec<MeshInstances>> {
    let mut header = Reader::at(bytes, 0);
    let object_count = header.u32("object count")? as usize;
    let offsets = (0..object_count)
        .map(|_| header.u32("object offset"))
        .collect::<RendererResult<Vec<u32>>>()?;

    if offsets.is_empty() {
        return Ok(Vec::new());
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(offsets.len());
    let chunk_size = offsets.len().div_ceil(workers);

    log::debug!(
        "Parsing {} packed objects on {} threads",
        offsets.len(),
        workers
    );

    let partials: Vec<RendererResult<Vec<MeshInstances>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = offsets
            .chunks(chunk_size)
            .enumerate()
            .map(|(chunk, range)| {
                let first = chunk * chunk_size;
                scope.spawn(move || {
                    range
                        .iter()
                        .enumerate()
                        .map(|(i, &offset)| parse_object(bytes, first + i, offset))
                        .collect::<RendererResult<Vec<_>>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(RendererError::InvalidScene(
                        "packed scene worker panicked".into(),
                    ))
                })
            })
            .collect()
    });

    let mut scene = Vec::with_capacity(offsets.len());
    for partial in partials {
        scene.extend(partial?);
    }
    Ok(scene)
}

/// Read and decode a packed scene file.
pub fn load_packed_scene(path: &Path) -> RendererResult<Vec<MeshInstances>> {
    let bytes = std::fs::read(path).map_err(|e| RendererError::AssetLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_packed_scene(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    struct TestObject {
        positions: Vec<f32>,
        indices: Vec<u16>,
        normals: Vec<f32>,
        row_major_instances: Vec<[f32; 16]>,
    }

    fn triangle_object(shift: f32, instances: usize) -> TestObject {
        TestObject {
            positions: vec![shift, 0.0, 0.0, shift + 1.0, 0.0, 0.0, shift, 1.0, 0.0],
            indices: vec![0, 1, 2],
            normals: vec![0.0, 0.0, 1.0],
            row_major_instances: (0..instances)
                .map(|i| {
                    [
                        1.0, 0.0, 0.0, i as f32, //
                        0.0, 1.0, 0.0, 2.0, //
                        0.0, 0.0, 1.0, 3.0, //
                        0.0, 0.0, 0.0, 1.0,
                    ]
                })
                .collect(),
        }
    }

    fn encode(objects: &[TestObject]) -> Vec<u8> {
        let mut blobs = Vec::new();
        for object in objects {
            let mut blob = Vec::new();
            blob.extend((object.positions.len() as u32 / 3).to_le_bytes());
            blob.extend((object.indices.len() as u32).to_le_bytes());
            blob.extend((object.normals.len() as u32 / 3).to_le_bytes());
            blob.extend((object.row_major_instances.len() as u32).to_le_bytes());
            object.positions.iter().for_each(|f| blob.extend(f.to_le_bytes()));
            object.indices.iter().for_each(|i| blob.extend(i.to_le_bytes()));
            object.normals.iter().for_each(|f| blob.extend(f.to_le_bytes()));
            for matrix in &object.row_major_instances {
                matrix.iter().for_each(|f| blob.extend(f.to_le_bytes()));
            }
            blobs.push(blob);
        }

        let mut bytes = Vec::new();
        bytes.extend((objects.len() as u32).to_le_bytes());
        let mut offset = 4 + 4 * objects.len();
        for blob in &blobs {
            bytes.extend((offset as u32).to_le_bytes());
            offset += blob.len();
        }
        for blob in blobs {
            bytes.extend(blob);
        }
        bytes
    }

    #[test]
    fn test_parse_objects() {
        let bytes = encode(&[triangle_object(0.0, 2), triangle_object(5.0, 0)]);
        let scene = parse_packed_scene(&bytes).unwrap();

        assert_eq!(scene.len(), 2);
        assert_eq!(scene[0].mesh.indices, vec![0, 1, 2]);
        assert_eq!(scene[0].instance_count, 2);
        assert_eq!(
            scene[0].instance_model_matrices[1].w_axis,
            Vec4::new(1.0, 2.0, 3.0, 1.0)
        );
        assert_eq!(scene[1].mesh.vertices[0].position, Vec3::new(5.0, 0.0, 0.0));
        assert!(scene[1].instance_model_matrices.is_empty());
    }

    #[test]
    fn test_order_preserved_across_workers() {
        let objects: Vec<TestObject> = (0..37).map(|i| triangle_object(i as f32, 1)).collect();
        let scene = parse_packed_scene(&encode(&objects)).unwrap();

        assert_eq!(scene.len(), 37);
        for (i, entry) in scene.iter().enumerate() {
            assert_eq!(entry.mesh.name, format!("object_{}", i));
            assert_eq!(entry.mesh.vertices[0].position.x, i as f32);
        }
    }

    #[test]
    fn test_empty_file_has_no_objects() {
        assert!(parse_packed_scene(&0u32.to_le_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mut bytes = encode(&[triangle_object(0.0, 1)]);
        bytes.truncate(bytes.len() - 10);
        let err = parse_packed_scene(&bytes).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        assert!(matches!(
            parse_packed_scene(&[1, 0]),
            Err(RendererError::InvalidScene(_))
        ));
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut object = triangle_object(0.0, 1);
        object.indices = vec![0, 1, 9];
        assert!(matches!(
            parse_packed_scene(&encode(&[object])),
            Err(RendererError::InvalidScene(_))
        ));
    }
}
