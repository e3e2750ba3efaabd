//! JSON scene description
//!
//! ```json
//! { "models": { "crate": {
//!     "vertices": [x, y, z, ...],
//!     "indices": [0, 1, 2, ...],
//!     "instance_count": 1,
//!     "instances": [[[1,0,0,0],[0,1,0,0],[0,0,1,0],[tx,ty,tz,1]]]
//! } } }
//! ```
//!
//! Each instance lists the four matrix columns. Models keep the order the file declares them in.

use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::Vertex;
use crate::scene::mesh::{Mesh, MeshInstances};
use glam::{Mat4, Vec3};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct SceneFile {
    /// Insertion ordered (`preserve_order`), so mesh order follows the file.
    models: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    vertices: Vec<f32>,
    indices: Vec<u32>,
    instance_count: u32,
    #[serde(default)]
    instances: Vec<[[f32; 4]; 4]>,
}

/// Parse a JSON scene from text.
pub fn parse_json_scene(text: &str) -> RendererResult<Vec<MeshInstances>> {
    let file: SceneFile = serde_json::from_str(text)?;

    file.models
        .into_iter()
        .map(|(name, value)| {
            let entry: ModelEntry = serde_json::from_value(value)?;
            if entry.vertices.len() % 3 != 0 {
                return Err(RendererError::InvalidScene(format!(
                    "model '{}': {} vertex floats is not a multiple of 3",
                    name,
                    entry.vertices.len()
                )));
            }

            let vertices = entry
                .vertices
                .chunks_exact(3)
                .map(|p| Vertex::new(Vec3::new(p[0], p[1], p[2]), Vec3::ONE))
                .collect();

            let instances = MeshInstances {
                mesh: Mesh::from_parts(&name, vertices, entry.indices),
                instance_count: entry.instance_count,
                instance_model_matrices: entry
                    .instances
                    .iter()
                    .map(Mat4::from_cols_array_2d)
                    .collect(),
            };
            instances.validate()?;
            Ok(instances)
        })
        .collect()
}

/// Read and parse a JSON scene file.
pub fn load_json_scene(path: &Path) -> RendererResult<Vec<MeshInstances>> {
    let text = std::fs::read_to_string(path).map_err(|e| RendererError::AssetLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_json_scene(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const SCENE: &str = r#"{
        "models": {
            "triangle": {
                "vertices": [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                "indices": [0, 1, 2],
                "instance_count": 2,
                "instances": [
                    [[1,0,0,0],[0,1,0,0],[0,0,1,0],[5,6,7,1]],
                    [[2,0,0,0],[0,2,0,0],[0,0,2,0],[0,0,0,1]]
                ]
            },
            "a_point_cloud": {
                "vertices": [],
                "indices": [],
                "instance_count": 0
            }
        }
    }"#;

    #[test]
    fn test_parse_scene() {
        let scene = parse_json_scene(SCENE).unwrap();
        assert_eq!(scene.len(), 2);

        assert_eq!(scene[1].mesh.name, "a_point_cloud");
        assert!(scene[1].mesh.is_empty());

        let triangle = &scene[0];
        assert_eq!(triangle.mesh.name, "triangle");
        assert_eq!(triangle.mesh.vertex_count(), 3);
        assert_eq!(triangle.mesh.vertices[1].position, Vec3::X);
        assert_eq!(triangle.mesh.vertices[1].color, Vec3::ONE);
        assert_eq!(triangle.instance_count, 2);
        assert_eq!(
            triangle.instance_model_matrices[0].w_axis,
            Vec4::new(5.0, 6.0, 7.0, 1.0)
        );
        assert_eq!(triangle.instance_model_matrices[1].x_axis.x, 2.0);
    }

    #[test]
    fn test_models_keep_file_order() {
        let text = r#"{"models": {
            "zeta": {"vertices": [], "indices": [], "instance_count": 0},
            "alpha": {"vertices": [], "indices": [], "instance_count": 0},
            "mid": {"vertices": [], "indices": [], "instance_count": 0}
        }}"#;
        let names: Vec<_> = parse_json_scene(text)
            .unwrap()
            .into_iter()
            .map(|m| m.mesh.name)
            .collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_instance_count_mismatch() {
        let text = r#"{"models": {"m": {
            "vertices": [0,0,0, 1,0,0, 0,1,0],
            "indices": [0,1,2],
            "instance_count": 3,
            "instances": [[[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]]]
        }}}"#;
        let err = parse_json_scene(text).unwrap_err();
        assert!(matches!(err, RendererError::InvalidScene(_)));
    }

    #[test]
    fn test_index_out_of_range() {
        let text = r#"{"models": {"m": {
            "vertices": [0,0,0, 1,0,0, 0,1,0],
            "indices": [0,1,3],
            "instance_count": 0
        }}}"#;
        assert!(matches!(
            parse_json_scene(text),
            Err(RendererError::InvalidScene(_))
        ));
    }

    #[test]
    fn test_ragged_vertices() {
        let text = r#"{"models": {"m": {"vertices": [0,0], "indices": [], "instance_count": 0}}}"#;
        assert!(matches!(
            parse_json_scene(text),
            Err(RendererError::InvalidScene(_))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            parse_json_scene("{\"models\": 3}"),
            Err(RendererError::Json(_))
        ));
    }
}
