//! Wavefront OBJ models
//!
//! Faces are triangulated and expanded corner by corner, then merged back into
//! unique vertices through [`MeshBuilder`]. All shapes in the file become one mesh.

use crate::backend::traits::{RendererError, RendererResult};
use crate::backend::types::Vertex;
use crate::scene::mesh::{Mesh, MeshBuilder};
use glam::{Vec2, Vec3};
use std::path::Path;

fn load_options() -> tobj::LoadOptions {
    tobj::LoadOptions {
        triangulate: true,
        single_index: false,
        ..Default::default()
    }
}

fn build_mesh(name: &str, models: &[tobj::Model]) -> RendererResult<Mesh> {
    let mut builder = MeshBuilder::new(name);

    for model in models {
        let mesh = &model.mesh;
        let has_tex_coords = !mesh.texcoord_indices.is_empty();

        for (corner, &position_index) in mesh.indices.iter().enumerate() {
            let p = position_index as usize * 3;
            let position = mesh
                .positions
                .get(p..p + 3)
                .map(|p| Vec3::new(p[0], p[1], p[2]))
                .ok_or_else(|| {
                    RendererError::InvalidScene(format!(
                        "{}: position index {} out of range",
                        name, position_index
                    ))
                })?;

            let mut vertex = Vertex::new(position, Vec3::ONE);
            if has_tex_coords {
                let uv = mesh.texcoord_indices.get(corner).and_then(|&index| {
                    let t = index as usize * 2;
                    mesh.texcoords.get(t..t + 2)
                });
                if let Some(uv) = uv {
                    // OBJ puts v = 0 at the bottom of the image
                    vertex = vertex.with_tex_coord(Vec2::new(uv[0], 1.0 - uv[1]));
                }
            }
            builder.push(vertex);
        }
    }

    Ok(builder.build())
}

/// Parse OBJ text. `mtllib` references are ignored.
pub fn parse_obj(name: &str, text: &str) -> RendererResult<Mesh> {
    let (models, _materials) = tobj::load_obj_buf(
        &mut std::io::Cursor::new(text),
        &load_options(),
        |_| Err(tobj::LoadError::OpenFileFailed),
    )
    .map_err(|e| RendererError::AssetLoad {
        path: name.to_string(),
        reason: e.to_string(),
    })?;

    build_mesh(name, &models)
}

/// Load an OBJ file from disk.
pub fn load_obj(path: &Path) -> RendererResult<Mesh> {
    let (models, _materials) =
        tobj::load_obj(path, &load_options()).map_err(|e| RendererError::AssetLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("model");
    build_mesh(name, &models)
}
