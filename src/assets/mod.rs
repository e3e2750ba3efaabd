//! Asset loaders that produce the in-memory scene the renderer consumes
//!
//! Every loader validates what it produces, so malformed files fail here with
//! [`RendererError::InvalidScene`] rather than at upload time.

pub mod json_scene;
pub mod obj;
pub mod packed_scene;
pub mod texture;

use crate::backend::traits::{RendererError, RendererResult};
use crate::scene::mesh::MeshInstances;
use std::path::Path;

pub use json_scene::{load_json_scene, parse_json_scene};
pub use obj::{load_obj, parse_obj};
pub use packed_scene::{load_packed_scene, parse_packed_scene};
pub use texture::{decode_texture, load_texture, TextureData};

/// Load a scene, picking the format from the file extension.
///
/// `.json` and `.mp` describe whole scenes; `.obj` yields one mesh with a single
/// identity instance.
pub fn load_scene(path: &Path) -> RendererResult<Vec<MeshInstances>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    let scene = match extension.as_deref() {
        Some("json") => load_json_scene(path)?,
        Some("mp") => load_packed_scene(path)?,
        Some("obj") => vec![MeshInstances::single(load_obj(path)?)],
        _ => {
            return Err(RendererError::AssetLoad {
                path: path.display().to_string(),
                reason: "unsupported scene format (expected .json, .mp or .obj)".into(),
            })
        }
    };

    log::info!(
        "Loaded scene '{}': {} meshes, {} instances",
        path.display(),
        scene.len(),
        scene.iter().map(|m| m.instance_count as u64).sum::<u64>()
    );

    Ok(scene)
}
