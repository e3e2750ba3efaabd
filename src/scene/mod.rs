//! Scene description consumed by the renderer
//!
//! Meshes with their instance transforms, the batcher that flattens them for the
//! GPU, and the camera that supplies the view matrix.

pub mod batch;
pub mod camera;
pub mod demo;
pub mod mesh;

pub use batch::SceneBatch;
pub use camera::{Camera, CameraInput};
pub use demo::demo_scene;
pub use mesh::{Mesh, MeshBuilder, MeshInstances};
