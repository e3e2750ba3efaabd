//! Backend layer
//!
//! Shared GPU data layouts and the traits the frame loop is written against,
//! plus the Vulkan implementation.

pub mod traits;
pub mod types;
pub mod vulkan;

pub use traits::*;
pub use types::*;
