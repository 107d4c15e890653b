//! Backend abstraction layer
//!
//! Device and context traits plus two implementations: a recording device
//! used for tests and a headless wgpu device.

pub mod pool;
pub mod recording;
pub mod resource;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use pool::{DeferredContextPool, PooledContext};
pub use recording::{RecordedCommand, RecordingContext, RecordingDevice};
pub use resource::{GpuBuffer, GpuResource, GpuTexture, ResourceStack};
pub use traits::*;
pub use types::*;

#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::{WgpuContext, WgpuDevice};
