//! Helix render core - retained scene graph rendering
//!
//! A [`RenderHost`] flattens the scene graph every frame, sorts the nodes
//! into render-type buckets, classifies them against the camera frustum and
//! hands the buckets to a [`Renderer`]. Opaque draws can be recorded in
//! parallel on deferred contexts and replayed in order on the immediate
//! context.
//!
//! # Features
//! - Order independent transparency (weighted blended and depth peeling)
//! - Post effects: border highlight, X-ray, blur and FXAA
//! - Screen-spaced overlays with their own camera
//! - Recording backend for headless tests, wgpu backend for real devices

pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod postprocess;
pub mod render;
pub mod scene;
pub mod technique;

pub use config::{FxaaLevel, MsaaLevel, OitMode, RenderConfiguration, SsaoConfig};
pub use error::{RenderError, RenderResult};
pub use host::RenderHost;
pub use render::{DeferredRenderer, ImmediateRenderer, RenderStatistics, Renderer};
pub use scene::{NodeId, RenderType, SceneNode};
pub use technique::{EffectsManager, ShaderPassName};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuDevice;
