//! Per-frame rendering
//!
//! Bucketizing, frustum classification, parallel recording and the
//! renderers that issue each bucket's draw calls.

mod buckets;
mod context;
mod cull;
mod deferred;
mod oit;
mod render_buffer;
mod renderer;
mod scheduler;
mod stats;

pub use buckets::FrameBuckets;
pub use context::{RenderContext, RenderParameter};
pub use cull::classify_frustum;
pub use deferred::DeferredRenderer;
pub use oit::{DepthPeelingOitCore, WeightedOitCore};
pub use render_buffer::{RenderBuffer, TargetView};
pub use renderer::{
    collect_lights, ImmediateRenderer, Renderer, LIGHT_SLOT, POST_PROCESS_FEATURE_LEVEL,
};
pub use scheduler::{RenderTaskScheduler, ScheduleOutcome};
pub use stats::RenderStatistics;
