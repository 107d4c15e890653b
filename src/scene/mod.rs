//! Retained scene graph
//!
//! Nodes, their render cores, the flattener consumed by the per-frame
//! bucketizer, and the camera, light and bounding volume types they use.

mod bounds;
mod camera;
mod cores;
mod flatten;
mod light;
mod node;
mod transform;

pub use bounds::*;
pub use camera::*;
pub use cores::*;
pub use flatten::*;
pub use light::*;
pub use node::*;
pub use transform::*;
