//! Post-processing effects
//!
//! Nodes opt into a named effect with a [`PostEffect`] attribute. An effect
//! node (render type `PostEffect`) carries a [`PostEffectCore`] that renders
//! the tagged nodes into offscreen targets and composites the result onto
//! the main target.

mod blur;
mod fxaa;
mod outline;
mod xray;

pub use blur::BlurCore;
pub use fxaa::FxaaCore;
pub use outline::{OffscreenScale, OutlineCore};
pub use xray::XRayCore;

use std::fmt;
use std::sync::Arc;

use glam::Vec4;

use crate::backend::{DeviceContext, GpuBuffer, ObjectUniform, RenderDevice};
use crate::error::RenderResult;
use crate::render::{RenderBuffer, RenderContext, RenderParameter};
use crate::scene::SceneNode;

/// Effects a node can be tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostEffectName {
    BorderHighlight,
    XRay,
}

impl PostEffectName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostEffectName::BorderHighlight => "BorderHighlight",
            PostEffectName::XRay => "XRay",
        }
    }
}

impl fmt::Display for PostEffectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect attribute attached to a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostEffect {
    pub name: PostEffectName,
    pub color: Vec4,
}

impl PostEffect {
    pub fn border_highlight(color: Vec4) -> Self {
        Self {
            name: PostEffectName::BorderHighlight,
            color,
        }
    }

    pub fn x_ray(color: Vec4) -> Self {
        Self {
            name: PostEffectName::XRay,
            color,
        }
    }
}

/// A screen effect applied to a set of nodes
pub trait PostEffectCore: Send + Sync {
    /// Attribute name selecting the nodes this effect applies to
    fn effect_name(&self) -> PostEffectName;

    /// Render the effect for `nodes` and composite it onto `parameter`'s target
    ///
    /// Leaves the main targets of `parameter` bound. Returns the number of
    /// nodes drawn; a missing shader pass skips the effect.
    fn render_effect(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;
}

/// Per-draw constants of fullscreen effect passes (constant slot 1)
pub(crate) struct EffectConstants {
    buffer: GpuBuffer,
}

impl EffectConstants {
    pub(crate) fn new(device: &Arc<dyn RenderDevice>, label: &str) -> RenderResult<Self> {
        Ok(Self {
            buffer: GpuBuffer::uniform::<ObjectUniform>(device, label)?,
        })
    }

    /// Upload and bind constants for the next fullscreen draw
    pub(crate) fn bind(&self, dc: &mut dyn DeviceContext, color: Vec4, params: Vec4) {
        let mut constants = ObjectUniform::new(glam::Mat4::IDENTITY, color);
        constants.params = params;
        dc.update_buffer(self.buffer.handle(), 0, bytemuck::bytes_of(&constants));
        dc.set_constant_buffer(1, self.buffer.handle());
    }
}

/// Color of `node` for effect `name`, or `fallback` when untagged
pub(crate) fn effect_color(node: &SceneNode, name: PostEffectName, fallback: Vec4) -> Vec4 {
    node.post_effect(name).map_or(fallback, |effect| effect.color)
}
