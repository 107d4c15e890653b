//! X-ray effect: occluded parts of tagged meshes drawn in a flat color

use glam::Vec4;

use crate::backend::DeviceContext;
use crate::error::RenderResult;
use crate::postprocess::{effect_color, PostEffectCore, PostEffectName};
use crate::render::{RenderBuffer, RenderContext, RenderParameter};
use crate::scene::{AttachContext, RenderCore, SceneNode};
use crate::technique::ShaderPassName;

/// Stencil value written by the marking pass
const XRAY_STENCIL: u32 = 1;

/// Stencil reference of single-pass mode; never written, so the test always passes
const XRAY_STENCIL_UNUSED: u32 = 0xFF;

/// X-ray effect core for [`PostEffectName::XRay`]
///
/// Double-pass mode first marks the visible parts of every tagged mesh in
/// the stencil buffer, then colors occluded parts only where nothing was
/// marked, which avoids stacking color where tagged meshes overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XRayCore {
    double_pass: bool,
    default_color: Vec4,
}

impl Default for XRayCore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl XRayCore {
    pub fn new(double_pass: bool) -> Self {
        Self {
            double_pass,
            default_color: Vec4::new(0.3, 0.6, 1.0, 0.5),
        }
    }

    pub fn with_default_color(mut self, color: Vec4) -> Self {
        self.default_color = color;
        self
    }

    pub fn is_double_pass(&self) -> bool {
        self.double_pass
    }

    pub fn set_double_pass(&mut self, double_pass: bool) {
        self.double_pass = double_pass;
    }
}

impl PostEffectCore for XRayCore {
    fn effect_name(&self) -> PostEffectName {
        PostEffectName::XRay
    }

    fn render_effect(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        _buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        if nodes.is_empty() {
            return Ok(0);
        }
        let Some(color_pass) = ctx.effects.get(ShaderPassName::EffectMeshXRayP2) else {
            log::debug!("X-ray pass unavailable, skipping");
            return Ok(0);
        };
        parameter.bind(dc);

        let reference = match (self.double_pass, ctx.effects.get(ShaderPassName::EffectMeshXRayP1)) {
            (true, Some(mark_pass)) => {
                dc.set_shader_pass(mark_pass.handle);
                dc.set_stencil_reference(XRAY_STENCIL);
                for node in nodes {
                    node.render_custom(ctx, dc, None)?;
                }
                XRAY_STENCIL
            }
            (true, None) => {
                log::debug!("X-ray marking pass unavailable, using single pass");
                XRAY_STENCIL_UNUSED
            }
            (false, _) => XRAY_STENCIL_UNUSED,
        };

        dc.set_shader_pass(color_pass.handle);
        dc.set_stencil_reference(reference);
        let mut drawn = 0;
        for node in nodes {
            let color = effect_color(node, PostEffectName::XRay, self.default_color);
            if node.render_custom(ctx, dc, Some(color))? {
                drawn += 1;
            }
        }
        Ok(drawn)
    }
}

impl RenderCore for XRayCore {
    fn attach(&mut self, _ctx: &AttachContext<'_>) -> RenderResult<()> {
        Ok(())
    }

    fn detach(&mut self) {}

    fn render(&self, _ctx: &RenderContext<'_>, _dc: &mut dyn DeviceContext) -> RenderResult<()> {
        Ok(())
    }

    fn as_post_effect(&self) -> Option<&dyn PostEffectCore> {
        Some(self)
    }
}
