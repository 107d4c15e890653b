//! Separable blur over a pair of offscreen targets

use glam::Vec4;

use crate::backend::{DeviceContext, RenderTargets, ScissorRect, Viewport};
use crate::postprocess::EffectConstants;
use crate::render::{RenderContext, TargetView};
use crate::technique::ShaderPassName;

/// Vertical then horizontal blur, iterated
///
/// Each iteration reads `source`, writes `scratch` vertically, then reads
/// `scratch` and writes `source` horizontally, so the result ends in
/// `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlurCore {
    iterations: u32,
}

impl Default for BlurCore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BlurCore {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Blur `source` in place; false when a blur pass is missing
    pub(crate) fn run(
        &self,
        ctx: &RenderContext<'_>,
        constants: &EffectConstants,
        source: TargetView,
        scratch: TargetView,
        dc: &mut dyn DeviceContext,
    ) -> bool {
        let (Some(vertical), Some(horizontal)) = (
            ctx.effects.get(ShaderPassName::EffectBlurVertical),
            ctx.effects.get(ShaderPassName::EffectBlurHorizontal),
        ) else {
            log::debug!("Blur passes unavailable, skipping blur");
            return false;
        };

        dc.set_viewport(Viewport::new(source.width, source.height));
        dc.set_scissor_rect(ScissorRect::new(source.width, source.height));
        constants.bind(dc, Vec4::ONE, Vec4::ZERO);
        for _ in 0..self.iterations {
            dc.set_render_targets(&RenderTargets::new(scratch.view, None));
            dc.set_shader_pass(vertical.handle);
            dc.set_texture(0, source.view);
            dc.draw_full_screen_quad();

            dc.set_render_targets(&RenderTargets::new(source.view, None));
            dc.set_shader_pass(horizontal.handle);
            dc.set_texture(0, scratch.view);
            dc.draw_full_screen_quad();
        }
        true
    }
}
