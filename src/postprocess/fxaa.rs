//! Fast approximate anti-aliasing

use std::sync::Arc;

use glam::Vec4;

use crate::backend::{DeviceContext, RenderDevice, RenderTargets, ScissorRect, Viewport};
use crate::config::FxaaLevel;
use crate::error::RenderResult;
use crate::postprocess::EffectConstants;
use crate::render::{RenderContext, TargetView};
use crate::technique::ShaderPassName;

/// FXAA over single-sampled color targets
pub struct FxaaCore {
    constants: EffectConstants,
}

impl FxaaCore {
    pub fn new(device: &Arc<dyn RenderDevice>) -> RenderResult<Self> {
        Ok(Self {
            constants: EffectConstants::new(device, "fxaa constants")?,
        })
    }

    /// Filter `source` into `target`; false when FXAA is off or its pass is missing
    pub fn render(
        &self,
        ctx: &RenderContext<'_>,
        level: FxaaLevel,
        source: TargetView,
        target: TargetView,
        dc: &mut dyn DeviceContext,
    ) -> bool {
        if !level.is_enabled() {
            return false;
        }
        let Some(pass) = ctx.effects.get(ShaderPassName::Fxaa) else {
            log::debug!("FXAA pass unavailable, skipping");
            return false;
        };
        dc.set_render_targets(&RenderTargets::new(target.view, None));
        dc.set_viewport(Viewport::new(target.width, target.height));
        dc.set_scissor_rect(ScissorRect::new(target.width, target.height));
        dc.set_shader_pass(pass.handle);
        self.constants
            .bind(dc, Vec4::ONE, Vec4::new(level.edge_threshold(), 0.0, 0.0, 0.0));
        dc.set_texture(0, source.view);
        dc.draw_full_screen_quad();
        true
    }
}
