//! Border highlight (outline) effect
//!
//! Tagged nodes are drawn as solid silhouettes into an offscreen mask at a
//! fraction of the frame size. A copy of the mask is blurred, and the
//! fullscreen composite keeps only the blurred halo outside the mask, so the
//! highlight lands on the border and the object interior stays untouched.

use glam::Vec4;

use crate::backend::{DeviceContext, RenderTargets, ScissorRect, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::postprocess::{effect_color, BlurCore, EffectConstants, PostEffectCore, PostEffectName};
use crate::render::{RenderBuffer, RenderContext, RenderParameter};
use crate::scene::{AttachContext, RenderCore, SceneNode};
use crate::technique::{ShaderPassName, COLOR_FORMAT, DEPTH_FORMAT};

/// Offscreen resolution relative to the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffscreenScale {
    Full,
    #[default]
    Half,
    Quarter,
}

impl OffscreenScale {
    pub fn divisor(&self) -> u32 {
        match self {
            OffscreenScale::Full => 1,
            OffscreenScale::Half => 2,
            OffscreenScale::Quarter => 4,
        }
    }

    /// Scaled size, never below one pixel
    pub fn apply(&self, width: u32, height: u32) -> (u32, u32) {
        let divisor = self.divisor();
        ((width / divisor).max(1), (height / divisor).max(1))
    }
}

/// Outline effect core for [`PostEffectName::BorderHighlight`]
pub struct OutlineCore {
    scale: OffscreenScale,
    blur: BlurCore,
    intensity: f32,
    default_color: Vec4,
    constants: Option<EffectConstants>,
}

impl Default for OutlineCore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutlineCore {
    pub fn new() -> Self {
        Self {
            scale: OffscreenScale::Half,
            blur: BlurCore::new(1),
            intensity: 1.0,
            default_color: Vec4::new(1.0, 0.5, 0.0, 1.0),
            constants: None,
        }
    }

    pub fn with_scale(mut self, scale: OffscreenScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_blur_iterations(mut self, iterations: u32) -> Self {
        self.blur = BlurCore::new(iterations);
        self
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    /// Color used for nodes without a border highlight attribute
    pub fn with_default_color(mut self, color: Vec4) -> Self {
        self.default_color = color;
        self
    }

    pub fn scale(&self) -> OffscreenScale {
        self.scale
    }
}

impl PostEffectCore for OutlineCore {
    fn effect_name(&self) -> PostEffectName {
        PostEffectName::BorderHighlight
    }

    fn render_effect(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        if nodes.is_empty() {
            return Ok(0);
        }
        let constants = self
            .constants
            .as_ref()
            .ok_or_else(|| RenderError::NotAttached("outline effect".into()))?;
        let (Some(silhouette), Some(composite)) = (
            ctx.effects.get(ShaderPassName::EffectOutlineP1),
            ctx.effects.get(ShaderPassName::EffectOutlineP2),
        ) else {
            log::debug!("Outline passes unavailable, skipping border highlight");
            return Ok(0);
        };

        // Silhouettes
        let (width, height) = self.scale.apply(buffers.width(), buffers.height());
        let color = buffers.offscreen(width, height, COLOR_FORMAT, 0)?;
        let scratch = buffers.offscreen(width, height, COLOR_FORMAT, 1)?;
        let mask = buffers.offscreen(width, height, COLOR_FORMAT, 2)?;
        let depth = buffers.offscreen(width, height, DEPTH_FORMAT, 0)?;
        dc.set_render_targets(&RenderTargets::new(mask.view, Some(depth.view)));
        dc.clear_render_target(mask.view, [0.0; 4]);
        dc.clear_depth_stencil(depth.view, 1.0, 0);
        dc.set_viewport(Viewport::new(width, height));
        dc.set_scissor_rect(ScissorRect::new(width, height));
        dc.set_shader_pass(silhouette.handle);
        let mut drawn = 0;
        for node in nodes {
            let tint = effect_color(node, PostEffectName::BorderHighlight, self.default_color);
            if node.render_custom(ctx, dc, Some(tint))? {
                drawn += 1;
            }
        }

        // Blur a copy, then composite the part outside the mask
        dc.copy_texture(mask.texture, color.texture);
        self.blur.run(ctx, constants, color, scratch, dc);
        parameter.bind(dc);
        dc.set_shader_pass(composite.handle);
        constants.bind(
            dc,
            Vec4::new(1.0, 1.0, 1.0, self.intensity),
            Vec4::new(0.0, 0.0, parameter.viewport.width, parameter.viewport.height),
        );
        dc.set_texture(0, color.view);
        dc.set_texture(1, mask.view);
        dc.draw_full_screen_quad();
        log::trace!("Outlined {} nodes at {}x{}", drawn, width, height);
        Ok(drawn)
    }
}

impl RenderCore for OutlineCore {
    fn attach(&mut self, ctx: &AttachContext<'_>) -> RenderResult<()> {
        self.constants = Some(EffectConstants::new(ctx.device, "outline constants")?);
        Ok(())
    }

    fn detach(&mut self) {
        self.constants = None;
    }

    fn render(&self, _ctx: &RenderContext<'_>, _dc: &mut dyn DeviceContext) -> RenderResult<()> {
        Ok(())
    }

    fn as_post_effect(&self) -> Option<&dyn PostEffectCore> {
        Some(self)
    }
}
