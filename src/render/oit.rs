//! Order independent transparency
//!
//! Both cores draw transparent geometry into single-sampled offscreen
//! targets and composite the result onto the main target. They return
//! `None` when one of their passes is missing so the caller can fall back
//! to plain blending.

use crate::backend::{DeviceContext, RenderTargets, ScissorRect, TextureFormat, Viewport};
use crate::error::RenderResult;
use crate::render::{RenderBuffer, RenderContext, RenderParameter, TargetView};
use crate::scene::SceneNode;
use crate::technique::{ShaderPassName, COLOR_FORMAT, DEPTH_FORMAT};

/// Offscreen slots used by transparency targets
const OIT_SLOT: u32 = 16;

fn bind_full_frame(dc: &mut dyn DeviceContext, targets: &RenderTargets, width: u32, height: u32) {
    dc.set_render_targets(targets);
    dc.set_viewport(Viewport::new(width, height));
    dc.set_scissor_rect(ScissorRect::new(width, height));
}

/// Single pass weighted blended transparency
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedOitCore;

impl WeightedOitCore {
    pub fn new() -> Self {
        Self
    }

    /// Accumulate `nodes` and composite; depth-tests against opaque depth
    pub fn render(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<Option<usize>> {
        let (Some(accumulate), Some(composite)) = (
            ctx.effects.get(ShaderPassName::OitWeighted),
            ctx.effects.get(ShaderPassName::OitComposite),
        ) else {
            log::debug!("Weighted OIT passes unavailable");
            return Ok(None);
        };
        if nodes.is_empty() {
            return Ok(Some(0));
        }

        let (width, height) = (buffers.width(), buffers.height());
        let accum = buffers.offscreen(width, height, TextureFormat::Rgba16Float, OIT_SLOT)?;
        let reveal = buffers.offscreen(width, height, TextureFormat::R16Float, OIT_SLOT)?;
        let depth = buffers.single_sampled_depth();

        bind_full_frame(
            dc,
            &RenderTargets {
                colors: vec![accum.view, reveal.view],
                depth_stencil: Some(depth.view),
            },
            width,
            height,
        );
        dc.clear_render_target(accum.view, [0.0; 4]);
        dc.clear_render_target(reveal.view, [1.0; 4]);
        dc.set_shader_pass(accumulate.handle);
        let mut drawn = 0;
        for node in nodes {
            if node.render_custom(ctx, dc, None)? {
                drawn += 1;
            }
        }

        parameter.bind(dc);
        dc.set_shader_pass(composite.handle);
        dc.set_texture(0, accum.view);
        dc.set_texture(1, reveal.view);
        dc.draw_full_screen_quad();
        Ok(Some(drawn))
    }
}

/// Depth peeling: one layer per pass, blended back to front
#[derive(Debug, Clone, Copy)]
pub struct DepthPeelingOitCore {
    layers: u32,
}

impl DepthPeelingOitCore {
    pub fn new(layers: u32) -> Self {
        Self {
            layers: layers.max(1),
        }
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Peel `nodes` into layers occluded by `occluders`, then blend the layers
    pub fn render(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        occluders: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<Option<usize>> {
        let (Some(peel), Some(blend)) = (
            ctx.effects.get(ShaderPassName::OitDepthPeeling),
            ctx.effects.get(ShaderPassName::OitDepthPeelingBlend),
        ) else {
            log::debug!("Depth peeling passes unavailable");
            return Ok(None);
        };
        if nodes.is_empty() {
            return Ok(Some(0));
        }
        let depth_only = ctx.effects.get(ShaderPassName::DepthPrepass);

        let (width, height) = (buffers.width(), buffers.height());
        let depth = buffers.offscreen(width, height, DEPTH_FORMAT, OIT_SLOT)?;
        let layer_depths = [
            buffers.offscreen(width, height, TextureFormat::R32Float, OIT_SLOT)?,
            buffers.offscreen(width, height, TextureFormat::R32Float, OIT_SLOT + 1)?,
        ];
        let layers: Vec<TargetView> = (0..self.layers)
            .map(|layer| buffers.offscreen(width, height, COLOR_FORMAT, OIT_SLOT + layer))
            .collect::<RenderResult<_>>()?;

        // Nothing peeled yet: the first layer compares against depth 0.
        bind_full_frame(dc, &RenderTargets::new(layer_depths[1].view, None), width, height);
        dc.clear_render_target(layer_depths[1].view, [0.0; 4]);

        let mut drawn = 0;
        for (index, layer) in layers.iter().enumerate() {
            let written = layer_depths[index % 2];
            let previous = layer_depths[(index + 1) % 2];

            bind_full_frame(dc, &RenderTargets::depth_only(depth.view), width, height);
            dc.clear_depth_stencil(depth.view, 1.0, 0);
            if let Some(depth_only) = depth_only {
                dc.set_shader_pass(depth_only.handle);
                for occluder in occluders {
                    occluder.render_custom(ctx, dc, None)?;
                }
            }

            bind_full_frame(
                dc,
                &RenderTargets {
                    colors: vec![layer.view, written.view],
                    depth_stencil: Some(depth.view),
                },
                width,
                height,
            );
            dc.clear_render_target(layer.view, [0.0; 4]);
            dc.clear_render_target(written.view, [0.0; 4]);
            dc.set_shader_pass(peel.handle);
            dc.set_texture(0, previous.view);
            for node in nodes {
                if node.render_custom(ctx, dc, None)? && index == 0 {
                    drawn += 1;
                }
            }
        }

        parameter.bind(dc);
        dc.set_shader_pass(blend.handle);
        for layer in layers.iter().rev() {
            dc.set_texture(0, layer.view);
            dc.draw_full_screen_quad();
        }
        log::trace!("Peeled {} layers of {} nodes", self.layers, drawn);
        Ok(Some(drawn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peeling_needs_a_layer() {
        assert_eq!(DepthPeelingOitCore::new(0).layers(), 1);
        assert_eq!(DepthPeelingOitCore::new(4).layers(), 4);
    }
}
