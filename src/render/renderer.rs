//! Bucket renderers
//!
//! [`Renderer`] is the per-frame entry point the host drives, one method per
//! phase. [`ImmediateRenderer`] records every draw on the immediate context.

use std::sync::Arc;

use bytemuck::Zeroable;
use glam::{Mat4, Vec3};

use crate::backend::{DeviceContext, FeatureLevel, RenderDevice, RenderTargets, ScissorRect, Viewport};
use crate::config::OitMode;
use crate::error::RenderResult;
use crate::postprocess::FxaaCore;
use crate::render::{DepthPeelingOitCore, RenderBuffer, RenderContext, RenderParameter, WeightedOitCore};
use crate::scene::{GpuLightData, LightKind, SceneNode, MAX_LIGHTS};
use crate::technique::ShaderPassName;

/// Constant slot of the light buffer
pub const LIGHT_SLOT: u32 = 2;

/// Minimum feature level for OIT and FXAA
pub const POST_PROCESS_FEATURE_LEVEL: FeatureLevel = FeatureLevel::Level10_0;

/// Per-frame rendering phases
pub trait Renderer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propagate transforms and sync dirty cores
    fn update_scene_graph(&self, roots: &mut [SceneNode]) -> usize {
        roots
            .iter_mut()
            .map(|root| root.update(&Mat4::IDENTITY, false))
            .sum()
    }

    /// Upload per-frame constants and the light buffer
    fn update_global_variables(
        &self,
        ctx: &RenderContext<'_>,
        parameter: &RenderParameter,
        lights: &[GpuLightData],
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()>;

    fn render_pre_proc(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    /// Depth-only pass into the single-sampled prepass depth
    fn render_depth_prepass(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    fn render_opaque(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
        test_frustum: bool,
    ) -> RenderResult<usize>;

    fn render_particles(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    /// Transparent nodes, through OIT when enabled and supported
    fn render_transparent(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        occluders: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    /// Effect nodes applied to the nodes tagged with their effect name
    fn render_post_proc(
        &self,
        ctx: &RenderContext<'_>,
        effects: &[&SceneNode],
        tagged: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    /// Effect nodes applied to every node in `nodes`
    fn render_global_effects(
        &self,
        ctx: &RenderContext<'_>,
        effects: &[&SceneNode],
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    fn render_screen_spaced(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize>;

    /// Resolve or copy the main target into the current ping-pong texture
    fn render_to_ping_pong_buffer(
        &self,
        buffers: &RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()>;

    /// FXAA if enabled, flush, then resolve or copy into the back buffer
    fn render_to_back_buffer(
        &self,
        ctx: &RenderContext<'_>,
        buffers: &mut RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()>;

    /// Command lists replayed by the last opaque pass
    fn last_command_lists(&self) -> usize {
        0
    }
}

/// Light records of `nodes` and the summed ambient color
pub fn collect_lights(nodes: &[&SceneNode]) -> (Vec<GpuLightData>, Vec3) {
    let mut lights = Vec::new();
    let mut ambient = Vec3::ZERO;
    for data in nodes
        .iter()
        .filter_map(|node| node.core().and_then(|core| core.light_data()))
    {
        if data.kind() == LightKind::Ambient as u32 as f32 {
            ambient += data.color_intensity.truncate() * data.color_intensity.w;
        } else if lights.len() < MAX_LIGHTS {
            lights.push(data);
        } else {
            log::warn!("More than {} lights in the scene, extra lights ignored", MAX_LIGHTS);
            break;
        }
    }
    (lights, ambient)
}

/// Render `nodes` with their own shader passes
pub(crate) fn render_nodes(
    ctx: &RenderContext<'_>,
    nodes: &[&SceneNode],
    dc: &mut dyn DeviceContext,
    test_frustum: bool,
) -> RenderResult<usize> {
    let mut rendered = 0;
    for node in nodes {
        if test_frustum && !node.test_view_frustum(&ctx.frustum) {
            continue;
        }
        if node.render(ctx, dc)? {
            rendered += 1;
        }
    }
    Ok(rendered)
}

fn render_effect_nodes(
    ctx: &RenderContext<'_>,
    effects: &[&SceneNode],
    nodes: &[&SceneNode],
    filter_by_name: bool,
    buffers: &RenderBuffer,
    parameter: &RenderParameter,
    dc: &mut dyn DeviceContext,
) -> RenderResult<usize> {
    let mut rendered = 0;
    for effect in effects
        .iter()
        .filter_map(|node| node.core().and_then(|core| core.as_post_effect()))
    {
        let name = effect.effect_name();
        let targets: Vec<&SceneNode> = nodes
            .iter()
            .copied()
            .filter(|node| !filter_by_name || node.post_effect(name).is_some())
            .collect();
        rendered += effect.render_effect(ctx, &targets, buffers, parameter, dc)?;
    }
    Ok(rendered)
}

/// Renders every bucket on the immediate context
pub struct ImmediateRenderer {
    fxaa: FxaaCore,
    weighted: WeightedOitCore,
    peeling: DepthPeelingOitCore,
}

impl ImmediateRenderer {
    pub fn new(device: &Arc<dyn RenderDevice>, peeling_layers: u32) -> RenderResult<Self> {
        Ok(Self {
            fxaa: FxaaCore::new(device)?,
            weighted: WeightedOitCore::new(),
            peeling: DepthPeelingOitCore::new(peeling_layers),
        })
    }
}

impl Renderer for ImmediateRenderer {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn update_global_variables(
        &self,
        ctx: &RenderContext<'_>,
        parameter: &RenderParameter,
        lights: &[GpuLightData],
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        if parameter.update_per_frame_data {
            dc.update_buffer(ctx.globals(), 0, bytemuck::bytes_of(&ctx.global_uniform()));
        }
        dc.set_constant_buffer(0, ctx.globals());

        if let (true, Some(buffer)) = (parameter.render_light, ctx.lights()) {
            let mut data = [GpuLightData::zeroed(); MAX_LIGHTS];
            let count = lights.len().min(MAX_LIGHTS);
            data[..count].copy_from_slice(&lights[..count]);
            dc.update_buffer(buffer, 0, bytemuck::cast_slice(&data));
            dc.set_constant_buffer(LIGHT_SLOT, buffer);
        }
        Ok(())
    }

    fn render_pre_proc(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        _parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        render_nodes(ctx, nodes, dc, false)
    }

    fn render_depth_prepass(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        let Some(depth) = buffers.prepass_depth() else {
            return Ok(0);
        };
        let Some(pass) = ctx.effects.get(ShaderPassName::DepthPrepass) else {
            log::debug!("Depth prepass unavailable, skipping");
            return Ok(0);
        };
        dc.set_render_targets(&RenderTargets::depth_only(depth.view));
        dc.set_viewport(Viewport::new(depth.width, depth.height));
        dc.set_scissor_rect(ScissorRect::new(depth.width, depth.height));
        dc.clear_depth_stencil(depth.view, 1.0, 0);
        dc.set_shader_pass(pass.handle);
        let mut rendered = 0;
        for node in nodes {
            if node.render_custom(ctx, dc, None)? {
                rendered += 1;
            }
        }
        parameter.bind(dc);
        Ok(rendered)
    }

    fn render_opaque(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        _parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
        test_frustum: bool,
    ) -> RenderResult<usize> {
        render_nodes(ctx, nodes, dc, test_frustum)
    }

    fn render_particles(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        _parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        render_nodes(ctx, nodes, dc, false)
    }

    fn render_transparent(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        occluders: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        if ctx.feature_level >= POST_PROCESS_FEATURE_LEVEL {
            let oit = match ctx.config.oit_mode {
                OitMode::SinglePassWeighted => {
                    self.weighted.render(ctx, nodes, buffers, parameter, dc)?
                }
                OitMode::DepthPeeling => {
                    self.peeling
                        .render(ctx, nodes, occluders, buffers, parameter, dc)?
                }
                OitMode::Disabled => None,
            };
            if let Some(rendered) = oit {
                return Ok(rendered);
            }
        }
        render_nodes(ctx, nodes, dc, false)
    }

    fn render_post_proc(
        &self,
        ctx: &RenderContext<'_>,
        effects: &[&SceneNode],
        tagged: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        render_effect_nodes(ctx, effects, tagged, true, buffers, parameter, dc)
    }

    fn render_global_effects(
        &self,
        ctx: &RenderContext<'_>,
        effects: &[&SceneNode],
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        render_effect_nodes(ctx, effects, nodes, false, buffers, parameter, dc)
    }

    fn render_screen_spaced(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        if nodes.is_empty() {
            return Ok(0);
        }
        let mut overlay: Option<RenderContext<'_>> = None;
        let mut rendered = 0;
        for node in nodes {
            if let Some(root) = node.core().and_then(|core| core.as_screen_spaced()) {
                overlay = Some(root.begin(ctx, parameter, dc)?);
                continue;
            }
            let node_ctx = overlay.as_ref().unwrap_or(ctx);
            if node.render(node_ctx, dc)? {
                rendered += 1;
            }
        }
        dc.set_viewport(parameter.viewport);
        dc.set_constant_buffer(0, ctx.globals());
        Ok(rendered)
    }

    fn render_to_ping_pong_buffer(
        &self,
        buffers: &RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        let color = buffers.color();
        let target = buffers.current_ping_pong();
        if buffers.has_msaa() {
            dc.resolve_texture(color.view, target.view);
        } else {
            dc.copy_texture(color.texture, target.texture);
        }
        Ok(())
    }

    fn render_to_back_buffer(
        &self,
        ctx: &RenderContext<'_>,
        buffers: &mut RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        let back_buffer = buffers.back_buffer();
        let fxaa = ctx.config.fxaa_level.is_enabled() && ctx.feature_level >= POST_PROCESS_FEATURE_LEVEL;
        if fxaa {
            // FXAA reads a single-sampled texture, so it runs before the final copy.
            self.render_to_ping_pong_buffer(buffers, dc)?;
            if self.fxaa.render(
                ctx,
                ctx.config.fxaa_level,
                buffers.current_ping_pong(),
                buffers.next_ping_pong(),
                dc,
            ) {
                buffers.swap_ping_pong();
            }
            dc.flush()?;
            dc.copy_texture(buffers.current_ping_pong().texture, back_buffer.texture);
        } else {
            dc.flush()?;
            let color = buffers.color();
            if buffers.has_msaa() {
                dc.resolve_texture(color.view, back_buffer.view);
            } else {
                dc.copy_texture(color.texture, back_buffer.texture);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Light, LightCore, RenderType};

    #[test]
    fn ambient_lights_are_summed() {
        let mut nodes = vec![
            SceneNode::new("ambient", RenderType::Light, LightCore::new(Light::Ambient { color: Vec3::splat(0.1) })),
            SceneNode::new("ambient 2", RenderType::Light, LightCore::new(Light::Ambient { color: Vec3::splat(0.2) })),
            SceneNode::new("sun", RenderType::Light, LightCore::new(Light::directional(Vec3::ONE, 1.0))),
        ];
        for node in &mut nodes {
            node.mark_attached();
            node.update(&Mat4::IDENTITY, false);
        }
        let refs: Vec<&SceneNode> = nodes.iter().collect();
        let (lights, ambient) = collect_lights(&refs);
        assert_eq!(lights.len(), 1);
        assert!(ambient.abs_diff_eq(Vec3::splat(0.3), 1e-6));
    }
}
