//! Renderer recording opaque draws on deferred contexts
//!
//! Only the opaque pass is parallelised. Below the scheduler threshold it
//! falls back to the immediate renderer; every other phase always runs on
//! the immediate context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{DeferredContextPool, DeviceContext, RenderDevice};
use crate::error::RenderResult;
use crate::render::{
    ImmediateRenderer, RenderBuffer, RenderContext, RenderParameter, RenderTaskScheduler, Renderer,
};
use crate::scene::{GpuLightData, SceneNode};

/// [`ImmediateRenderer`] with a parallel opaque pass
pub struct DeferredRenderer {
    immediate: ImmediateRenderer,
    pool: DeferredContextPool,
    last_command_lists: AtomicUsize,
}

impl DeferredRenderer {
    pub fn new(device: Arc<dyn RenderDevice>, immediate: ImmediateRenderer) -> Self {
        Self {
            immediate,
            pool: DeferredContextPool::new(device),
            last_command_lists: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &DeferredContextPool {
        &self.pool
    }
}

impl Renderer for DeferredRenderer {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn update_global_variables(
        &self,
        ctx: &RenderContext<'_>,
        parameter: &RenderParameter,
        lights: &[GpuLightData],
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        self.immediate
            .update_global_variables(ctx, parameter, lights, dc)
    }

    fn render_pre_proc(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        self.immediate.render_pre_proc(ctx, nodes, parameter, dc)
    }

    fn render_depth_prepass(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        buffers: &RenderBuffer,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        self.immediate
            .render_depth_prepass(ctx, nodes, buffers, parameter, dc)
    }

    fn render_opaque(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
        test_frustum: bool,
    ) -> RenderResult<usize> {
        self.last_command_lists.store(0, Ordering::Relaxed);
        let scheduler = RenderTaskScheduler::from_config(ctx.config);
        let outcome = scheduler.schedule_and_run(nodes, &self.pool, ctx, parameter, test_frustum)?;
        if !outcome.committed {
            return self
                .immediate
                .render_opaque(ctx, nodes, parameter, dc, test_frustum);
        }

        self.last_command_lists
            .store(outcome.command_lists.len(), Ordering::Relaxed);
        let rendered = outcome.replay(dc)?;
        // Replayed lists leave the immediate context state undefined.
        parameter.bind(dc);
        dc.set_constant_buffer(0, ctx.globals());
        Ok(rendered)
    }

    fn render_particles(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        self.immediate.render_particles(ctx, nodes, parameter, dc)
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
        self.immediate
            .render_transparent(ctx, nodes, occluders, buffers, parameter, dc)
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
        self.immediate
            .render_post_proc(ctx, effects, tagged, buffers, parameter, dc)
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
        self.immediate
            .render_global_effects(ctx, effects, nodes, buffers, parameter, dc)
    }

    fn render_screen_spaced(
        &self,
        ctx: &RenderContext<'_>,
        nodes: &[&SceneNode],
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<usize> {
        self.immediate
            .render_screen_spaced(ctx, nodes, parameter, dc)
    }

    fn render_to_ping_pong_buffer(
        &self,
        buffers: &RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        self.immediate.render_to_ping_pong_buffer(buffers, dc)
    }

    fn render_to_back_buffer(
        &self,
        ctx: &RenderContext<'_>,
        buffers: &mut RenderBuffer,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<()> {
        self.immediate.render_to_back_buffer(ctx, buffers, dc)
    }

    fn last_command_lists(&self) -> usize {
        self.last_command_lists.load(Ordering::Relaxed)
    }
}
