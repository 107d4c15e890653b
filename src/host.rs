//! Render host: lifecycle and per-frame orchestration
//!
//! The host owns the scene roots, the camera and the configuration. Device
//! state (shader passes, render targets, the immediate context and the
//! renderer) exists only between [`RenderHost::start`] and
//! [`RenderHost::end`].

use std::sync::Arc;
use std::time::Instant;

use crate::backend::{BufferDescriptor, DeviceContext, GlobalUniform, GpuBuffer, RenderDevice};
use crate::config::{OitMode, RenderConfiguration};
use crate::error::{RenderError, RenderResult};
use crate::render::{
    classify_frustum, collect_lights, DeferredRenderer, FrameBuckets, ImmediateRenderer,
    RenderBuffer, RenderContext, RenderParameter, RenderStatistics, Renderer, TargetView,
};
use crate::scene::{flatten, AttachContext, Camera, GpuLightData, NodeId, SceneNode, MAX_LIGHTS};
use crate::technique::EffectsManager;

/// Device state of a started host
struct RenderState {
    effects: EffectsManager,
    buffers: RenderBuffer,
    immediate: Box<dyn DeviceContext>,
    renderer: Box<dyn Renderer>,
    globals: GpuBuffer,
    lights: GpuBuffer,
}

/// Drives rendering of a scene into an offscreen back buffer
pub struct RenderHost {
    device: Arc<dyn RenderDevice>,
    config: RenderConfiguration,
    camera: Camera,
    roots: Vec<SceneNode>,
    state: Option<RenderState>,
    stats: RenderStatistics,
    frame_index: u64,
}

impl RenderHost {
    pub fn new(device: Arc<dyn RenderDevice>, config: RenderConfiguration) -> Self {
        Self {
            device,
            config,
            camera: Camera::default(),
            roots: Vec::new(),
            state: None,
            stats: RenderStatistics::default(),
            frame_index: 0,
        }
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    /// Create device state for a `width` x `height` surface and attach the scene
    pub fn start(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if self.state.is_some() {
            self.end();
        }
        let sample_count = self.config.msaa.sample_count();
        let effects = EffectsManager::builder()
            .sample_count(sample_count)
            .with_all_passes()
            .build(self.device.as_ref())?;
        let buffers = RenderBuffer::new(self.device.clone(), width, height, sample_count)?;
        let immediate = self.device.create_immediate_context()?;
        let immediate_renderer =
            ImmediateRenderer::new(&self.device, self.config.oit_depth_peeling_layers)?;
        let renderer: Box<dyn Renderer> = if self.config.enable_parallel_processing {
            Box::new(DeferredRenderer::new(self.device.clone(), immediate_renderer))
        } else {
            Box::new(immediate_renderer)
        };
        let globals = GpuBuffer::uniform::<GlobalUniform>(&self.device, "globals")?;
        let lights = GpuBuffer::new(
            &self.device,
            &BufferDescriptor::uniform(
                "lights",
                (std::mem::size_of::<GpuLightData>() * MAX_LIGHTS) as u64,
            ),
        )?;

        let attach = AttachContext {
            device: &self.device,
            effects: &effects,
        };
        if let Err(err) = self.roots.iter_mut().try_for_each(|root| root.attach(&attach)) {
            for root in &mut self.roots {
                root.detach();
            }
            return Err(err);
        }
        self.camera.set_aspect(width, height);

        log::info!(
            "Render host started on {} ({}x{}, {} renderer, {}x MSAA)",
            self.device.name(),
            width,
            height,
            renderer.name(),
            sample_count
        );
        self.state = Some(RenderState {
            effects,
            buffers,
            immediate,
            renderer,
            globals,
            lights,
        });
        Ok(())
    }

    /// Recreate the render targets at a new size
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let state = self.state.as_mut().ok_or(RenderError::NotStarted)?;
        state.buffers.resize(width, height)?;
        self.camera.set_aspect(width, height);
        log::debug!("Render host resized to {}x{}", width, height);
        Ok(())
    }

    /// Detach the scene and release all device state
    pub fn end(&mut self) {
        for root in &mut self.roots {
            root.detach();
        }
        if self.state.take().is_some() {
            log::info!("Render host ended");
        }
    }

    /// Size of the render targets, if started
    pub fn size(&self) -> Option<(u32, u32)> {
        self.state
            .as_ref()
            .map(|state| (state.buffers.width(), state.buffers.height()))
    }

    /// Add a top-level node, attaching it when the host is started
    pub fn add_root(&mut self, mut node: SceneNode) -> RenderResult<NodeId> {
        if let Some(state) = &self.state {
            node.attach(&AttachContext {
                device: &self.device,
                effects: &state.effects,
            })?;
        }
        let id = node.id();
        self.roots.push(node);
        Ok(id)
    }

    /// Remove a top-level node and release its device state
    pub fn remove_root(&mut self, id: NodeId) -> Option<SceneNode> {
        let index = self.roots.iter().position(|root| root.id() == id)?;
        let mut node = self.roots.remove(index);
        node.detach();
        Some(node)
    }

    pub fn roots(&self) -> &[SceneNode] {
        &self.roots
    }

    /// Nodes added below these roots are attached on the next frame
    pub fn roots_mut(&mut self) -> &mut [SceneNode] {
        &mut self.roots
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, mut camera: Camera) {
        if let Some((width, height)) = self.size() {
            camera.set_aspect(width, height);
        }
        self.camera = camera;
    }

    pub fn configuration(&self) -> &RenderConfiguration {
        &self.config
    }

    /// Replace the configuration; device state is rebuilt when MSAA or parallel recording changes
    pub fn set_configuration(&mut self, config: RenderConfiguration) -> RenderResult<()> {
        let rebuild = config.msaa != self.config.msaa
            || config.enable_parallel_processing != self.config.enable_parallel_processing
            || config.oit_depth_peeling_layers != self.config.oit_depth_peeling_layers;
        self.config = config;
        match self.size() {
            Some((width, height)) if rebuild => self.start(width, height),
            _ => Ok(()),
        }
    }

    pub fn statistics(&self) -> &RenderStatistics {
        &self.stats
    }

    /// Back buffer holding the last rendered frame
    pub fn back_buffer(&self) -> Option<TargetView> {
        self.state.as_ref().map(|state| state.buffers.back_buffer())
    }

    /// Render one frame
    ///
    /// Returns false when the device was lost; device state is then rebuilt
    /// at the same size and the frame is dropped.
    pub fn render(&mut self) -> RenderResult<bool> {
        let Some((width, height)) = self.size() else {
            return Err(RenderError::NotStarted);
        };
        match self.render_frame() {
            Ok(()) => Ok(true),
            Err(err) if err.is_device_lost() => {
                log::warn!("Device lost while rendering, restarting render host");
                self.end();
                match self.start(width, height) {
                    Ok(()) => {}
                    Err(err) if err.is_device_lost() => {
                        log::warn!("Device still lost, render host stays stopped");
                    }
                    Err(err) => return Err(err),
                }
                Ok(false)
            }
            Err(err) => {
                log::error!("Frame {} failed: {}", self.frame_index, err);
                Err(err)
            }
        }
    }

    fn render_frame(&mut self) -> RenderResult<()> {
        let frame_start = Instant::now();
        self.frame_index += 1;
        self.stats.begin_frame();

        let state = self.state.as_mut().ok_or(RenderError::NotStarted)?;
        let effects = &state.effects;
        let buffers = &mut state.buffers;
        let renderer = state.renderer.as_ref();
        let dc = state.immediate.as_mut();

        // Attach new nodes and sync dirty ones
        let attach = AttachContext {
            device: &self.device,
            effects,
        };
        for root in &mut self.roots {
            root.attach(&attach)?;
        }
        let synced = renderer.update_scene_graph(&mut self.roots);

        let config = &self.config;
        let mut entries = Vec::new();
        flatten(&self.roots, |_| true, &mut entries);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, config.enable_render_order);

        let ctx = RenderContext::new(
            &self.camera,
            state.globals.handle(),
            config,
            effects,
            self.device.feature_level(),
            buffers.width(),
            buffers.height(),
        )
        .with_frame_index(self.frame_index);
        let frustum_start = Instant::now();
        classify_frustum(&mut buckets, &ctx.frustum, config.enable_frustum_test);
        self.stats.frustum_test_time = frustum_start.elapsed();

        let (light_data, ambient) = collect_lights(&buckets.light);
        let ctx = ctx.with_lights(state.lights.handle(), light_data.len(), ambient);

        let mut parameter = RenderParameter::new(
            buffers.color().view,
            Some(buffers.depth().view),
            buffers.width(),
            buffers.height(),
        );
        parameter.is_msaa = buffers.has_msaa();
        parameter.render_light = config.render_light;
        parameter.update_per_frame_data = config.update_per_frame_data;

        log::debug!(
            "Frame {}: {} entries, {} bucketed, {} synced",
            self.frame_index,
            entries.len(),
            buckets.len(),
            synced
        );

        let rendered = std::thread::scope(|scope| {
            let update = if config.enable_parallel_processing {
                let (ctx, buckets) = (&ctx, &buckets);
                Some(scope.spawn(move || update_not_render(ctx, buckets)))
            } else {
                update_not_render(&ctx, &buckets);
                None
            };

            let result = record_frame(renderer, &ctx, &buckets, &light_data, buffers, &parameter, dc);

            if let Some(update) = update {
                if update.join().is_err() {
                    log::warn!("Update thread panicked");
                }
            }
            result
        })?;

        self.stats.nodes_rendered = rendered;
        self.stats.nodes_bucketed = buckets.len();
        self.stats.triangles = [
            &buckets.opaque_in_frustum,
            &buckets.transparent_in_frustum,
            &buckets.particle,
            &buckets.screen_spaced,
        ]
        .iter()
        .flat_map(|bucket| bucket.iter())
        .filter_map(|node| node.core())
        .map(|core| core.triangle_count())
        .sum();
        self.stats.command_lists = renderer.last_command_lists();
        self.stats.frame_time = frame_start.elapsed();
        Ok(())
    }
}

impl Drop for RenderHost {
    fn drop(&mut self) {
        self.end();
    }
}

fn update_not_render(ctx: &RenderContext<'_>, buckets: &FrameBuckets<'_>) {
    let nodes = buckets
        .opaque
        .iter()
        .chain(&buckets.transparent)
        .chain(&buckets.particle)
        .chain(&buckets.screen_spaced);
    for core in nodes.filter_map(|node| node.core()) {
        core.update_not_render(ctx);
    }
}

fn needs_prepass(config: &RenderConfiguration, buffers: &RenderBuffer) -> bool {
    // Transparency depth-tests against single-sampled depth.
    buffers.has_msaa() && (config.enable_depth_prepass || config.oit_mode != OitMode::Disabled)
}

/// Record every phase of one frame on the immediate context
fn record_frame(
    renderer: &dyn Renderer,
    ctx: &RenderContext<'_>,
    buckets: &FrameBuckets<'_>,
    lights: &[GpuLightData],
    buffers: &mut RenderBuffer,
    parameter: &RenderParameter,
    dc: &mut dyn DeviceContext,
) -> RenderResult<usize> {
    let config = ctx.config;
    parameter.bind(dc);
    dc.clear_render_target(parameter.target, config.clear_color);
    if let Some(depth) = parameter.depth_stencil {
        dc.clear_depth_stencil(depth, 1.0, 0);
    }
    renderer.update_global_variables(ctx, parameter, lights, dc)?;

    let mut rendered = renderer.render_pre_proc(ctx, &buckets.pre_proc, parameter, dc)?;
    if needs_prepass(config, buffers) {
        renderer.render_depth_prepass(ctx, &buckets.opaque_in_frustum, buffers, parameter, dc)?;
    }
    rendered += renderer.render_opaque(ctx, &buckets.opaque_in_frustum, parameter, dc, false)?;
    rendered += renderer.render_particles(ctx, &buckets.particle, parameter, dc)?;
    rendered += renderer.render_transparent(
        ctx,
        &buckets.transparent_in_frustum,
        &buckets.opaque_in_frustum,
        buffers,
        parameter,
        dc,
    )?;

    renderer.render_post_proc(
        ctx,
        &buckets.post_effect,
        &buckets.nodes_with_post_effect,
        buffers,
        parameter,
        dc,
    )?;
    if !buckets.global_effect.is_empty() {
        let visible: Vec<_> = buckets
            .opaque_in_frustum
            .iter()
            .chain(&buckets.transparent_in_frustum)
            .copied()
            .collect();
        renderer.render_global_effects(ctx, &buckets.global_effect, &visible, buffers, parameter, dc)?;
    }
    rendered += renderer.render_screen_spaced(ctx, &buckets.screen_spaced, parameter, dc)?;

    renderer.render_to_back_buffer(ctx, buffers, dc)?;
    dc.flush()?;
    Ok(rendered)
}
