//! Per-frame render state

use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    BufferHandle, DeviceContext, FeatureLevel, GlobalUniform, RenderTargets, ScissorRect,
    TextureViewHandle, Viewport,
};
use crate::config::RenderConfiguration;
use crate::scene::{BoundingFrustum, Camera};
use crate::technique::EffectsManager;

/// Read-mostly state shared by every draw of one frame
///
/// Rebuilt by the host each frame and shared by reference with parallel
/// recording workers.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub camera: Camera,
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub frustum: BoundingFrustum,
    pub config: &'a RenderConfiguration,
    pub effects: &'a EffectsManager,
    pub feature_level: FeatureLevel,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub light_count: usize,
    pub ambient: Vec3,
    globals: BufferHandle,
    lights: Option<BufferHandle>,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        camera: &Camera,
        globals: BufferHandle,
        config: &'a RenderConfiguration,
        effects: &'a EffectsManager,
        feature_level: FeatureLevel,
        width: u32,
        height: u32,
    ) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        let view_projection = projection * view;
        Self {
            camera: camera.clone(),
            view,
            projection,
            view_projection,
            frustum: BoundingFrustum::from_view_projection(&view_projection),
            config,
            effects,
            feature_level,
            frame_index: 0,
            width,
            height,
            light_count: 0,
            ambient: Vec3::ZERO,
            globals,
            lights: None,
        }
    }

    pub fn with_frame_index(mut self, frame_index: u64) -> Self {
        self.frame_index = frame_index;
        self
    }

    /// Light buffer and the lights it holds
    pub fn with_lights(mut self, buffer: BufferHandle, count: usize, ambient: Vec3) -> Self {
        self.lights = Some(buffer);
        self.light_count = count;
        self.ambient = ambient;
        self
    }

    /// Per-frame constant buffer (slot 0)
    pub fn globals(&self) -> BufferHandle {
        self.globals
    }

    pub fn lights(&self) -> Option<BufferHandle> {
        self.lights
    }

    /// Same frame seen through another camera, with its own constant buffer
    pub fn with_camera(&self, camera: Camera, globals: BufferHandle, width: u32, height: u32) -> RenderContext<'a> {
        let mut ctx = RenderContext::new(
            &camera,
            globals,
            self.config,
            self.effects,
            self.feature_level,
            width,
            height,
        );
        ctx.frame_index = self.frame_index;
        ctx.light_count = self.light_count;
        ctx.ambient = self.ambient;
        ctx.lights = self.lights;
        ctx
    }

    /// Contents of the per-frame constant buffer
    pub fn global_uniform(&self) -> GlobalUniform {
        let width = self.width.max(1) as f32;
        let height = self.height.max(1) as f32;
        GlobalUniform {
            view: self.view,
            projection: self.projection,
            view_projection: self.view_projection,
            camera_position: self.camera.position.extend(1.0),
            viewport: Vec4::new(width, height, 1.0 / width, 1.0 / height),
            frame: Vec4::new(
                if self.config.render_light {
                    self.light_count as f32
                } else {
                    0.0
                },
                self.frame_index as f32,
                self.config.ssao.radius,
                if self.config.ssao.enabled {
                    self.config.ssao.intensity
                } else {
                    0.0
                },
            ),
            ambient: self.ambient.extend(1.0),
        }
    }
}

/// Target state threaded through the render calls of one frame
///
/// Passes that redirect output (ping-pong, offscreen effects) change the
/// target and restore it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParameter {
    pub target: TextureViewHandle,
    pub depth_stencil: Option<TextureViewHandle>,
    pub viewport: Viewport,
    pub scissor: ScissorRect,
    pub is_msaa: bool,
    pub render_light: bool,
    pub update_per_frame_data: bool,
}

impl RenderParameter {
    pub fn new(
        target: TextureViewHandle,
        depth_stencil: Option<TextureViewHandle>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            target,
            depth_stencil,
            viewport: Viewport::new(width, height),
            scissor: ScissorRect::new(width, height),
            is_msaa: false,
            render_light: true,
            update_per_frame_data: true,
        }
    }

    pub fn targets(&self) -> RenderTargets {
        RenderTargets::new(self.target, self.depth_stencil)
    }

    /// Bind targets, viewport and scissor on `dc`
    pub fn bind(&self, dc: &mut dyn DeviceContext) {
        dc.set_render_targets(&self.targets());
        dc.set_viewport(self.viewport);
        dc.set_scissor_rect(self.scissor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordedCommand, RecordingDevice, RenderDevice};

    #[test]
    fn global_uniform_carries_viewport_and_lights() {
        let device = RecordingDevice::new();
        let effects = EffectsManager::builder().build(&device).unwrap();
        let config = RenderConfiguration::default();
        let ctx = RenderContext::new(
            &Camera::default(),
            BufferHandle(1),
            &config,
            &effects,
            FeatureLevel::Level11_0,
            200,
            100,
        )
        .with_lights(BufferHandle(2), 3, Vec3::splat(0.1))
        .with_frame_index(7);

        let globals = ctx.global_uniform();
        assert_eq!(globals.viewport, Vec4::new(200.0, 100.0, 0.005, 0.01));
        assert_eq!(globals.frame.x, 3.0);
        assert_eq!(globals.frame.y, 7.0);
        assert_eq!(ctx.lights(), Some(BufferHandle(2)));
    }

    #[test]
    fn frame_constants_hide_lights_and_disabled_ssao() {
        let device = RecordingDevice::new();
        let effects = EffectsManager::builder().build(&device).unwrap();
        let config = RenderConfiguration {
            render_light: false,
            ..Default::default()
        };
        let ctx = RenderContext::new(
            &Camera::default(),
            BufferHandle(1),
            &config,
            &effects,
            FeatureLevel::Level11_0,
            64,
            64,
        )
        .with_lights(BufferHandle(2), 3, Vec3::ZERO);

        let frame = ctx.global_uniform().frame;
        assert_eq!(frame.x, 0.0);
        assert_eq!(frame.z, config.ssao.radius);
        assert_eq!(frame.w, 0.0);
    }

    #[test]
    fn parameter_binds_targets_viewport_and_scissor() {
        let device = RecordingDevice::new();
        let mut dc = device.create_immediate_context().unwrap();
        let parameter = RenderParameter::new(TextureViewHandle(5), Some(TextureViewHandle(6)), 64, 32);
        parameter.bind(dc.as_mut());

        let timeline = device.timeline();
        assert_eq!(timeline.len(), 3);
        assert_eq!(
            timeline[0],
            RecordedCommand::SetRenderTargets(RenderTargets::new(
                TextureViewHandle(5),
                Some(TextureViewHandle(6))
            ))
        );
        assert_eq!(timeline[2], RecordedCommand::SetScissorRect(ScissorRect::new(64, 32)));
    }
}
