//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{Mat4, Vec3};

use helix_render::backend::{
    DeviceContext, FeatureLevel, GlobalUniform, GpuBuffer, GpuTexture, RecordedCommand,
    RecordingDevice, RenderDevice, TextureDescriptor,
};
use helix_render::render::{RenderContext, RenderParameter};
use helix_render::scene::{
    AttachContext, Camera, MeshCore, MeshGeometry, RenderCore, SceneNode, Transform,
};
use helix_render::technique::COLOR_FORMAT;
use helix_render::{EffectsManager, RenderConfiguration, RenderError, RenderResult, RenderType};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Recording device plus the same device as a trait object
pub fn recording_device() -> (RecordingDevice, Arc<dyn RenderDevice>) {
    recording_device_at(FeatureLevel::Level11_0)
}

pub fn recording_device_at(level: FeatureLevel) -> (RecordingDevice, Arc<dyn RenderDevice>) {
    let recording = RecordingDevice::with_feature_level(level);
    let device: Arc<dyn RenderDevice> = Arc::new(recording.clone());
    (recording, device)
}

/// Core that issues one draw whose first vertex is its tag
pub struct TaggedCore {
    tag: u32,
    fail: bool,
    updates: Arc<AtomicUsize>,
}

impl TaggedCore {
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            fail: false,
            updates: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(tag: u32) -> Self {
        Self {
            fail: true,
            ..Self::new(tag)
        }
    }

    pub fn counting(tag: u32, updates: Arc<AtomicUsize>) -> Self {
        Self {
            updates,
            ..Self::new(tag)
        }
    }
}

impl RenderCore for TaggedCore {
    fn attach(&mut self, _ctx: &AttachContext<'_>) -> RenderResult<()> {
        Ok(())
    }

    fn detach(&mut self) {}

    fn render(&self, _ctx: &RenderContext<'_>, dc: &mut dyn DeviceContext) -> RenderResult<()> {
        if self.fail {
            return Err(RenderError::Draw(format!("tagged core {} failed", self.tag)));
        }
        dc.draw(self.tag..self.tag + 1, 0..1);
        Ok(())
    }

    fn update_not_render(&self, _ctx: &RenderContext<'_>) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Opaque nodes tagged `0..count`
pub fn tagged_nodes(count: u32) -> Vec<SceneNode> {
    (0..count)
        .map(|tag| SceneNode::new(format!("node {tag}"), RenderType::Opaque, TaggedCore::new(tag)))
        .collect()
}

/// First vertex of every draw in `commands`, in order
pub fn draw_tags(commands: &[RecordedCommand]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::Draw { vertices, .. } => Some(vertices.start),
            _ => None,
        })
        .collect()
}

pub fn cube(name: &str, position: Vec3) -> SceneNode {
    SceneNode::new(name, RenderType::Opaque, MeshCore::new(MeshGeometry::cube(0.5)))
        .with_transform(Transform::from_position(position))
}

/// Frame state for driving renderers and the scheduler without a host
pub struct Frame {
    pub device: Arc<dyn RenderDevice>,
    pub config: RenderConfiguration,
    pub effects: EffectsManager,
    pub camera: Camera,
    pub globals: GpuBuffer,
    pub target: GpuTexture,
}

impl Frame {
    pub fn new(device: Arc<dyn RenderDevice>, effects: EffectsManager) -> RenderResult<Self> {
        let globals = GpuBuffer::uniform::<GlobalUniform>(&device, "globals")?;
        let target = GpuTexture::new(
            &device,
            TextureDescriptor::render_target("target", 64, 64, COLOR_FORMAT),
        )?;
        Ok(Self {
            device,
            config: RenderConfiguration::default(),
            effects,
            camera: Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO),
            globals,
            target,
        })
    }

    pub fn context(&self) -> RenderContext<'_> {
        RenderContext::new(
            &self.camera,
            self.globals.handle(),
            &self.config,
            &self.effects,
            self.device.feature_level(),
            64,
            64,
        )
    }

    pub fn parameter(&self) -> RenderParameter {
        RenderParameter::new(self.target.view(), None, 64, 64)
    }

    pub fn attach(&self, nodes: &mut [SceneNode]) -> RenderResult<()> {
        let attach = AttachContext {
            device: &self.device,
            effects: &self.effects,
        };
        for node in nodes.iter_mut() {
            node.attach(&attach)?;
            node.update(&Mat4::IDENTITY, false);
        }
        Ok(())
    }
}
