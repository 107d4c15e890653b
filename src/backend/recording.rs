//! Recording backend
//!
//! A device without a GPU. Every context call is captured as a
//! [`RecordedCommand`]. The immediate context appends to the device timeline
//! as calls arrive; deferred contexts buffer their calls and hand them out
//! as [`CommandList::Recorded`], which the immediate context appends to the
//! timeline on replay. Comparing timelines makes draw ordering observable.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::technique::ShaderPassName;

/// A captured context call
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    SetRenderTargets(RenderTargets),
    ClearRenderTarget {
        view: TextureViewHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: TextureViewHandle,
        depth: f32,
        stencil: u32,
    },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetShaderPass(ShaderPassHandle),
    SetStencilReference(u32),
    SetConstantBuffer {
        slot: u32,
        buffer: BufferHandle,
    },
    SetTexture {
        slot: u32,
        view: TextureViewHandle,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    UpdateBuffer {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u8>,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    CopyTexture {
        source: TextureHandle,
        destination: TextureHandle,
    },
    ResolveTexture {
        source: TextureViewHandle,
        destination: TextureViewHandle,
    },
    Flush,
}

impl RecordedCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
        )
    }
}

#[derive(Default)]
struct Resources {
    textures: HashMap<TextureHandle, TextureDescriptor>,
    views: HashMap<TextureViewHandle, TextureHandle>,
    buffers: HashMap<BufferHandle, BufferDescriptor>,
    passes: HashMap<ShaderPassHandle, ShaderPassDescriptor>,
}

struct Shared {
    feature_level: FeatureLevel,
    next_id: AtomicU64,
    timeline: Mutex<Vec<RecordedCommand>>,
    resources: Mutex<Resources>,
    refused_passes: Mutex<HashSet<ShaderPassName>>,
    device_lost: AtomicBool,
    deferred_contexts: AtomicUsize,
    command_lists_finished: AtomicUsize,
    command_lists_executed: AtomicUsize,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> RenderResult<()> {
        if self.device_lost.load(Ordering::Acquire) {
            Err(RenderError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

/// GPU-less device that records every call
#[derive(Clone)]
pub struct RecordingDevice {
    shared: Arc<Shared>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_feature_level(FeatureLevel::Level11_0)
    }

    pub fn with_feature_level(feature_level: FeatureLevel) -> Self {
        Self {
            shared: Arc::new(Shared {
                feature_level,
                next_id: AtomicU64::new(1),
                timeline: Mutex::new(Vec::new()),
                resources: Mutex::new(Resources::default()),
                refused_passes: Mutex::new(HashSet::new()),
                device_lost: AtomicBool::new(false),
                deferred_contexts: AtomicUsize::new(0),
                command_lists_finished: AtomicUsize::new(0),
                command_lists_executed: AtomicUsize::new(0),
            }),
        }
    }

    /// Commands executed on the immediate context so far, replayed lists included
    pub fn timeline(&self) -> Vec<RecordedCommand> {
        self.shared.timeline.lock().clone()
    }

    /// Draw calls of the timeline, in execution order
    pub fn draw_calls(&self) -> Vec<RecordedCommand> {
        self.shared
            .timeline
            .lock()
            .iter()
            .filter(|cmd| cmd.is_draw())
            .cloned()
            .collect()
    }

    pub fn clear_timeline(&self) {
        self.shared.timeline.lock().clear();
    }

    /// Make the device report `DeviceLost` from now on
    pub fn lose_device(&self) {
        self.shared.device_lost.store(true, Ordering::Release);
    }

    pub fn restore_device(&self) {
        self.shared.device_lost.store(false, Ordering::Release);
    }

    /// Make `create_shader_pass` fail for `name`
    pub fn refuse_shader_pass(&self, name: ShaderPassName) {
        self.shared.refused_passes.lock().insert(name);
    }

    pub fn live_textures(&self) -> usize {
        self.shared.resources.lock().textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.shared.resources.lock().buffers.len()
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<TextureDescriptor> {
        self.shared.resources.lock().textures.get(&texture).cloned()
    }

    /// Texture a view was created from
    pub fn view_texture(&self, view: TextureViewHandle) -> Option<TextureHandle> {
        self.shared.resources.lock().views.get(&view).copied()
    }

    pub fn shader_pass_name(&self, pass: ShaderPassHandle) -> Option<ShaderPassName> {
        self.shared
            .resources
            .lock()
            .passes
            .get(&pass)
            .map(|desc| desc.name)
    }

    pub fn deferred_contexts_created(&self) -> usize {
        self.shared.deferred_contexts.load(Ordering::Relaxed)
    }

    pub fn command_lists_finished(&self) -> usize {
        self.shared.command_lists_finished.load(Ordering::Relaxed)
    }

    pub fn command_lists_executed(&self) -> usize {
        self.shared.command_lists_executed.load(Ordering::Relaxed)
    }
}

impl RenderDevice for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn feature_level(&self) -> FeatureLevel {
        self.shared.feature_level
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RenderResult<TextureHandle> {
        self.shared.check_lost()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "texture {:?} has zero size",
                desc.label
            )));
        }
        let handle = TextureHandle(self.shared.next_id());
        self.shared
            .resources
            .lock()
            .textures
            .insert(handle, desc.clone());
        Ok(handle)
    }

    fn create_texture_view(&self, texture: TextureHandle) -> RenderResult<TextureViewHandle> {
        let mut resources = self.shared.resources.lock();
        if !resources.textures.contains_key(&texture) {
            return Err(RenderError::ResourceCreationFailed(format!(
                "view of unknown texture {:?}",
                texture
            )));
        }
        let view = TextureViewHandle(self.shared.next_id());
        resources.views.insert(view, texture);
        Ok(view)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut resources = self.shared.resources.lock();
        resources.textures.remove(&texture);
        resources.views.retain(|_, owner| *owner != texture);
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> RenderResult<BufferHandle> {
        self.shared.check_lost()?;
        let handle = BufferHandle(self.shared.next_id());
        self.shared
            .resources
            .lock()
            .buffers
            .insert(handle, desc.clone());
        Ok(handle)
    }

    fn create_buffer_init(&self, desc: &BufferDescriptor, _data: &[u8]) -> RenderResult<BufferHandle> {
        self.create_buffer(desc)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.shared.resources.lock().buffers.remove(&buffer);
    }

    fn create_shader_pass(&self, desc: &ShaderPassDescriptor) -> RenderResult<ShaderPassHandle> {
        self.shared.check_lost()?;
        if self.shared.refused_passes.lock().contains(&desc.name) {
            return Err(RenderError::Backend(format!(
                "shader pass {} refused",
                desc.name
            )));
        }
        let handle = ShaderPassHandle(self.shared.next_id());
        self.shared
            .resources
            .lock()
            .passes
            .insert(handle, desc.clone());
        Ok(handle)
    }

    fn create_immediate_context(&self) -> RenderResult<Box<dyn DeviceContext>> {
        self.shared.check_lost()?;
        Ok(Box::new(RecordingContext {
            kind: ContextKind::Immediate,
            commands: Vec::new(),
            shared: self.shared.clone(),
        }))
    }

    fn create_deferred_context(&self) -> RenderResult<Box<dyn DeviceContext>> {
        self.shared.check_lost()?;
        self.shared.deferred_contexts.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(RecordingContext {
            kind: ContextKind::Deferred,
            commands: Vec::new(),
            shared: self.shared.clone(),
        }))
    }
}

/// Context of a [`RecordingDevice`]
pub struct RecordingContext {
    kind: ContextKind,
    commands: Vec<RecordedCommand>,
    shared: Arc<Shared>,
}

impl RecordingContext {
    fn record(&mut self, command: RecordedCommand) {
        match self.kind {
            ContextKind::Immediate => self.shared.timeline.lock().push(command),
            ContextKind::Deferred => self.commands.push(command),
        }
    }
}

impl DeviceContext for RecordingContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn set_render_targets(&mut self, targets: &RenderTargets) {
        self.record(RecordedCommand::SetRenderTargets(targets.clone()));
    }

    fn clear_render_target(&mut self, view: TextureViewHandle, color: [f32; 4]) {
        self.record(RecordedCommand::ClearRenderTarget { view, color });
    }

    fn clear_depth_stencil(&mut self, view: TextureViewHandle, depth: f32, stencil: u32) {
        self.record(RecordedCommand::ClearDepthStencil {
            view,
            depth,
            stencil,
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(RecordedCommand::SetViewport(viewport));
    }

    fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.record(RecordedCommand::SetScissorRect(rect));
    }

    fn set_shader_pass(&mut self, pass: ShaderPassHandle) {
        self.record(RecordedCommand::SetShaderPass(pass));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record(RecordedCommand::SetStencilReference(reference));
    }

    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        self.record(RecordedCommand::SetConstantBuffer { slot, buffer });
    }

    fn set_texture(&mut self, slot: u32, view: TextureViewHandle) {
        self.record(RecordedCommand::SetTexture { slot, view });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record(RecordedCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.record(RecordedCommand::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn copy_texture(&mut self, source: TextureHandle, destination: TextureHandle) {
        self.record(RecordedCommand::CopyTexture {
            source,
            destination,
        });
    }

    fn resolve_texture(&mut self, source: TextureViewHandle, destination: TextureViewHandle) {
        self.record(RecordedCommand::ResolveTexture {
            source,
            destination,
        });
    }

    fn finish_command_list(&mut self) -> RenderResult<CommandList> {
        if self.kind != ContextKind::Deferred {
            return Err(RenderError::CommandList(
                "immediate context cannot finish a command list".into(),
            ));
        }
        self.shared.check_lost()?;
        self.shared
            .command_lists_finished
            .fetch_add(1, Ordering::Relaxed);
        Ok(CommandList::Recorded(std::mem::take(&mut self.commands)))
    }

    fn discard_pending(&mut self) -> usize {
        let count = self.commands.len();
        self.commands.clear();
        count
    }

    fn execute_command_list(&mut self, list: CommandList) -> RenderResult<()> {
        if self.kind != ContextKind::Immediate {
            return Err(RenderError::CommandList(
                "deferred context cannot execute a command list".into(),
            ));
        }
        self.shared.check_lost()?;
        match list {
            CommandList::Recorded(commands) => {
                self.shared.timeline.lock().extend(commands);
                self.shared
                    .command_lists_executed
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            #[cfg(feature = "wgpu-backend")]
            CommandList::Wgpu { .. } => Err(RenderError::CommandList(
                "command list belongs to another backend".into(),
            )),
        }
    }

    fn flush(&mut self) -> RenderResult<()> {
        if self.kind != ContextKind::Immediate {
            return Err(RenderError::CommandList(
                "deferred context cannot flush".into(),
            ));
        }
        self.shared.check_lost()?;
        self.record(RecordedCommand::Flush);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_calls_land_on_timeline() {
        let device = RecordingDevice::new();
        let mut context = device.create_immediate_context().unwrap();
        context.draw(0..3, 0..1);
        context.flush().unwrap();
        assert_eq!(device.timeline().len(), 2);
        assert_eq!(device.draw_calls().len(), 1);
    }

    #[test]
    fn deferred_calls_wait_for_replay() {
        let device = RecordingDevice::new();
        let mut immediate = device.create_immediate_context().unwrap();
        let mut deferred = device.create_deferred_context().unwrap();

        deferred.draw_indexed(0..36, 0, 0..1);
        assert!(device.timeline().is_empty());

        let list = deferred.finish_command_list().unwrap();
        assert_eq!(list.command_count(), 1);
        immediate.execute_command_list(list).unwrap();
        assert_eq!(device.draw_calls().len(), 1);
        assert_eq!(device.command_lists_executed(), 1);
    }

    #[test]
    fn finish_resets_the_context() {
        let device = RecordingDevice::new();
        let mut deferred = device.create_deferred_context().unwrap();
        deferred.draw(0..3, 0..1);
        let _ = deferred.finish_command_list().unwrap();
        let list = deferred.finish_command_list().unwrap();
        assert_eq!(list.command_count(), 0);
    }

    #[test]
    fn context_kinds_are_enforced() {
        let device = RecordingDevice::new();
        let mut immediate = device.create_immediate_context().unwrap();
        let mut deferred = device.create_deferred_context().unwrap();
        assert!(immediate.finish_command_list().is_err());
        assert!(deferred.execute_command_list(CommandList::Recorded(Vec::new())).is_err());
        assert!(deferred.flush().is_err());
    }

    #[test]
    fn destroying_a_texture_drops_its_views() {
        let device = RecordingDevice::new();
        let texture = device
            .create_texture(&TextureDescriptor::render_target(
                "rt",
                4,
                4,
                TextureFormat::Rgba8Unorm,
            ))
            .unwrap();
        let view = device.create_texture_view(texture).unwrap();
        assert_eq!(device.view_texture(view), Some(texture));
        device.destroy_texture(texture);
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.view_texture(view), None);
    }

    #[test]
    fn lost_device_fails_flush() {
        let device = RecordingDevice::new();
        let mut immediate = device.create_immediate_context().unwrap();
        device.lose_device();
        assert_eq!(immediate.flush().unwrap_err(), RenderError::DeviceLost);
        device.restore_device();
        assert!(immediate.flush().is_ok());
    }
}
