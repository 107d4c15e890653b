//! Core backend abstraction traits
//!
//! A [`RenderDevice`] creates resources and deferred contexts. A
//! [`DeviceContext`] records state changes and draw calls; the immediate
//! context executes them, a deferred context bakes them into a
//! [`CommandList`] that the immediate context replays later.

use std::ops::Range;

use crate::backend::recording::RecordedCommand;
use crate::backend::types::*;
use crate::error::RenderResult;

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a compiled shader pass (pipeline state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderPassHandle(pub(crate) u64);

impl TextureViewHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Whether a context executes directly or records for later replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Immediate,
    Deferred,
}

/// Color and depth attachments bound for subsequent draws
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderTargets {
    pub colors: Vec<TextureViewHandle>,
    pub depth_stencil: Option<TextureViewHandle>,
}

impl RenderTargets {
    pub fn new(color: TextureViewHandle, depth_stencil: Option<TextureViewHandle>) -> Self {
        Self {
            colors: vec![color],
            depth_stencil,
        }
    }

    pub fn depth_only(depth_stencil: TextureViewHandle) -> Self {
        Self {
            colors: Vec::new(),
            depth_stencil: Some(depth_stencil),
        }
    }
}

/// Opaque recording of GPU commands produced by a deferred context
///
/// Dropping a command list releases it.
pub enum CommandList {
    /// Produced by the recording backend
    Recorded(Vec<RecordedCommand>),
    /// Produced by the wgpu backend
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        buffer: wgpu::CommandBuffer,
        commands: usize,
    },
}

impl CommandList {
    /// Number of commands baked into this list
    pub fn command_count(&self) -> usize {
        match self {
            CommandList::Recorded(commands) => commands.len(),
            #[cfg(feature = "wgpu-backend")]
            CommandList::Wgpu { commands, .. } => *commands,
        }
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandList::Recorded(commands) => f
                .debug_struct("CommandList::Recorded")
                .field("commands", &commands.len())
                .finish(),
            #[cfg(feature = "wgpu-backend")]
            CommandList::Wgpu { commands, .. } => f
                .debug_struct("CommandList::Wgpu")
                .field("commands", commands)
                .finish_non_exhaustive(),
        }
    }
}

/// A context that records rendering commands
pub trait DeviceContext: Send {
    /// Immediate or deferred
    fn kind(&self) -> ContextKind;

    /// Bind color and depth attachments
    fn set_render_targets(&mut self, targets: &RenderTargets);

    /// Clear a color attachment
    fn clear_render_target(&mut self, view: TextureViewHandle, color: [f32; 4]);

    /// Clear a depth-stencil attachment
    fn clear_depth_stencil(&mut self, view: TextureViewHandle, depth: f32, stencil: u32);

    /// Set viewport
    fn set_viewport(&mut self, viewport: Viewport);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, rect: ScissorRect);

    /// Bind a shader pass (pipeline state)
    fn set_shader_pass(&mut self, pass: ShaderPassHandle);

    /// Stencil reference value used by stencil-gated passes
    fn set_stencil_reference(&mut self, reference: u32);

    /// Bind a constant buffer to a slot (0 = per frame, 1 = per object)
    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferHandle);

    /// Bind a sampled texture to a slot
    fn set_texture(&mut self, slot: u32, view: TextureViewHandle);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    /// Upload data into a buffer, ordered with the surrounding commands
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Draw primitives
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    /// Draw a fullscreen triangle for screen-quad passes
    fn draw_full_screen_quad(&mut self) {
        self.draw(0..3, 0..1);
    }

    /// Copy a whole texture into another of the same size and format
    fn copy_texture(&mut self, source: TextureHandle, destination: TextureHandle);

    /// Resolve a multisampled view into a single-sampled view
    fn resolve_texture(&mut self, source: TextureViewHandle, destination: TextureViewHandle);

    /// Bake the recorded commands into a command list (deferred contexts only)
    fn finish_command_list(&mut self) -> RenderResult<CommandList>;

    /// Drop commands not yet finished or flushed; returns how many were dropped
    fn discard_pending(&mut self) -> usize;

    /// Replay a command list (immediate context only)
    fn execute_command_list(&mut self, list: CommandList) -> RenderResult<()>;

    /// Submit everything recorded so far (immediate context only)
    fn flush(&mut self) -> RenderResult<()>;
}

/// A GPU device
pub trait RenderDevice: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Hardware capability tier
    fn feature_level(&self) -> FeatureLevel;

    /// Create a texture
    fn create_texture(&self, desc: &TextureDescriptor) -> RenderResult<TextureHandle>;

    /// Create the default view of a texture
    fn create_texture_view(&self, texture: TextureHandle) -> RenderResult<TextureViewHandle>;

    /// Destroy a texture and every view created from it
    fn destroy_texture(&self, texture: TextureHandle);

    /// Create a buffer
    fn create_buffer(&self, desc: &BufferDescriptor) -> RenderResult<BufferHandle>;

    /// Create a buffer with initial data
    fn create_buffer_init(&self, desc: &BufferDescriptor, data: &[u8]) -> RenderResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Compile a shader pass
    fn create_shader_pass(&self, desc: &ShaderPassDescriptor) -> RenderResult<ShaderPassHandle>;

    /// Create the immediate context; a device has exactly one live immediate context
    fn create_immediate_context(&self) -> RenderResult<Box<dyn DeviceContext>>;

    /// Create a context that records into command lists
    fn create_deferred_context(&self) -> RenderResult<Box<dyn DeviceContext>>;
}
