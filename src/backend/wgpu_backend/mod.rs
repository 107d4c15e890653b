//! wgpu backend implementation
//!
//! A headless device. Contexts buffer their calls as [`RecordedCommand`]s;
//! `finish_command_list` and `flush` encode the buffered calls into a
//! `wgpu::CommandBuffer`. Replaying a list on the immediate context submits
//! the immediate context's pending work first, then the list, so queue order
//! matches call order.
//!
//! Buffer updates recorded between draws are staged in a per-encode upload
//! buffer; draws bind the staged copy so every draw sees the data that was
//! current when it was recorded. The final contents are copied into the real
//! buffer at the end of the encode.

pub mod shaders;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use wgpu::util::DeviceExt;

use crate::backend::recording::RecordedCommand;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};

const MAX_TEXTURE_SLOTS: usize = 4;
const MAX_CONSTANT_SLOTS: usize = 3;
// Largest constant block: the per-frame light array
const FALLBACK_UNIFORM_SIZE: u64 = 4096;

struct TextureEntry {
    texture: wgpu::Texture,
    desc: TextureDescriptor,
}

struct ViewEntry {
    view: wgpu::TextureView,
    texture: u64,
}

struct ShaderPassEntry {
    pipeline: wgpu::RenderPipeline,
    object_layout: wgpu::BindGroupLayout,
    texture_layout: Option<wgpu::BindGroupLayout>,
    texture_count: u32,
    uses_stencil: bool,
}

#[derive(Default)]
struct ResourceTable {
    textures: HashMap<u64, TextureEntry>,
    views: HashMap<u64, ViewEntry>,
    buffers: HashMap<u64, (wgpu::Buffer, u64)>,
    passes: HashMap<u64, ShaderPassEntry>,
}

struct WgpuShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    feature_level: FeatureLevel,
    uniform_alignment: u64,
    fallback_uniform: wgpu::Buffer,
    fallback_view: wgpu::TextureView,
    resources: RwLock<ResourceTable>,
    next_id: AtomicU64,
    lost: Arc<AtomicBool>,
}

impl WgpuShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> RenderResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(RenderError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Run `create` inside validation and out-of-memory error scopes
    fn scoped<T>(&self, create: impl FnOnce() -> T) -> RenderResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let memory = pollster::block_on(self.device.pop_error_scope());
        if memory.is_some() {
            return Err(RenderError::OutOfMemory);
        }
        if let Some(err) = validation {
            return Err(RenderError::Backend(err.to_string()));
        }
        Ok(value)
    }
}

/// Headless wgpu device
pub struct WgpuDevice {
    shared: Arc<WgpuShared>,
    name: String,
}

impl WgpuDevice {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn convert_texture_usage(desc: &TextureDescriptor) -> wgpu::TextureUsages {
        let usage = desc.usage;
        // Multisampled and depth textures cannot be copied.
        let copyable = desc.sample_count <= 1 && !desc.format.is_depth();
        let mut result = wgpu::TextureUsages::empty();
        if copyable && usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if copyable && usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) && desc.sample_count <= 1 {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        // Staged updates land through a copy.
        result | wgpu::BufferUsages::COPY_DST
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_component(component: BlendComponent) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(component.src_factor),
            dst_factor: Self::convert_blend_factor(component.dst_factor),
            operation: Self::convert_blend_operation(component.operation),
        }
    }

    fn convert_stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
        match op {
            StencilOperation::Keep => wgpu::StencilOperation::Keep,
            StencilOperation::Zero => wgpu::StencilOperation::Zero,
            StencilOperation::Replace => wgpu::StencilOperation::Replace,
            StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        }
    }

    fn convert_stencil_state(stencil: Option<StencilState>) -> wgpu::StencilState {
        let Some(stencil) = stencil else {
            return wgpu::StencilState::default();
        };
        let face = wgpu::StencilFaceState {
            compare: Self::convert_compare_function(stencil.compare),
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: Self::convert_stencil_operation(stencil.pass_op),
        };
        wgpu::StencilState {
            front: face,
            back: face,
            read_mask: stencil.read_mask,
            write_mask: stencil.write_mask,
        }
    }

    fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }

    fn classify_feature_level(adapter: &wgpu::Adapter) -> FeatureLevel {
        let downlevel = adapter.get_downlevel_capabilities();
        if downlevel.is_webgpu_compliant() {
            FeatureLevel::Level11_0
        } else if downlevel
            .flags
            .contains(wgpu::DownlevelFlags::INDEPENDENT_BLEND)
        {
            FeatureLevel::Level10_0
        } else {
            FeatureLevel::Level9_3
        }
    }
}

impl WgpuDevice {
    /// Blocking initialization
    pub fn new() -> RenderResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> RenderResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| RenderError::Backend("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let feature_level = Self::classify_feature_level(&adapter);
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Render Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| RenderError::Backend(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({:?}): {}", reason, message);
            lost_flag.store(true, Ordering::Release);
        });
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("Uncaptured wgpu error: {}", err);
        }));

        let uniform_alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let fallback_uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Fallback Uniform"),
            contents: &[0u8; FALLBACK_UNIFORM_SIZE as usize],
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let fallback_texture = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("Fallback Texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[0, 0, 0, 0],
        );
        let fallback_view = fallback_texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            shared: Arc::new(WgpuShared {
                device,
                queue,
                feature_level,
                uniform_alignment,
                fallback_uniform,
                fallback_view,
                resources: RwLock::new(ResourceTable::default()),
                next_id: AtomicU64::new(1),
                lost,
            }),
            name: format!("wgpu ({})", adapter_info.name),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.shared.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.shared.queue
    }

    fn new_context(&self, kind: ContextKind) -> Box<dyn DeviceContext> {
        Box::new(WgpuContext {
            kind,
            commands: Vec::new(),
            shared: self.shared.clone(),
        })
    }

    fn object_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let uniform = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Constants Layout"),
            entries: &[uniform(0), uniform(1), uniform(2)],
        })
    }

    fn texture_layout(device: &wgpu::Device, count: u32) -> wgpu::BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..count)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Textures Layout"),
            entries: &entries,
        })
    }

    fn build_pipeline(&self, desc: &ShaderPassDescriptor) -> ShaderPassEntry {
        let device = &self.shared.device;
        let source = shaders::module_source(desc.geometry);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.name.as_str()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let texture_count = desc.texture_count.min(MAX_TEXTURE_SLOTS as u32);
        let object_layout = Self::object_layout(device);
        let texture_layout = (texture_count > 0).then(|| Self::texture_layout(device, texture_count));
        let mut layouts = vec![&object_layout];
        if let Some(layout) = &texture_layout {
            layouts.push(layout);
        }
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(desc.name.as_str()),
            bind_group_layouts: &layouts,
            push_constant_ranges: &[],
        });

        let vertex_attributes = wgpu::vertex_attr_array![
            0 => Float32x3,
            1 => Float32x3,
            2 => Float32x2,
            3 => Float32x4
        ];
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = match desc.geometry {
            PassGeometry::Mesh => vec![wgpu::VertexBufferLayout {
                array_stride: Vertex::STRIDE,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &vertex_attributes,
            }],
            PassGeometry::FullScreen => Vec::new(),
        };

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(target.format),
                    blend: target.blend.map(|b| wgpu::BlendState {
                        color: Self::convert_blend_component(b.color),
                        alpha: Self::convert_blend_component(b.alpha),
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = desc.depth.map(|ds| wgpu::DepthStencilState {
            format: Self::convert_texture_format(ds.format),
            depth_write_enabled: ds.write_enabled,
            depth_compare: Self::convert_compare_function(ds.compare),
            stencil: Self::convert_stencil_state(ds.stencil),
            bias: wgpu::DepthBiasState::default(),
        });

        let (vertex_entry, fragment_entry) = shaders::entry_points(desc.name);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(desc.name.as_str()),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: vertex_entry,
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: fragment_entry.map(|entry_point| wgpu::FragmentState {
                module: &shader,
                entry_point,
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: match desc.cull_mode {
                    CullMode::None => None,
                    CullMode::Front => Some(wgpu::Face::Front),
                    CullMode::Back => Some(wgpu::Face::Back),
                },
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: desc.sample_count.max(1),
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
        });

        ShaderPassEntry {
            pipeline,
            object_layout,
            texture_layout,
            texture_count,
            uses_stencil: desc.depth.map_or(false, |ds| ds.stencil.is_some()),
        }
    }
}

impl RenderDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_level(&self) -> FeatureLevel {
        self.shared.feature_level
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RenderResult<TextureHandle> {
        self.shared.check_lost()?;
        let texture = self.shared.scoped(|| {
            self.shared.device.create_texture(&wgpu::TextureDescriptor {
                label: desc.label.as_deref(),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: desc.sample_count.max(1),
                dimension: wgpu::TextureDimension::D2,
                format: Self::convert_texture_format(desc.format),
                usage: Self::convert_texture_usage(desc),
                view_formats: &[],
            })
        })?;
        let id = self.shared.next_id();
        self.shared.resources.write().textures.insert(
            id,
            TextureEntry {
                texture,
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&self, texture: TextureHandle) -> RenderResult<TextureViewHandle> {
        let mut resources = self.shared.resources.write();
        let entry = resources.textures.get(&texture.0).ok_or_else(|| {
            RenderError::ResourceCreationFailed(format!("view of unknown texture {:?}", texture))
        })?;
        let view = entry
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.shared.next_id();
        resources.views.insert(
            id,
            ViewEntry {
                view,
                texture: texture.0,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut resources = self.shared.resources.write();
        resources.views.retain(|_, entry| entry.texture != texture.0);
        if let Some(entry) = resources.textures.remove(&texture.0) {
            entry.texture.destroy();
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> RenderResult<BufferHandle> {
        self.shared.check_lost()?;
        let buffer = self.shared.scoped(|| {
            self.shared.device.create_buffer(&wgpu::BufferDescriptor {
                label: desc.label.as_deref(),
                size: desc.size,
                usage: Self::convert_buffer_usage(desc.usage),
                mapped_at_creation: false,
            })
        })?;
        let id = self.shared.next_id();
        self.shared
            .resources
            .write()
            .buffers
            .insert(id, (buffer, desc.size));
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&self, desc: &BufferDescriptor, data: &[u8]) -> RenderResult<BufferHandle> {
        self.shared.check_lost()?;
        let buffer = self.shared.scoped(|| {
            self.shared
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: desc.label.as_deref(),
                    contents: data,
                    usage: Self::convert_buffer_usage(desc.usage),
                })
        })?;
        let id = self.shared.next_id();
        self.shared
            .resources
            .write()
            .buffers
            .insert(id, (buffer, data.len() as u64));
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some((buffer, _)) = self.shared.resources.write().buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn create_shader_pass(&self, desc: &ShaderPassDescriptor) -> RenderResult<ShaderPassHandle> {
        self.shared.check_lost()?;
        let entry = self.shared.scoped(|| self.build_pipeline(desc))?;
        let id = self.shared.next_id();
        self.shared.resources.write().passes.insert(id, entry);
        log::trace!("Created shader pass {} as #{}", desc.name, id);
        Ok(ShaderPassHandle(id))
    }

    fn create_immediate_context(&self) -> RenderResult<Box<dyn DeviceContext>> {
        self.shared.check_lost()?;
        Ok(self.new_context(ContextKind::Immediate))
    }

    fn create_deferred_context(&self) -> RenderResult<Box<dyn DeviceContext>> {
        self.shared.check_lost()?;
        Ok(self.new_context(ContextKind::Deferred))
    }
}

/// Where a constant slot reads from at draw time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstantSource {
    Buffer(u64),
    Staged { offset: u64, size: u64 },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectGroupKey {
    pass: u64,
    constants: [ConstantSource; MAX_CONSTANT_SLOTS],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextureGroupKey {
    pass: u64,
    views: Vec<Option<u64>>,
}

enum DrawCall {
    Draw {
        vertices: std::ops::Range<u32>,
        instances: std::ops::Range<u32>,
    },
    Indexed {
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    },
}

struct DrawOp {
    pass: u64,
    object_group: usize,
    texture_group: Option<usize>,
    vertex: Option<(u64, u64)>,
    index: Option<(u64, u64, IndexFormat)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    stencil_reference: u32,
    call: DrawCall,
}

struct PassStep {
    targets: RenderTargets,
    color_clears: HashMap<u64, [f32; 4]>,
    depth_clear: Option<(f32, u32)>,
    draws: Vec<DrawOp>,
}

impl PassStep {
    fn new(targets: RenderTargets) -> Self {
        Self {
            targets,
            color_clears: HashMap::new(),
            depth_clear: None,
            draws: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.draws.is_empty() && self.color_clears.is_empty() && self.depth_clear.is_none()
    }
}

enum Step {
    Pass(PassStep),
    Copy { source: u64, destination: u64 },
    Resolve { source: u64, destination: u64 },
}

/// Bind state tracked while walking the recorded commands
#[derive(Default)]
struct BindState {
    pass: Option<u64>,
    constants: [Option<u64>; MAX_CONSTANT_SLOTS],
    textures: [Option<u64>; MAX_TEXTURE_SLOTS],
    vertex: Option<(u64, u64)>,
    index: Option<(u64, u64, IndexFormat)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    stencil_reference: u32,
}

/// Turns a command stream into passes, copies and staged uploads
struct Planner<'a> {
    shared: &'a WgpuShared,
    resources: &'a ResourceTable,
    steps: Vec<Step>,
    open: Option<PassStep>,
    state: BindState,
    uploads: Vec<u8>,
    staged: HashMap<u64, (u64, u64)>,
    object_groups: Vec<ObjectGroupKey>,
    object_lookup: HashMap<ObjectGroupKey, usize>,
    texture_groups: Vec<TextureGroupKey>,
    texture_lookup: HashMap<TextureGroupKey, usize>,
}

impl<'a> Planner<'a> {
    fn new(shared: &'a WgpuShared, resources: &'a ResourceTable) -> Self {
        Self {
            shared,
            resources,
            steps: Vec::new(),
            open: None,
            state: BindState::default(),
            uploads: Vec::new(),
            staged: HashMap::new(),
            object_groups: Vec::new(),
            object_lookup: HashMap::new(),
            texture_groups: Vec::new(),
            texture_lookup: HashMap::new(),
        }
    }

    fn close_pass(&mut self) {
        if let Some(pass) = self.open.take() {
            if !pass.is_empty() {
                self.steps.push(Step::Pass(pass));
            }
        }
    }

    fn reopen(&mut self, targets: RenderTargets) {
        self.close_pass();
        self.open = Some(PassStep::new(targets));
    }

    fn clear_color(&mut self, view: TextureViewHandle, color: [f32; 4]) {
        let fits = self
            .open
            .as_ref()
            .map_or(false, |pass| pass.draws.is_empty() && pass.targets.colors.contains(&view));
        if let (true, Some(pass)) = (fits, self.open.as_mut()) {
            pass.color_clears.insert(view.0, color);
            return;
        }
        let previous = self.open.as_ref().map(|pass| pass.targets.clone());
        self.close_pass();
        let mut clear = PassStep::new(RenderTargets {
            colors: vec![view],
            depth_stencil: None,
        });
        clear.color_clears.insert(view.0, color);
        self.steps.push(Step::Pass(clear));
        if let Some(targets) = previous {
            self.open = Some(PassStep::new(targets));
        }
    }

    fn clear_depth(&mut self, view: TextureViewHandle, depth: f32, stencil: u32) {
        let fits = self
            .open
            .as_ref()
            .map_or(false, |pass| pass.draws.is_empty() && pass.targets.depth_stencil == Some(view));
        if let (true, Some(pass)) = (fits, self.open.as_mut()) {
            pass.depth_clear = Some((depth, stencil));
            return;
        }
        let previous = self.open.as_ref().map(|pass| pass.targets.clone());
        self.close_pass();
        let mut clear = PassStep::new(RenderTargets::depth_only(view));
        clear.depth_clear = Some((depth, stencil));
        self.steps.push(Step::Pass(clear));
        if let Some(targets) = previous {
            self.open = Some(PassStep::new(targets));
        }
    }

    fn stage(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let size = self
            .resources
            .buffers
            .get(&buffer.0)
            .map(|(_, size)| *size)
            .ok_or_else(|| RenderError::CommandList(format!("update of unknown buffer {:?}", buffer)))?;
        let end = offset + data.len() as u64;
        if end > size {
            return Err(RenderError::InvalidParameter(format!(
                "update of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                size
            )));
        }

        let alignment = self.shared.uniform_alignment.max(4);
        let start = (self.uploads.len() as u64).div_ceil(alignment) * alignment;
        let mut contents = match self.staged.get(&buffer.0) {
            Some(&(previous, previous_size)) => {
                self.uploads[previous as usize..(previous + previous_size) as usize].to_vec()
            }
            None => vec![0u8; size as usize],
        };
        contents[offset as usize..end as usize].copy_from_slice(data);
        self.uploads.resize(start as usize, 0);
        self.uploads.extend_from_slice(&contents);
        self.staged.insert(buffer.0, (start, size));
        Ok(())
    }

    fn constant_source(&self, slot: usize) -> ConstantSource {
        match self.state.constants[slot] {
            Some(buffer) => match self.staged.get(&buffer) {
                Some(&(offset, size)) => ConstantSource::Staged { offset, size },
                None => ConstantSource::Buffer(buffer),
            },
            None => ConstantSource::Fallback,
        }
    }

    fn draw(&mut self, call: DrawCall) -> RenderResult<()> {
        let pass = self
            .state
            .pass
            .ok_or_else(|| RenderError::Draw("draw without a shader pass".into()))?;
        let resources = self.resources;
        let entry = resources
            .passes
            .get(&pass)
            .ok_or_else(|| RenderError::Draw(format!("unknown shader pass #{}", pass)))?;

        let object_key = ObjectGroupKey {
            pass,
            constants: [self.constant_source(0), self.constant_source(1), self.constant_source(2)],
        };
        let object_group = match self.object_lookup.get(&object_key) {
            Some(index) => *index,
            None => {
                self.object_groups.push(object_key.clone());
                self.object_lookup
                    .insert(object_key, self.object_groups.len() - 1);
                self.object_groups.len() - 1
            }
        };

        let texture_group = if entry.texture_count > 0 {
            let key = TextureGroupKey {
                pass,
                views: self.state.textures[..entry.texture_count as usize].to_vec(),
            };
            Some(match self.texture_lookup.get(&key) {
                Some(index) => *index,
                None => {
                    self.texture_groups.push(key.clone());
                    self.texture_lookup.insert(key, self.texture_groups.len() - 1);
                    self.texture_groups.len() - 1
                }
            })
        } else {
            None
        };

        let op = DrawOp {
            pass,
            object_group,
            texture_group,
            vertex: self.state.vertex,
            index: self.state.index,
            viewport: self.state.viewport,
            scissor: self.state.scissor,
            stencil_reference: self.state.stencil_reference,
            call,
        };
        match self.open.as_mut() {
            Some(open) => {
                open.draws.push(op);
                Ok(())
            }
            None => Err(RenderError::Draw("draw without render targets".into())),
        }
    }

    fn plan(&mut self, commands: Vec<RecordedCommand>) -> RenderResult<()> {
        for command in commands {
            match command {
                RecordedCommand::SetRenderTargets(targets) => self.reopen(targets),
                RecordedCommand::ClearRenderTarget { view, color } => self.clear_color(view, color),
                RecordedCommand::ClearDepthStencil {
                    view,
                    depth,
                    stencil,
                } => self.clear_depth(view, depth, stencil),
                RecordedCommand::SetViewport(viewport) => self.state.viewport = Some(viewport),
                RecordedCommand::SetScissorRect(rect) => self.state.scissor = Some(rect),
                RecordedCommand::SetShaderPass(pass) => self.state.pass = Some(pass.0),
                RecordedCommand::SetStencilReference(reference) => {
                    self.state.stencil_reference = reference
                }
                RecordedCommand::SetConstantBuffer { slot, buffer } => {
                    match self.state.constants.get_mut(slot as usize) {
                        Some(entry) => *entry = Some(buffer.0),
                        None => log::warn!("Constant slot {} out of range, binding ignored", slot),
                    }
                }
                RecordedCommand::SetTexture { slot, view } => {
                    if let Some(entry) = self.state.textures.get_mut(slot as usize) {
                        *entry = Some(view.0);
                    }
                }
                RecordedCommand::SetVertexBuffer { buffer, offset, .. } => {
                    self.state.vertex = Some((buffer.0, offset))
                }
                RecordedCommand::SetIndexBuffer {
                    buffer,
                    offset,
                    format,
                } => self.state.index = Some((buffer.0, offset, format)),
                RecordedCommand::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => self.stage(buffer, offset, &data)?,
                RecordedCommand::Draw {
                    vertices,
                    instances,
                } => self.draw(DrawCall::Draw {
                    vertices,
                    instances,
                })?,
                RecordedCommand::DrawIndexed {
                    indices,
                    base_vertex,
                    instances,
                } => self.draw(DrawCall::Indexed {
                    indices,
                    base_vertex,
                    instances,
                })?,
                RecordedCommand::CopyTexture {
                    source,
                    destination,
                } => {
                    let targets = self.open.as_ref().map(|pass| pass.targets.clone());
                    self.close_pass();
                    self.steps.push(Step::Copy {
                        source: source.0,
                        destination: destination.0,
                    });
                    self.open = targets.map(PassStep::new);
                }
                RecordedCommand::ResolveTexture {
                    source,
                    destination,
                } => {
                    let targets = self.open.as_ref().map(|pass| pass.targets.clone());
                    self.close_pass();
                    self.steps.push(Step::Resolve {
                        source: source.0,
                        destination: destination.0,
                    });
                    self.open = targets.map(PassStep::new);
                }
                RecordedCommand::Flush => {}
            }
        }
        self.close_pass();
        Ok(())
    }
}

fn view_of(resources: &ResourceTable, id: u64) -> RenderResult<&wgpu::TextureView> {
    resources
        .views
        .get(&id)
        .map(|entry| &entry.view)
        .ok_or_else(|| RenderError::Draw(format!("unknown texture view #{}", id)))
}

fn constant_binding<'r>(
    shared: &'r WgpuShared,
    resources: &'r ResourceTable,
    upload_buffer: Option<&'r wgpu::Buffer>,
    source: ConstantSource,
) -> RenderResult<wgpu::BindingResource<'r>> {
    Ok(match source {
        ConstantSource::Buffer(id) => resources
            .buffers
            .get(&id)
            .map(|(buffer, _)| buffer.as_entire_binding())
            .ok_or_else(|| RenderError::Draw(format!("unknown constant buffer #{}", id)))?,
        ConstantSource::Staged { offset, size } => match upload_buffer {
            Some(buffer) => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer,
                offset,
                size: wgpu::BufferSize::new(size),
            }),
            None => shared.fallback_uniform.as_entire_binding(),
        },
        ConstantSource::Fallback => shared.fallback_uniform.as_entire_binding(),
    })
}

fn encode(shared: &WgpuShared, commands: Vec<RecordedCommand>, label: &str) -> RenderResult<wgpu::CommandBuffer> {
    let resources = shared.resources.read();
    let mut planner = Planner::new(shared, &resources);
    planner.plan(commands)?;
    let Planner {
        steps,
        uploads,
        staged,
        object_groups,
        texture_groups,
        ..
    } = planner;

    let device = &shared.device;
    let upload_buffer = (!uploads.is_empty()).then(|| {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Staged Updates"),
            contents: &uploads,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_SRC,
        })
    });

    let mut object_bind_groups = Vec::with_capacity(object_groups.len());
    for key in &object_groups {
        let entry = resources
            .passes
            .get(&key.pass)
            .ok_or_else(|| RenderError::Draw(format!("unknown shader pass #{}", key.pass)))?;
        let mut entries = Vec::with_capacity(MAX_CONSTANT_SLOTS);
        for (binding, source) in key.constants.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: constant_binding(shared, &resources, upload_buffer.as_ref(), *source)?,
            });
        }
        object_bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Constants"),
            layout: &entry.object_layout,
            entries: &entries,
        }));
    }

    let mut texture_bind_groups = Vec::with_capacity(texture_groups.len());
    for key in &texture_groups {
        let layout = resources
            .passes
            .get(&key.pass)
            .and_then(|entry| entry.texture_layout.as_ref())
            .ok_or_else(|| RenderError::Draw(format!("pass #{} takes no textures", key.pass)))?;
        let entries: Vec<wgpu::BindGroupEntry> = key
            .views
            .iter()
            .enumerate()
            .map(|(binding, view)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: wgpu::BindingResource::TextureView(
                    view.and_then(|id| resources.views.get(&id))
                        .map_or(&shared.fallback_view, |entry| &entry.view),
                ),
            })
            .collect();
        texture_bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Textures"),
            layout,
            entries: &entries,
        }));
    }

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some(label),
    });

    for step in &steps {
        match step {
            Step::Pass(pass) => {
                let mut color_attachments = Vec::with_capacity(pass.targets.colors.len());
                for view in &pass.targets.colors {
                    let load = match pass.color_clears.get(&view.0) {
                        Some(color) => wgpu::LoadOp::Clear(wgpu::Color {
                            r: color[0] as f64,
                            g: color[1] as f64,
                            b: color[2] as f64,
                            a: color[3] as f64,
                        }),
                        None => wgpu::LoadOp::Load,
                    };
                    color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                        view: view_of(&resources, view.0)?,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load,
                            store: wgpu::StoreOp::Store,
                        },
                    }));
                }

                let depth_attachment = match pass.targets.depth_stencil {
                    Some(view) => {
                        let has_stencil = resources
                            .views
                            .get(&view.0)
                            .and_then(|entry| resources.textures.get(&entry.texture))
                            .map_or(false, |entry| entry.desc.format.has_stencil());
                        Some(wgpu::RenderPassDepthStencilAttachment {
                            view: view_of(&resources, view.0)?,
                            depth_ops: Some(wgpu::Operations {
                                load: match pass.depth_clear {
                                    Some((depth, _)) => wgpu::LoadOp::Clear(depth),
                                    None => wgpu::LoadOp::Load,
                                },
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: has_stencil.then(|| wgpu::Operations {
                                load: match pass.depth_clear {
                                    Some((_, stencil)) => wgpu::LoadOp::Clear(stencil),
                                    None => wgpu::LoadOp::Load,
                                },
                                store: wgpu::StoreOp::Store,
                            }),
                        })
                    }
                    None => None,
                };

                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(label),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: depth_attachment,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });

                for op in &pass.draws {
                    let Some(entry) = resources.passes.get(&op.pass) else {
                        continue;
                    };
                    render_pass.set_pipeline(&entry.pipeline);
                    render_pass.set_bind_group(0, &object_bind_groups[op.object_group], &[]);
                    if let Some(group) = op.texture_group {
                        render_pass.set_bind_group(1, &texture_bind_groups[group], &[]);
                    }
                    if let Some((buffer, offset)) = op.vertex {
                        if let Some((buffer, _)) = resources.buffers.get(&buffer) {
                            render_pass.set_vertex_buffer(0, buffer.slice(offset..));
                        }
                    }
                    if let Some((buffer, offset, format)) = op.index {
                        if let Some((buffer, _)) = resources.buffers.get(&buffer) {
                            render_pass.set_index_buffer(
                                buffer.slice(offset..),
                                WgpuDevice::convert_index_format(format),
                            );
                        }
                    }
                    if let Some(v) = op.viewport {
                        render_pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                    }
                    if let Some(s) = op.scissor {
                        render_pass.set_scissor_rect(s.x, s.y, s.width, s.height);
                    }
                    if entry.uses_stencil {
                        render_pass.set_stencil_reference(op.stencil_reference);
                    }
                    match &op.call {
                        DrawCall::Draw {
                            vertices,
                            instances,
                        } => render_pass.draw(vertices.clone(), instances.clone()),
                        DrawCall::Indexed {
                            indices,
                            base_vertex,
                            instances,
                        } => render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone()),
                    }
                }
            }
            Step::Copy {
                source,
                destination,
            } => {
                let (Some(src), Some(dst)) = (
                    resources.textures.get(source),
                    resources.textures.get(destination),
                ) else {
                    return Err(RenderError::Draw("copy between unknown textures".into()));
                };
                encoder.copy_texture_to_texture(
                    src.texture.as_image_copy(),
                    dst.texture.as_image_copy(),
                    wgpu::Extent3d {
                        width: src.desc.width.min(dst.desc.width),
                        height: src.desc.height.min(dst.desc.height),
                        depth_or_array_layers: 1,
                    },
                );
            }
            Step::Resolve {
                source,
                destination,
            } => {
                let _resolve = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Resolve"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: view_of(&resources, *source)?,
                        resolve_target: Some(view_of(&resources, *destination)?),
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
        }
    }

    if let Some(upload_buffer) = &upload_buffer {
        for (buffer, (offset, size)) in &staged {
            if let Some((target, _)) = resources.buffers.get(buffer) {
                encoder.copy_buffer_to_buffer(upload_buffer, *offset, target, 0, *size);
            }
        }
    }

    Ok(encoder.finish())
}

/// Context of a [`WgpuDevice`]
pub struct WgpuContext {
    kind: ContextKind,
    commands: Vec<RecordedCommand>,
    shared: Arc<WgpuShared>,
}

impl WgpuContext {
    fn push(&mut self, command: RecordedCommand) {
        self.commands.push(command);
    }

    fn submit_pending(&mut self) -> RenderResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.commands);
        let buffer = encode(&self.shared, commands, "Immediate")?;
        self.shared.queue.submit(Some(buffer));
        Ok(())
    }
}

impl DeviceContext for WgpuContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn set_render_targets(&mut self, targets: &RenderTargets) {
        self.push(RecordedCommand::SetRenderTargets(targets.clone()));
    }

    fn clear_render_target(&mut self, view: TextureViewHandle, color: [f32; 4]) {
        self.push(RecordedCommand::ClearRenderTarget { view, color });
    }

    fn clear_depth_stencil(&mut self, view: TextureViewHandle, depth: f32, stencil: u32) {
        self.push(RecordedCommand::ClearDepthStencil {
            view,
            depth,
            stencil,
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.push(RecordedCommand::SetViewport(viewport));
    }

    fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.push(RecordedCommand::SetScissorRect(rect));
    }

    fn set_shader_pass(&mut self, pass: ShaderPassHandle) {
        self.push(RecordedCommand::SetShaderPass(pass));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.push(RecordedCommand::SetStencilReference(reference));
    }

    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        self.push(RecordedCommand::SetConstantBuffer { slot, buffer });
    }

    fn set_texture(&mut self, slot: u32, view: TextureViewHandle) {
        self.push(RecordedCommand::SetTexture { slot, view });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.push(RecordedCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.push(RecordedCommand::SetIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.push(RecordedCommand::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        self.push(RecordedCommand::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        self.push(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn copy_texture(&mut self, source: TextureHandle, destination: TextureHandle) {
        self.push(RecordedCommand::CopyTexture {
            source,
            destination,
        });
    }

    fn resolve_texture(&mut self, source: TextureViewHandle, destination: TextureViewHandle) {
        self.push(RecordedCommand::ResolveTexture {
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
        let commands = std::mem::take(&mut self.commands);
        let count = commands.len();
        let buffer = encode(&self.shared, commands, "Deferred")?;
        Ok(CommandList::Wgpu {
            buffer,
            commands: count,
        })
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
        self.submit_pending()?;
        match list {
            CommandList::Wgpu { buffer, .. } => {
                self.shared.queue.submit(Some(buffer));
                Ok(())
            }
            CommandList::Recorded(_) => Err(RenderError::CommandList(
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
        self.submit_pending()?;
        self.shared.check_lost()
    }
}
