//! Render cores: the GPU-facing half of a scene node
//!
//! A core owns the buffers and shader pass of one node. It is attached once
//! per device, synced from its node whenever the node is dirty, and rendered
//! through a shared reference so partitions can record in parallel.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, DeviceContext, GlobalUniform, GpuBuffer,
    IndexFormat, ObjectUniform, RenderDevice, ResourceStack, ShaderPassHandle, Vertex, Viewport,
};
use crate::error::{RenderError, RenderResult};
use crate::postprocess::PostEffectCore;
use crate::render::{RenderContext, RenderParameter};
use crate::scene::bounds::BoundingBox;
use crate::scene::light::{GpuLightData, Light};
use crate::scene::node::NodeDirtyFlags;
use crate::technique::{EffectsManager, ShaderPassName};

/// Device state handed to cores when their node is attached
pub struct AttachContext<'a> {
    pub device: &'a Arc<dyn RenderDevice>,
    pub effects: &'a EffectsManager,
}

/// Node state pushed into a core by [`RenderCore::sync`]
#[derive(Debug, Clone, Copy)]
pub struct NodeState {
    pub world: Mat4,
    pub color: Vec4,
    pub render_order: i32,
    pub dirty: NodeDirtyFlags,
    pub generation: u64,
}

/// GPU-facing rendering logic of one node
pub trait RenderCore: Send + Sync {
    /// Create device resources and resolve shader passes
    fn attach(&mut self, ctx: &AttachContext<'_>) -> RenderResult<()>;

    /// Release device resources
    fn detach(&mut self);

    /// Record the draw calls of this core with its own shader pass
    fn render(&self, ctx: &RenderContext<'_>, dc: &mut dyn DeviceContext) -> RenderResult<()>;

    /// Record geometry only; the caller has bound the shader pass
    ///
    /// `color` replaces the node color for this draw.
    fn render_custom(
        &self,
        _ctx: &RenderContext<'_>,
        _dc: &mut dyn DeviceContext,
        _color: Option<Vec4>,
    ) -> RenderResult<()> {
        Ok(())
    }

    /// Take over changed node state
    fn sync(&mut self, _state: &NodeState) {}

    /// CPU-side bookkeeping run off the render thread
    fn update_not_render(&self, _ctx: &RenderContext<'_>) {}

    fn light_data(&self) -> Option<GpuLightData> {
        None
    }

    fn triangle_count(&self) -> usize {
        0
    }

    /// Bounds in node space
    fn local_bounds(&self) -> Option<BoundingBox> {
        None
    }

    fn as_post_effect(&self) -> Option<&dyn PostEffectCore> {
        None
    }

    fn as_screen_spaced(&self) -> Option<&ScreenSpacedCore> {
        None
    }
}

/// Indexed triangle mesh
#[derive(Debug, Clone, Default)]
pub struct MeshGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshGeometry {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// Axis aligned cube centered on the origin
    pub fn cube(half_extent: f32) -> Self {
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let position =
                    (normal + right * (u * 2.0 - 1.0) + up * (v * 2.0 - 1.0)) * half_extent;
                vertices.push(Vertex::new(position, normal, Vec2::new(u, v)));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self { vertices, indices }
    }

    /// Unit quad in the XY plane facing +Z
    pub fn quad() -> Self {
        let vertices = [(-0.5, -0.5, 0.0, 1.0), (0.5, -0.5, 1.0, 1.0), (0.5, 0.5, 1.0, 0.0), (-0.5, 0.5, 0.0, 0.0)]
            .into_iter()
            .map(|(x, y, u, v)| Vertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(u, v)))
            .collect();
        Self {
            vertices,
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.vertices.iter().map(|v| v.position))
    }
}

struct MeshBindings {
    pass: ShaderPassHandle,
    vertex: BufferHandle,
    index: BufferHandle,
    object: BufferHandle,
}

/// Core drawing an indexed mesh with per-object constants
pub struct MeshCore {
    geometry: MeshGeometry,
    pass: ShaderPassName,
    object: ObjectUniform,
    bindings: Option<MeshBindings>,
    resources: ResourceStack,
}

impl MeshCore {
    pub fn new(geometry: MeshGeometry) -> Self {
        Self {
            geometry,
            pass: ShaderPassName::MeshDefault,
            object: ObjectUniform::new(Mat4::IDENTITY, Vec4::ONE),
            bindings: None,
            resources: ResourceStack::new(),
        }
    }

    /// Draw with another shader pass, e.g. [`ShaderPassName::MeshTransparent`]
    pub fn with_pass(mut self, pass: ShaderPassName) -> Self {
        self.pass = pass;
        self
    }

    pub fn pass(&self) -> ShaderPassName {
        self.pass
    }

    pub fn geometry(&self) -> &MeshGeometry {
        &self.geometry
    }

    fn bindings(&self) -> RenderResult<&MeshBindings> {
        self.bindings
            .as_ref()
            .ok_or_else(|| RenderError::NotAttached(format!("mesh ({})", self.pass)))
    }

    fn draw_geometry(
        &self,
        ctx: &RenderContext<'_>,
        dc: &mut dyn DeviceContext,
        bindings: &MeshBindings,
        object: &ObjectUniform,
    ) {
        dc.update_buffer(bindings.object, 0, bytemuck::bytes_of(object));
        dc.set_constant_buffer(0, ctx.globals());
        dc.set_constant_buffer(1, bindings.object);
        dc.set_vertex_buffer(0, bindings.vertex, 0);
        dc.set_index_buffer(bindings.index, 0, IndexFormat::Uint32);
        dc.draw_indexed(0..self.geometry.indices.len() as u32, 0, 0..1);
    }
}

impl RenderCore for MeshCore {
    fn attach(&mut self, ctx: &AttachContext<'_>) -> RenderResult<()> {
        if self.geometry.indices.is_empty() {
            return Err(RenderError::InvalidParameter("mesh has no indices".into()));
        }
        let pass = ctx.effects.require(self.pass)?.handle;

        let vertices: &[u8] = bytemuck::cast_slice(&self.geometry.vertices);
        let indices: &[u8] = bytemuck::cast_slice(&self.geometry.indices);
        let vertex = self.resources.push_buffer(GpuBuffer::with_data(
            ctx.device,
            &BufferDescriptor {
                label: Some("mesh vertices".into()),
                size: vertices.len() as u64,
                usage: BufferUsage::VERTEX,
            },
            vertices,
        )?);
        let index = self.resources.push_buffer(GpuBuffer::with_data(
            ctx.device,
            &BufferDescriptor {
                label: Some("mesh indices".into()),
                size: indices.len() as u64,
                usage: BufferUsage::INDEX,
            },
            indices,
        )?);
        let object = self
            .resources
            .push_buffer(GpuBuffer::uniform::<ObjectUniform>(ctx.device, "mesh object")?);

        self.bindings = Some(MeshBindings {
            pass,
            vertex,
            index,
            object,
        });
        Ok(())
    }

    fn detach(&mut self) {
        self.bindings = None;
        self.resources.release();
    }

    fn render(&self, ctx: &RenderContext<'_>, dc: &mut dyn DeviceContext) -> RenderResult<()> {
        let bindings = self.bindings()?;
        dc.set_shader_pass(bindings.pass);
        self.draw_geometry(ctx, dc, bindings, &self.object);
        Ok(())
    }

    fn render_custom(
        &self,
        ctx: &RenderContext<'_>,
        dc: &mut dyn DeviceContext,
        color: Option<Vec4>,
    ) -> RenderResult<()> {
        let bindings = self.bindings()?;
        let mut object = self.object;
        if let Some(color) = color {
            object.color = color;
        }
        self.draw_geometry(ctx, dc, bindings, &object);
        Ok(())
    }

    fn sync(&mut self, state: &NodeState) {
        if state.dirty.contains(NodeDirtyFlags::TRANSFORM) {
            self.object.world = state.world;
            self.object.normal_matrix = state.world.inverse().transpose();
        }
        self.object.color = state.color;
        self.object.params.x = state.render_order as f32;
    }

    fn triangle_count(&self) -> usize {
        self.geometry.triangle_count()
    }

    fn local_bounds(&self) -> Option<BoundingBox> {
        self.geometry.bounds()
    }
}

/// Core contributing one light to the per-frame light buffer
pub struct LightCore {
    light: Light,
    world: Mat4,
}

impl LightCore {
    pub fn new(light: Light) -> Self {
        Self {
            light,
            world: Mat4::IDENTITY,
        }
    }

    pub fn light(&self) -> &Light {
        &self.light
    }
}

impl RenderCore for LightCore {
    fn attach(&mut self, _ctx: &AttachContext<'_>) -> RenderResult<()> {
        Ok(())
    }

    fn detach(&mut self) {}

    fn render(&self, _ctx: &RenderContext<'_>, _dc: &mut dyn DeviceContext) -> RenderResult<()> {
        Ok(())
    }

    fn sync(&mut self, state: &NodeState) {
        self.world = state.world;
    }

    fn light_data(&self) -> Option<GpuLightData> {
        let position = self.world.w_axis.truncate();
        let direction = self.world.transform_vector3(Vec3::NEG_Z);
        Some(self.light.to_gpu_data(position, direction))
    }
}

/// Screen corner an overlay is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScreenCorner {
    TopLeft,
    TopRight,
    #[default]
    BottomLeft,
    BottomRight,
}

/// Root core of a screen-spaced overlay such as a view cube
///
/// The overlay is drawn into a square viewport in one corner of the frame,
/// with a camera that follows the main camera's orientation at a fixed
/// distance. Descendant nodes are rendered with the overlay's globals.
pub struct ScreenSpacedCore {
    corner: ScreenCorner,
    size: u32,
    distance: f32,
    globals: Option<GpuBuffer>,
}

impl ScreenSpacedCore {
    pub fn new(corner: ScreenCorner, size: u32) -> Self {
        Self {
            corner,
            size: size.max(1),
            distance: 10.0,
            globals: None,
        }
    }

    pub fn with_distance(mut self, distance: f32) -> Self {
        self.distance = distance;
        self
    }

    /// Pixel viewport of the overlay inside a `width` x `height` frame
    pub fn viewport(&self, width: u32, height: u32) -> Viewport {
        let size = self.size.min(width).min(height) as f32;
        let (x, y) = match self.corner {
            ScreenCorner::TopLeft => (0.0, 0.0),
            ScreenCorner::TopRight => (width as f32 - size, 0.0),
            ScreenCorner::BottomLeft => (0.0, height as f32 - size),
            ScreenCorner::BottomRight => (width as f32 - size, height as f32 - size),
        };
        Viewport {
            x,
            y,
            width: size,
            height: size,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// Bind the overlay viewport, upload its globals and return the context its subtree renders with
    pub fn begin<'a>(
        &self,
        ctx: &RenderContext<'a>,
        parameter: &RenderParameter,
        dc: &mut dyn DeviceContext,
    ) -> RenderResult<RenderContext<'a>> {
        let globals = self
            .globals
            .as_ref()
            .ok_or_else(|| RenderError::NotAttached("screen spaced overlay".into()))?;
        let viewport = self.viewport(ctx.width, ctx.height);
        let camera = ctx.camera.screen_spaced(self.distance);
        let overlay = ctx.with_camera(camera, globals.handle(), viewport.width as u32, viewport.height as u32);

        dc.update_buffer(globals.handle(), 0, bytemuck::bytes_of(&overlay.global_uniform()));
        if let Some(depth) = parameter.depth_stencil {
            dc.clear_depth_stencil(depth, 1.0, 0);
        }
        dc.set_viewport(viewport);
        Ok(overlay)
    }
}

impl RenderCore for ScreenSpacedCore {
    fn attach(&mut self, ctx: &AttachContext<'_>) -> RenderResult<()> {
        self.globals = Some(GpuBuffer::uniform::<GlobalUniform>(ctx.device, "screen spaced globals")?);
        Ok(())
    }

    fn detach(&mut self) {
        self.globals = None;
    }

    fn render(&self, _ctx: &RenderContext<'_>, _dc: &mut dyn DeviceContext) -> RenderResult<()> {
        Ok(())
    }

    fn as_screen_spaced(&self) -> Option<&ScreenSpacedCore> {
        Some(self)
    }
}
