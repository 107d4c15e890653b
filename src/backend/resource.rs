//! Owned GPU resources
//!
//! [`GpuTexture`] and [`GpuBuffer`] release their device handle exactly once
//! when dropped. [`ResourceStack`] owns a group of them and releases them in
//! reverse acquisition order.

use std::sync::Arc;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;

/// A texture with its default view
pub struct GpuTexture {
    device: Arc<dyn RenderDevice>,
    texture: TextureHandle,
    view: TextureViewHandle,
    desc: TextureDescriptor,
}

impl GpuTexture {
    pub fn new(device: &Arc<dyn RenderDevice>, desc: TextureDescriptor) -> RenderResult<Self> {
        let texture = device.create_texture(&desc)?;
        let view = match device.create_texture_view(texture) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_texture(texture);
                return Err(err);
            }
        };
        Ok(Self {
            device: device.clone(),
            texture,
            view,
            desc,
        })
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn view(&self) -> TextureViewHandle {
        self.view
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn sample_count(&self) -> u32 {
        self.desc.sample_count
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.device.destroy_texture(self.texture);
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("texture", &self.texture)
            .field("view", &self.view)
            .field("desc", &self.desc)
            .finish()
    }
}

/// A GPU buffer
pub struct GpuBuffer {
    device: Arc<dyn RenderDevice>,
    handle: BufferHandle,
    size: u64,
}

impl GpuBuffer {
    pub fn new(device: &Arc<dyn RenderDevice>, desc: &BufferDescriptor) -> RenderResult<Self> {
        let handle = device.create_buffer(desc)?;
        Ok(Self {
            device: device.clone(),
            handle,
            size: desc.size,
        })
    }

    pub fn with_data(
        device: &Arc<dyn RenderDevice>,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> RenderResult<Self> {
        let handle = device.create_buffer_init(desc, data)?;
        Ok(Self {
            device: device.clone(),
            handle,
            size: desc.size,
        })
    }

    /// Uniform buffer sized for `T`
    pub fn uniform<T: bytemuck::Pod>(device: &Arc<dyn RenderDevice>, label: &str) -> RenderResult<Self> {
        Self::new(
            device,
            &BufferDescriptor::uniform(label, std::mem::size_of::<T>() as u64),
        )
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

/// Any owned GPU resource
#[derive(Debug)]
pub enum GpuResource {
    Texture(GpuTexture),
    Buffer(GpuBuffer),
}

/// Resources released in reverse acquisition order
#[derive(Debug, Default)]
pub struct ResourceStack {
    resources: Vec<GpuResource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_texture(&mut self, texture: GpuTexture) -> TextureViewHandle {
        let view = texture.view();
        self.resources.push(GpuResource::Texture(texture));
        view
    }

    pub fn push_buffer(&mut self, buffer: GpuBuffer) -> BufferHandle {
        let handle = buffer.handle();
        self.resources.push(GpuResource::Buffer(buffer));
        handle
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Release everything now
    pub fn release(&mut self) {
        while let Some(resource) = self.resources.pop() {
            drop(resource);
        }
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        self.release();
    }
}
