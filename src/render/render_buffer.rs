//! Render targets of a render host
//!
//! The main color and depth targets carry the MSAA sample count. Everything
//! post-processing touches is single-sampled: the ping-pong pair, the back
//! buffer and the offscreen targets effects request by size and format.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    GpuTexture, RenderDevice, TextureDescriptor, TextureFormat, TextureHandle, TextureViewHandle,
};
use crate::error::{RenderError, RenderResult};
use crate::technique::{COLOR_FORMAT, DEPTH_FORMAT};

/// Texture handles of a target owned by a [`RenderBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetView {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
}

impl From<&GpuTexture> for TargetView {
    fn from(texture: &GpuTexture) -> Self {
        Self {
            texture: texture.texture(),
            view: texture.view(),
            width: texture.width(),
            height: texture.height(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OffscreenKey {
    width: u32,
    height: u32,
    format: TextureFormat,
    slot: u32,
}

/// Frame targets sized to the host surface
pub struct RenderBuffer {
    device: Arc<dyn RenderDevice>,
    width: u32,
    height: u32,
    sample_count: u32,
    color: GpuTexture,
    depth: GpuTexture,
    prepass_depth: Option<GpuTexture>,
    ping_pong: [GpuTexture; 2],
    current: usize,
    back_buffer: GpuTexture,
    offscreen: Mutex<HashMap<OffscreenKey, GpuTexture>>,
}

impl RenderBuffer {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "render buffer size {}x{}",
                width, height
            )));
        }
        let sample_count = sample_count.max(1);
        let color = GpuTexture::new(
            &device,
            TextureDescriptor::render_target("main color", width, height, COLOR_FORMAT)
                .with_sample_count(sample_count),
        )?;
        let depth = GpuTexture::new(
            &device,
            TextureDescriptor::render_target("main depth", width, height, DEPTH_FORMAT)
                .with_sample_count(sample_count),
        )?;
        let prepass_depth = if sample_count > 1 {
            Some(GpuTexture::new(
                &device,
                TextureDescriptor::render_target("prepass depth", width, height, DEPTH_FORMAT),
            )?)
        } else {
            None
        };
        let ping_pong = [
            GpuTexture::new(
                &device,
                TextureDescriptor::render_target("ping", width, height, COLOR_FORMAT),
            )?,
            GpuTexture::new(
                &device,
                TextureDescriptor::render_target("pong", width, height, COLOR_FORMAT),
            )?,
        ];
        let back_buffer = GpuTexture::new(
            &device,
            TextureDescriptor::render_target("back buffer", width, height, COLOR_FORMAT),
        )?;
        log::debug!(
            "Created render buffer {}x{} ({}x MSAA)",
            width,
            height,
            sample_count
        );
        Ok(Self {
            device,
            width,
            height,
            sample_count,
            color,
            depth,
            prepass_depth,
            ping_pong,
            current: 0,
            back_buffer,
            offscreen: Mutex::new(HashMap::new()),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn has_msaa(&self) -> bool {
        self.sample_count > 1
    }

    /// Main color target
    pub fn color(&self) -> TargetView {
        (&self.color).into()
    }

    /// Main depth-stencil target
    pub fn depth(&self) -> TargetView {
        (&self.depth).into()
    }

    /// Single-sampled depth filled by the depth prepass
    pub fn prepass_depth(&self) -> Option<TargetView> {
        self.prepass_depth.as_ref().map(TargetView::from)
    }

    /// Single-sampled depth holding opaque geometry, if one exists this frame
    pub fn single_sampled_depth(&self) -> TargetView {
        match &self.prepass_depth {
            Some(depth) => depth.into(),
            None => (&self.depth).into(),
        }
    }

    /// Ping-pong texture holding the latest post-processed frame
    pub fn current_ping_pong(&self) -> TargetView {
        (&self.ping_pong[self.current]).into()
    }

    /// The other ping-pong texture, free to be written
    pub fn next_ping_pong(&self) -> TargetView {
        (&self.ping_pong[1 - self.current]).into()
    }

    /// Make the next texture current
    pub fn swap_ping_pong(&mut self) {
        self.current = 1 - self.current;
    }

    pub fn back_buffer(&self) -> TargetView {
        (&self.back_buffer).into()
    }

    /// Single-sampled offscreen target, created on first use and kept until resize
    ///
    /// Distinct `slot`s give distinct textures of the same size and format.
    pub fn offscreen(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
        slot: u32,
    ) -> RenderResult<TargetView> {
        let key = OffscreenKey {
            width: width.max(1),
            height: height.max(1),
            format,
            slot,
        };
        let mut cache = self.offscreen.lock();
        if let Some(texture) = cache.get(&key) {
            return Ok(texture.into());
        }
        let texture = GpuTexture::new(
            &self.device,
            TextureDescriptor::render_target("offscreen", key.width, key.height, format),
        )?;
        let target = TargetView::from(&texture);
        cache.insert(key, texture);
        log::trace!(
            "Created offscreen target {}x{} {:?} slot {}",
            key.width,
            key.height,
            format,
            slot
        );
        Ok(target)
    }

    pub fn offscreen_count(&self) -> usize {
        self.offscreen.lock().len()
    }

    /// Recreate every target at a new size
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        *self = RenderBuffer::new(self.device.clone(), width, height, self.sample_count)?;
        Ok(())
    }
}

impl std::fmt::Debug for RenderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sample_count", &self.sample_count)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
