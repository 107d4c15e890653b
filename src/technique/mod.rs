//! Shader pass registry
//!
//! Every pass the renderer can use is named by [`ShaderPassName`]. An
//! [`EffectsManager`] compiles a set of passes once per device; a pass the
//! device refuses fails the build. At frame time a missing pass is looked up
//! with [`EffectsManager::get`] and skipped, at attach time with
//! [`EffectsManager::require`] and reported.

use std::collections::HashMap;
use std::fmt;

use crate::backend::{
    BlendState, ColorTarget, CompareFunction, CullMode, DepthState, PassGeometry, RenderDevice,
    ShaderPassDescriptor, ShaderPassHandle, StencilState, TextureFormat,
};
use crate::error::{RenderError, RenderResult};

/// Format of the main color target, ping-pong buffers and the back buffer
pub const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Format of every depth-stencil target
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

/// Named shader passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderPassName {
    MeshDefault,
    MeshTransparent,
    DepthPrepass,
    Particle,
    ScreenQuad,
    EffectBlurVertical,
    EffectBlurHorizontal,
    EffectOutlineP1,
    EffectOutlineP2,
    EffectMeshXRayP1,
    EffectMeshXRayP2,
    Fxaa,
    OitWeighted,
    OitComposite,
    OitDepthPeeling,
    OitDepthPeelingBlend,
}

impl ShaderPassName {
    pub const ALL: [ShaderPassName; 16] = [
        ShaderPassName::MeshDefault,
        ShaderPassName::MeshTransparent,
        ShaderPassName::DepthPrepass,
        ShaderPassName::Particle,
        ShaderPassName::ScreenQuad,
        ShaderPassName::EffectBlurVertical,
        ShaderPassName::EffectBlurHorizontal,
        ShaderPassName::EffectOutlineP1,
        ShaderPassName::EffectOutlineP2,
        ShaderPassName::EffectMeshXRayP1,
        ShaderPassName::EffectMeshXRayP2,
        ShaderPassName::Fxaa,
        ShaderPassName::OitWeighted,
        ShaderPassName::OitComposite,
        ShaderPassName::OitDepthPeeling,
        ShaderPassName::OitDepthPeelingBlend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShaderPassName::MeshDefault => "MeshDefault",
            ShaderPassName::MeshTransparent => "MeshTransparent",
            ShaderPassName::DepthPrepass => "DepthPrepass",
            ShaderPassName::Particle => "Particle",
            ShaderPassName::ScreenQuad => "ScreenQuad",
            ShaderPassName::EffectBlurVertical => "EffectBlurVertical",
            ShaderPassName::EffectBlurHorizontal => "EffectBlurHorizontal",
            ShaderPassName::EffectOutlineP1 => "EffectOutlineP1",
            ShaderPassName::EffectOutlineP2 => "EffectOutlineP2",
            ShaderPassName::EffectMeshXRayP1 => "EffectMeshXRayP1",
            ShaderPassName::EffectMeshXRayP2 => "EffectMeshXRayP2",
            ShaderPassName::Fxaa => "Fxaa",
            ShaderPassName::OitWeighted => "OitWeighted",
            ShaderPassName::OitComposite => "OitComposite",
            ShaderPassName::OitDepthPeeling => "OitDepthPeeling",
            ShaderPassName::OitDepthPeelingBlend => "OitDepthPeelingBlend",
        }
    }

    /// Default pipeline state of this pass
    ///
    /// `sample_count` applies to passes that draw into the main color
    /// target; passes drawing into offscreen targets are single-sampled.
    pub fn descriptor(&self, sample_count: u32) -> ShaderPassDescriptor {
        let main = |blend: Option<BlendState>| ColorTarget {
            format: COLOR_FORMAT,
            blend,
        };
        let mut desc = ShaderPassDescriptor {
            name: *self,
            geometry: PassGeometry::Mesh,
            color_targets: vec![main(None)],
            depth: Some(DepthState::less_write()),
            cull_mode: CullMode::Back,
            sample_count,
            texture_count: 0,
        };

        match self {
            ShaderPassName::MeshDefault => {}
            ShaderPassName::MeshTransparent => {
                desc.color_targets = vec![main(Some(BlendState::alpha_blending()))];
                desc.depth = Some(DepthState::read_only(CompareFunction::Less));
                desc.cull_mode = CullMode::None;
            }
            ShaderPassName::DepthPrepass => {
                desc.color_targets.clear();
                desc.sample_count = 1;
            }
            ShaderPassName::Particle => {
                desc.color_targets = vec![main(Some(BlendState::additive()))];
                desc.depth = Some(DepthState::read_only(CompareFunction::Less));
                desc.cull_mode = CullMode::None;
            }
            ShaderPassName::ScreenQuad
            | ShaderPassName::EffectBlurVertical
            | ShaderPassName::EffectBlurHorizontal
            | ShaderPassName::Fxaa => {
                desc.geometry = PassGeometry::FullScreen;
                desc.depth = None;
                desc.cull_mode = CullMode::None;
                desc.sample_count = 1;
                desc.texture_count = 1;
            }
            ShaderPassName::EffectOutlineP1 => {
                desc.depth = Some(DepthState::less_write());
                desc.cull_mode = CullMode::None;
                desc.sample_count = 1;
            }
            ShaderPassName::EffectOutlineP2 => {
                desc.geometry = PassGeometry::FullScreen;
                desc.color_targets = vec![main(Some(BlendState::alpha_blending()))];
                desc.depth = None;
                desc.cull_mode = CullMode::None;
                desc.texture_count = 2;
            }
            ShaderPassName::EffectMeshXRayP1 => {
                desc.color_targets = vec![main(Some(BlendState::keep_destination()))];
                desc.depth = Some(
                    DepthState::read_only(CompareFunction::LessEqual)
                        .with_stencil(StencilState::mark()),
                );
            }
            ShaderPassName::EffectMeshXRayP2 => {
                desc.color_targets = vec![main(Some(BlendState::alpha_blending()))];
                desc.depth = Some(
                    DepthState::read_only(CompareFunction::Greater)
                        .with_stencil(StencilState::not_equal()),
                );
            }
            ShaderPassName::OitWeighted => {
                desc.color_targets = vec![
                    ColorTarget {
                        format: TextureFormat::Rgba16Float,
                        blend: Some(BlendState::additive()),
                    },
                    ColorTarget {
                        format: TextureFormat::R16Float,
                        blend: Some(BlendState::revealage()),
                    },
                ];
                desc.depth = Some(DepthState::read_only(CompareFunction::Less));
                desc.cull_mode = CullMode::None;
                desc.sample_count = 1;
            }
            ShaderPassName::OitComposite => {
                desc.geometry = PassGeometry::FullScreen;
                desc.color_targets = vec![main(Some(BlendState::alpha_blending()))];
                desc.depth = None;
                desc.cull_mode = CullMode::None;
                desc.texture_count = 2;
            }
            ShaderPassName::OitDepthPeeling => {
                desc.color_targets = vec![
                    main(None),
                    ColorTarget {
                        format: TextureFormat::R32Float,
                        blend: None,
                    },
                ];
                desc.cull_mode = CullMode::None;
                desc.sample_count = 1;
                desc.texture_count = 1;
            }
            ShaderPassName::OitDepthPeelingBlend => {
                desc.geometry = PassGeometry::FullScreen;
                desc.color_targets = vec![main(Some(BlendState::alpha_blending()))];
                desc.depth = None;
                desc.cull_mode = CullMode::None;
                desc.texture_count = 1;
            }
        }
        desc
    }
}

impl fmt::Display for ShaderPassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled shader pass
#[derive(Debug, Clone)]
pub struct ShaderPass {
    pub name: ShaderPassName,
    pub handle: ShaderPassHandle,
    pub descriptor: ShaderPassDescriptor,
}

/// Registry of compiled shader passes for one device
#[derive(Debug)]
pub struct EffectsManager {
    passes: HashMap<ShaderPassName, ShaderPass>,
    sample_count: u32,
}

impl EffectsManager {
    pub fn builder() -> EffectsManagerBuilder {
        EffectsManagerBuilder::default()
    }

    /// Frame-time lookup; callers skip the work when the pass is absent
    pub fn get(&self, name: ShaderPassName) -> Option<&ShaderPass> {
        self.passes.get(&name)
    }

    /// Attach-time lookup; an absent pass is an error
    pub fn require(&self, name: ShaderPassName) -> RenderResult<&ShaderPass> {
        self.passes
            .get(&name)
            .ok_or(RenderError::MissingShaderPass(name))
    }

    pub fn contains(&self, name: ShaderPassName) -> bool {
        self.passes.contains_key(&name)
    }

    /// Sample count of the main color target the passes were built for
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// Builder for [`EffectsManager`]
#[derive(Debug, Clone)]
pub struct EffectsManagerBuilder {
    passes: Vec<ShaderPassDescriptor>,
    sample_count: u32,
}

impl Default for EffectsManagerBuilder {
    fn default() -> Self {
        Self {
            passes: Vec::new(),
            sample_count: 1,
        }
    }
}

impl EffectsManagerBuilder {
    /// Main target sample count; set before adding passes
    pub fn sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    /// Add a pass with its default pipeline state
    pub fn with_pass(self, name: ShaderPassName) -> Self {
        let desc = name.descriptor(self.sample_count);
        self.with_descriptor(desc)
    }

    /// Add or replace a pass with a custom pipeline state
    pub fn with_descriptor(mut self, desc: ShaderPassDescriptor) -> Self {
        self.passes.retain(|existing| existing.name != desc.name);
        self.passes.push(desc);
        self
    }

    /// Add every known pass
    pub fn with_all_passes(self) -> Self {
        ShaderPassName::ALL
            .iter()
            .fold(self, |builder, name| builder.with_pass(*name))
    }

    /// Compile every pass on `device`
    pub fn build(self, device: &dyn RenderDevice) -> RenderResult<EffectsManager> {
        let mut passes = HashMap::with_capacity(self.passes.len());
        for descriptor in self.passes {
            let handle = device.create_shader_pass(&descriptor).map_err(|err| {
                log::error!("Shader pass {} failed to build: {}", descriptor.name, err);
                match err {
                    RenderError::DeviceLost => RenderError::DeviceLost,
                    _ => RenderError::MissingShaderPass(descriptor.name),
                }
            })?;
            passes.insert(
                descriptor.name,
                ShaderPass {
                    name: descriptor.name,
                    handle,
                    descriptor,
                },
            );
        }
        log::debug!(
            "Built {} shader passes on {} ({}x MSAA)",
            passes.len(),
            device.name(),
            self.sample_count
        );
        Ok(EffectsManager {
            passes,
            sample_count: self.sample_count,
        })
    }
}
