//! Render configuration
//!
//! Feature toggles consumed by the render host every frame. The host owns a
//! copy; replacing it takes effect on the next frame.

/// FXAA quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FxaaLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Ultra,
}

impl FxaaLevel {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, FxaaLevel::None)
    }

    /// Edge threshold handed to the FXAA shader
    pub fn edge_threshold(&self) -> f32 {
        match self {
            FxaaLevel::None => 0.0,
            FxaaLevel::Low => 0.333,
            FxaaLevel::Medium => 0.25,
            FxaaLevel::High => 0.166,
            FxaaLevel::Ultra => 0.125,
        }
    }
}

/// Order independent transparency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OitMode {
    /// Transparent nodes are blended in scene-graph order
    Disabled,
    /// Single pass weighted blended average
    #[default]
    SinglePassWeighted,
    /// Multi-layer depth peeling
    DepthPeeling,
}

/// Multisample count of the main color target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsaaLevel {
    #[default]
    Disable,
    Two,
    Four,
    Eight,
}

impl MsaaLevel {
    pub fn sample_count(&self) -> u32 {
        match self {
            MsaaLevel::Disable => 1,
            MsaaLevel::Two => 2,
            MsaaLevel::Four => 4,
            MsaaLevel::Eight => 8,
        }
    }
}

/// Screen space ambient occlusion parameters
///
/// Carried to shaders only as per-frame constants (`GlobalUniform::frame.zw`,
/// intensity zero when disabled); no occlusion pass ships with the crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsaoConfig {
    pub enabled: bool,
    pub radius: f32,
    pub intensity: f32,
}

impl Default for SsaoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 0.5,
            intensity: 1.0,
        }
    }
}

/// Draw call count below which deferred recording is not worth the overhead
pub const DEFAULT_MINIMUM_DRAW_CALLS: usize = 600;

/// Upper bound on parallel recording partitions
pub const DEFAULT_MAX_NUMBER_OF_TASKS: usize = 4;

/// Configuration for the render host
#[derive(Debug, Clone)]
pub struct RenderConfiguration {
    pub fxaa_level: FxaaLevel,
    pub oit_mode: OitMode,
    /// Number of layers peeled when `oit_mode` is `DepthPeeling`
    pub oit_depth_peeling_layers: u32,
    pub msaa: MsaaLevel,
    pub ssao: SsaoConfig,
    /// Sort opaque, particle and post-effect buckets by node render order
    pub enable_render_order: bool,
    /// Record opaque draw calls on deferred contexts and run the auxiliary update thread
    pub enable_parallel_processing: bool,
    pub enable_frustum_test: bool,
    /// Depth-only pass before shading when the color target is multisampled
    pub enable_depth_prepass: bool,
    pub minimum_draw_calls: usize,
    pub max_number_of_tasks: usize,
    pub clear_color: [f32; 4],
    pub render_light: bool,
    pub update_per_frame_data: bool,
}

impl Default for RenderConfiguration {
    fn default() -> Self {
        let processors = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            fxaa_level: FxaaLevel::None,
            oit_mode: OitMode::SinglePassWeighted,
            oit_depth_peeling_layers: 4,
            msaa: MsaaLevel::Disable,
            ssao: SsaoConfig::default(),
            enable_render_order: false,
            enable_parallel_processing: false,
            enable_frustum_test: true,
            enable_depth_prepass: true,
            minimum_draw_calls: DEFAULT_MINIMUM_DRAW_CALLS,
            max_number_of_tasks: DEFAULT_MAX_NUMBER_OF_TASKS.min(processors).max(1),
            clear_color: [1.0, 1.0, 1.0, 1.0],
            render_light: true,
            update_per_frame_data: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let config = RenderConfiguration::default();
        assert_eq!(config.minimum_draw_calls, 600);
        assert!(config.max_number_of_tasks >= 1);
        assert!(config.max_number_of_tasks <= DEFAULT_MAX_NUMBER_OF_TASKS);
        assert!(!config.fxaa_level.is_enabled());
    }

    #[test]
    fn msaa_sample_counts() {
        assert_eq!(MsaaLevel::Disable.sample_count(), 1);
        assert_eq!(MsaaLevel::Four.sample_count(), 4);
    }

    #[test]
    fn fxaa_thresholds_tighten_with_quality() {
        assert!(FxaaLevel::Ultra.edge_threshold() < FxaaLevel::Low.edge_threshold());
    }
}
