//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Maximum number of lights uploaded per frame
pub const MAX_LIGHTS: usize = 64;

/// A light source; position and direction come from the owning node's world matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Light {
    Ambient {
        color: Vec3,
    },
    Point {
        color: Vec3,
        intensity: f32,
        radius: f32,
    },
    Spot {
        color: Vec3,
        intensity: f32,
        radius: f32,
        inner_angle: f32, // radians
        outer_angle: f32, // radians
    },
    Directional {
        color: Vec3,
        intensity: f32,
    },
}

impl Light {
    pub fn point(color: Vec3, intensity: f32, radius: f32) -> Self {
        Light::Point {
            color,
            intensity,
            radius,
        }
    }

    pub fn directional(color: Vec3, intensity: f32) -> Self {
        Light::Directional { color, intensity }
    }

    /// GPU record for a light at `position` facing `direction`
    pub fn to_gpu_data(&self, position: Vec3, direction: Vec3) -> GpuLightData {
        let direction = direction.normalize_or_zero();
        match *self {
            Light::Ambient { color } => GpuLightData {
                position: Vec4::ZERO,
                color_intensity: color.extend(1.0),
                direction_type: Vec4::new(0.0, 0.0, 0.0, LightKind::Ambient as u32 as f32),
                spot_params: Vec4::ZERO,
            },
            Light::Point {
                color,
                intensity,
                radius,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: Vec4::new(0.0, 0.0, 0.0, LightKind::Point as u32 as f32),
                spot_params: Vec4::ZERO,
            },
            Light::Spot {
                color,
                intensity,
                radius,
                inner_angle,
                outer_angle,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(LightKind::Spot as u32 as f32),
                spot_params: Vec4::new(inner_angle.cos(), outer_angle.cos(), 0.0, 0.0),
            },
            Light::Directional { color, intensity } => GpuLightData {
                position: Vec4::new(0.0, 0.0, 0.0, f32::INFINITY),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(LightKind::Directional as u32 as f32),
                spot_params: Vec4::ZERO,
            },
        }
    }
}

/// Light type tag stored in `GpuLightData::direction_type.w`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LightKind {
    Point = 0,
    Spot = 1,
    Directional = 2,
    Ambient = 3,
}

/// GPU-friendly light data structure
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position, w = radius
    pub position: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = direction, w = light type
    pub direction_type: Vec4,
    /// x = cos(inner angle), y = cos(outer angle)
    pub spot_params: Vec4,
}

impl GpuLightData {
    pub fn kind(&self) -> f32 {
        self.direction_type.w
    }
}
