//! WGSL sources for the stock shader passes
//!
//! Two modules: one for mesh geometry and one for fullscreen passes. Each
//! [`ShaderPassName`] picks its entry points from one of them.

use crate::backend::PassGeometry;
use crate::technique::ShaderPassName;

const UNIFORMS: &str = r#"
struct Globals {
    view: mat4x4<f32>,
    projection: mat4x4<f32>,
    view_projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    viewport: vec4<f32>,
    frame: vec4<f32>,
    ambient: vec4<f32>,
}

struct PerObject {
    world: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    color: vec4<f32>,
    params: vec4<f32>,
}

// direction_type.w: 0 point, 1 spot, 2 directional
struct Light {
    position: vec4<f32>,
    color_intensity: vec4<f32>,
    direction_type: vec4<f32>,
    spot_params: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<uniform> per_object: PerObject;
@group(0) @binding(2) var<uniform> lights: array<Light, 64>;
"#;

const MESH_SHADER: &str = r#"
@group(1) @binding(0) var previous_layer: texture_2d<f32>;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) world_position: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

@vertex
fn vs_mesh(in: VertexInput) -> VertexOutput {
    let world = per_object.world * vec4<f32>(in.position, 1.0);
    var out: VertexOutput;
    out.clip_position = globals.view_projection * world;
    out.world_normal = normalize((per_object.normal_matrix * vec4<f32>(in.normal, 0.0)).xyz);
    out.world_position = world.xyz;
    out.uv = in.uv;
    return out;
}

fn light_contribution(light: Light, normal: vec3<f32>, world_position: vec3<f32>) -> vec3<f32> {
    let kind = u32(light.direction_type.w);
    var to_light = -light.direction_type.xyz;
    var attenuation = 1.0;
    if (kind != 2u) {
        let offset = light.position.xyz - world_position;
        let distance = length(offset);
        to_light = offset / max(distance, 1e-4);
        attenuation = clamp(1.0 - distance / max(light.position.w, 1e-4), 0.0, 1.0);
        if (kind == 1u) {
            let cos_angle = dot(-to_light, light.direction_type.xyz);
            attenuation = attenuation * smoothstep(light.spot_params.y, light.spot_params.x, cos_angle);
        }
    }
    let diffuse = max(dot(normal, to_light), 0.0);
    return light.color_intensity.rgb * light.color_intensity.w * diffuse * attenuation;
}

// Without scene lights a headlight at the camera stands in.
fn shade(in: VertexOutput) -> vec4<f32> {
    let normal = normalize(in.world_normal);
    let count = min(u32(globals.frame.x), 64u);
    var lit = globals.ambient.rgb;
    if (count == 0u) {
        let to_camera = normalize(globals.camera_position.xyz - in.world_position);
        lit = lit + vec3<f32>(max(dot(normal, to_camera), 0.0));
    }
    for (var i = 0u; i < count; i = i + 1u) {
        lit = lit + light_contribution(lights[i], normal, in.world_position);
    }
    return vec4<f32>(per_object.color.rgb * lit, per_object.color.a);
}

@fragment
fn fs_mesh(in: VertexOutput) -> @location(0) vec4<f32> {
    return shade(in);
}

@fragment
fn fs_solid(in: VertexOutput) -> @location(0) vec4<f32> {
    return per_object.color;
}

struct OitOutput {
    @location(0) accum: vec4<f32>,
    @location(1) reveal: f32,
}

@fragment
fn fs_oit_accum(in: VertexOutput) -> OitOutput {
    let color = shade(in);
    let z = in.clip_position.z;
    let weight = clamp(
        pow(min(1.0, color.a * 10.0) + 0.01, 3.0) * 1e8 * pow(1.0 - z * 0.9, 3.0),
        1e-2,
        3e3,
    );
    var out: OitOutput;
    out.accum = vec4<f32>(color.rgb * color.a, color.a) * weight;
    out.reveal = color.a;
    return out;
}

struct PeelOutput {
    @location(0) color: vec4<f32>,
    @location(1) depth: f32,
}

@fragment
fn fs_depth_peel(in: VertexOutput) -> PeelOutput {
    let previous = textureLoad(previous_layer, vec2<i32>(in.clip_position.xy), 0).r;
    if (in.clip_position.z <= previous) {
        discard;
    }
    var out: PeelOutput;
    out.color = shade(in);
    out.depth = in.clip_position.z;
    return out;
}
"#;

const FULLSCREEN_SHADER: &str = r#"
@group(1) @binding(0) var source_texture: texture_2d<f32>;
@group(1) @binding(1) var second_texture: texture_2d<f32>;

struct QuadOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_quad(@builtin(vertex_index) vertex_index: u32) -> QuadOutput {
    var out: QuadOutput;
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    out.position = vec4<f32>(x * 2.0 - 1.0, 1.0 - y * 2.0, 0.0, 1.0);
    out.uv = vec2<f32>(x, y);
    return out;
}

// params.zw carries the size of the target being drawn when it differs
// from the source size.
fn source_coord(position: vec2<f32>, size: vec2<i32>, offset: vec2<i32>) -> vec2<i32> {
    var scale = vec2<f32>(1.0, 1.0);
    if (per_object.params.z > 0.0) {
        scale = vec2<f32>(size) / per_object.params.zw;
    }
    return clamp(vec2<i32>(position * scale) + offset, vec2<i32>(0, 0), size - vec2<i32>(1, 1));
}

fn load_source(position: vec2<f32>, offset: vec2<i32>) -> vec4<f32> {
    let size = vec2<i32>(textureDimensions(source_texture));
    return textureLoad(source_texture, source_coord(position, size, offset), 0);
}

fn blur(position: vec2<f32>, direction: vec2<i32>) -> vec4<f32> {
    var weights = array<f32, 5>(0.227027, 0.1945946, 0.1216216, 0.054054, 0.016216);
    var result = load_source(position, vec2<i32>(0, 0)) * weights[0];
    for (var i = 1; i < 5; i = i + 1) {
        result = result + load_source(position, direction * i) * weights[i];
        result = result + load_source(position, -direction * i) * weights[i];
    }
    return result;
}

fn luma(color: vec3<f32>) -> f32 {
    return dot(color, vec3<f32>(0.299, 0.587, 0.114));
}

@fragment
fn fs_copy(in: QuadOutput) -> @location(0) vec4<f32> {
    return load_source(in.position.xy, vec2<i32>(0, 0));
}

@fragment
fn fs_blur_vertical(in: QuadOutput) -> @location(0) vec4<f32> {
    return blur(in.position.xy, vec2<i32>(0, 1));
}

@fragment
fn fs_blur_horizontal(in: QuadOutput) -> @location(0) vec4<f32> {
    return blur(in.position.xy, vec2<i32>(1, 0));
}

// Texture 0 is the blurred silhouette, texture 1 the sharp mask.
@fragment
fn fs_outline_composite(in: QuadOutput) -> @location(0) vec4<f32> {
    let glow = load_source(in.position.xy, vec2<i32>(0, 0));
    let mask_size = vec2<i32>(textureDimensions(second_texture));
    let mask = textureLoad(second_texture, source_coord(in.position.xy, mask_size, vec2<i32>(0, 0)), 0).a;
    return vec4<f32>(glow.rgb, glow.a * (1.0 - mask) * per_object.color.a);
}

@fragment
fn fs_fxaa(in: QuadOutput) -> @location(0) vec4<f32> {
    let center = load_source(in.position.xy, vec2<i32>(0, 0));
    let north = load_source(in.position.xy, vec2<i32>(0, -1));
    let south = load_source(in.position.xy, vec2<i32>(0, 1));
    let west = load_source(in.position.xy, vec2<i32>(-1, 0));
    let east = load_source(in.position.xy, vec2<i32>(1, 0));

    let luma_center = luma(center.rgb);
    let luma_min = min(luma_center, min(min(luma(north.rgb), luma(south.rgb)), min(luma(west.rgb), luma(east.rgb))));
    let luma_max = max(luma_center, max(max(luma(north.rgb), luma(south.rgb)), max(luma(west.rgb), luma(east.rgb))));
    if (luma_max - luma_min < max(0.0312, luma_max * per_object.params.x)) {
        return center;
    }
    let average = (north + south + west + east) * 0.25;
    return vec4<f32>(mix(center.rgb, average.rgb, 0.5), center.a);
}

@fragment
fn fs_oit_composite(in: QuadOutput) -> @location(0) vec4<f32> {
    let coord = vec2<i32>(in.position.xy);
    let accum = textureLoad(source_texture, coord, 0);
    let reveal = textureLoad(second_texture, coord, 0).r;
    let average = accum.rgb / max(accum.a, 1e-5);
    return vec4<f32>(average, 1.0 - reveal);
}
"#;

/// WGSL source of the module a geometry kind draws with
pub fn module_source(geometry: PassGeometry) -> String {
    let body = match geometry {
        PassGeometry::Mesh => MESH_SHADER,
        PassGeometry::FullScreen => FULLSCREEN_SHADER,
    };
    format!("{}{}", UNIFORMS, body)
}

/// Vertex and fragment entry points of a pass; `None` means depth only
pub fn entry_points(name: ShaderPassName) -> (&'static str, Option<&'static str>) {
    match name {
        ShaderPassName::MeshDefault
        | ShaderPassName::MeshTransparent
        | ShaderPassName::Particle => ("vs_mesh", Some("fs_mesh")),
        ShaderPassName::DepthPrepass => ("vs_mesh", None),
        ShaderPassName::EffectOutlineP1
        | ShaderPassName::EffectMeshXRayP1
        | ShaderPassName::EffectMeshXRayP2 => ("vs_mesh", Some("fs_solid")),
        ShaderPassName::OitWeighted => ("vs_mesh", Some("fs_oit_accum")),
        ShaderPassName::OitDepthPeeling => ("vs_mesh", Some("fs_depth_peel")),
        ShaderPassName::ScreenQuad | ShaderPassName::OitDepthPeelingBlend => {
            ("vs_quad", Some("fs_copy"))
        }
        ShaderPassName::EffectBlurVertical => ("vs_quad", Some("fs_blur_vertical")),
        ShaderPassName::EffectBlurHorizontal => ("vs_quad", Some("fs_blur_horizontal")),
        ShaderPassName::EffectOutlineP2 => ("vs_quad", Some("fs_outline_composite")),
        ShaderPassName::Fxaa => ("vs_quad", Some("fs_fxaa")),
        ShaderPassName::OitComposite => ("vs_quad", Some("fs_oit_composite")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pass_has_entry_points_in_its_module() {
        for name in ShaderPassName::ALL {
            let desc = name.descriptor(1);
            let source = module_source(desc.geometry);
            let (vertex, fragment) = entry_points(name);
            assert!(source.contains(&format!("fn {}(", vertex)), "{}", name);
            if let Some(fragment) = fragment {
                assert!(source.contains(&format!("fn {}(", fragment)), "{}", name);
            }
            assert_eq!(fragment.is_none(), desc.color_targets.is_empty(), "{}", name);
        }
    }

    #[test]
    fn outline_composite_subtracts_the_mask() {
        let source = module_source(PassGeometry::FullScreen);
        let composite = &source[source.find("fn fs_outline_composite").unwrap()..];
        let body = &composite[..composite.find("\n}\n").unwrap()];
        assert!(body.contains("textureLoad(second_texture"));
        assert!(body.contains("glow.a * (1.0 - mask)"));
    }

    #[test]
    fn mesh_shading_reads_the_light_array() {
        let source = module_source(PassGeometry::Mesh);
        assert!(source.contains("@group(0) @binding(2) var<uniform> lights: array<Light, 64>"));
        assert!(source.contains(&format!("array<Light, {}>", crate::scene::MAX_LIGHTS)));
        assert!(source.contains("light_contribution(lights[i]"));
        let light_block = std::mem::size_of::<crate::scene::GpuLightData>() * crate::scene::MAX_LIGHTS;
        assert_eq!(light_block as u64, super::super::FALLBACK_UNIFORM_SIZE);
    }
}
