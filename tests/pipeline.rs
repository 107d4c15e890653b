//! Whole-frame tests of the render host on the recording backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{Vec3, Vec4};
use rstest::rstest;

use common::{
    cube, draw_tags, init_logging, recording_device, recording_device_at, Frame, TaggedCore,
};
use helix_render::backend::{
    BufferHandle, FeatureLevel, GlobalUniform, RecordedCommand, RecordingDevice, RenderTargets, TextureHandle,
    TextureViewHandle,
};
use helix_render::postprocess::{OutlineCore, PostEffect, XRayCore};
use helix_render::render::{
    classify_frustum, FrameBuckets, ImmediateRenderer, RenderBuffer, Renderer, LIGHT_SLOT,
};
use helix_render::scene::{
    flatten_all, skip_subtree, Camera, GpuLightData, Light, LightCore, LightKind, MeshCore,
    MeshGeometry, ScreenCorner, ScreenSpacedCore,
};
use helix_render::{
    FxaaLevel, MsaaLevel, OitMode, RenderConfiguration, RenderError, RenderHost, RenderType,
    SceneNode, ShaderPassName,
};

fn started_host(config: RenderConfiguration) -> (RecordingDevice, RenderHost) {
    init_logging();
    let (recording, device) = recording_device();
    let mut host = RenderHost::new(device, config);
    host.start(128, 96).unwrap();
    host.set_camera(Camera::new(Vec3::new(0.0, 0.0, 6.0), Vec3::ZERO));
    (recording, host)
}

/// Shader passes bound on the device timeline, in order
fn bound_passes(recording: &RecordingDevice) -> Vec<ShaderPassName> {
    recording
        .timeline()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::SetShaderPass(pass) => recording.shader_pass_name(*pass),
            _ => None,
        })
        .collect()
}

/// Render targets bound each time the `name` pass is set
fn targets_for_pass(recording: &RecordingDevice, name: ShaderPassName) -> Vec<RenderTargets> {
    let mut current = None;
    let mut found = Vec::new();
    for command in recording.timeline() {
        match command {
            RecordedCommand::SetRenderTargets(targets) => current = Some(targets),
            RecordedCommand::SetShaderPass(pass) if recording.shader_pass_name(pass) == Some(name) => {
                found.extend(current.clone());
            }
            _ => {}
        }
    }
    found
}

/// Views bound to texture `slot` while the `name` pass is current
fn textures_for_pass(recording: &RecordingDevice, name: ShaderPassName, slot: u32) -> Vec<TextureViewHandle> {
    let mut active = false;
    let mut found = Vec::new();
    for command in recording.timeline() {
        match command {
            RecordedCommand::SetShaderPass(pass) => active = recording.shader_pass_name(pass) == Some(name),
            RecordedCommand::SetTexture { slot: bound, view } if active && bound == slot => found.push(view),
            _ => {}
        }
    }
    found
}

/// Timeline index of the first time the `name` pass is set
fn first_bind(recording: &RecordingDevice, name: ShaderPassName) -> Option<usize> {
    recording.timeline().iter().position(|command| {
        matches!(command, RecordedCommand::SetShaderPass(pass) if recording.shader_pass_name(*pass) == Some(name))
    })
}

fn texture_copies(recording: &RecordingDevice) -> Vec<(usize, TextureHandle, TextureHandle)> {
    recording
        .timeline()
        .iter()
        .enumerate()
        .filter_map(|(index, command)| match command {
            RecordedCommand::CopyTexture {
                source,
                destination,
            } => Some((index, *source, *destination)),
            _ => None,
        })
        .collect()
}

fn glass() -> SceneNode {
    SceneNode::new(
        "glass",
        RenderType::Transparent,
        MeshCore::new(MeshGeometry::quad()).with_pass(ShaderPassName::MeshTransparent),
    )
}

#[test]
fn render_requires_start() {
    init_logging();
    let (_, device) = recording_device();
    let mut host = RenderHost::new(device, RenderConfiguration::default());
    assert_eq!(host.render(), Err(RenderError::NotStarted));
    assert!(host.back_buffer().is_none());
}

#[test]
fn single_cube_frame() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();

    assert_eq!(host.render(), Ok(true));

    let stats = host.statistics();
    assert_eq!(stats.frame_count, 1);
    assert_eq!(stats.nodes_rendered, 1);
    assert_eq!(stats.nodes_bucketed, 1);
    assert_eq!(stats.triangles, 12);
    assert_eq!(stats.command_lists, 0);

    let draws = recording.draw_calls();
    assert_eq!(draws.len(), 1);
    assert!(matches!(
        &draws[0],
        RecordedCommand::DrawIndexed { indices, .. } if *indices == (0..36)
    ));

    let back_buffer = host.back_buffer().unwrap();
    assert_eq!((back_buffer.width, back_buffer.height), (128, 96));
    assert!(recording.timeline().iter().any(|command| matches!(
        command,
        RecordedCommand::CopyTexture { destination, .. } if *destination == back_buffer.texture
    )));
}

#[rstest]
#[case::culled(true, 1)]
#[case::bypassed(false, 2)]
fn frustum_test_toggle(#[case] enabled: bool, #[case] expected: usize) {
    let config = RenderConfiguration {
        enable_frustum_test: enabled,
        ..Default::default()
    };
    let (recording, mut host) = started_host(config);
    host.add_root(cube("visible", Vec3::ZERO)).unwrap();
    let hidden = host.add_root(cube("behind", Vec3::new(0.0, 0.0, 50.0))).unwrap();

    host.render().unwrap();

    assert_eq!(host.statistics().nodes_rendered, expected);
    assert_eq!(recording.draw_calls().len(), expected);
    let hidden = host.roots().iter().find(|root| root.id() == hidden).unwrap();
    assert_eq!(hidden.is_in_frustum(), !enabled);
}

#[test]
fn hidden_subtree_is_skipped() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    let mut group = SceneNode::group("group")
        .with_child(cube("a", Vec3::ZERO))
        .with_child(cube("b", Vec3::X));
    group.set_visible(false);
    host.add_root(group).unwrap();
    host.add_root(cube("c", -Vec3::X)).unwrap();

    host.render().unwrap();

    assert_eq!(host.statistics().nodes_rendered, 1);
    assert_eq!(recording.draw_calls().len(), 1);
}

#[test]
fn flatten_skip_lands_on_next_sibling() {
    let root = SceneNode::group("root")
        .with_child(
            SceneNode::group("skipped")
                .with_child(SceneNode::group("a").with_child(SceneNode::group("a1")))
                .with_child(SceneNode::group("b")),
        )
        .with_child(SceneNode::group("sibling"));
    let roots = [root];
    let entries = flatten_all(&roots);

    let skipped = entries.iter().position(|entry| entry.node.name() == "skipped").unwrap();
    let next = skip_subtree(&entries, skipped);
    assert_eq!(next - skipped - 1, roots[0].children()[0].subtree_len() - 1);
    assert_eq!(entries[next].node.name(), "sibling");
}

#[test]
fn screen_spaced_group_takes_its_descendants() {
    init_logging();
    let (_, device) = recording_device();
    let effects = helix_render::EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device, effects).unwrap();

    let overlay = SceneNode::new(
        "overlay",
        RenderType::ScreenSpaced,
        ScreenSpacedCore::new(ScreenCorner::BottomLeft, 32),
    )
    .with_child(
        SceneNode::new("axis", RenderType::Opaque, TaggedCore::new(1))
            .with_child(SceneNode::new("label", RenderType::Transparent, TaggedCore::new(2))),
    )
    .with_child(SceneNode::new("cube", RenderType::Opaque, TaggedCore::new(3)));
    let mut roots = vec![
        overlay,
        SceneNode::new("scene", RenderType::Opaque, TaggedCore::new(4)),
    ];
    frame.attach(&mut roots).unwrap();

    let entries = flatten_all(&roots);
    let mut buckets = FrameBuckets::new();
    buckets.bucketize(&entries, false);

    let names: Vec<&str> = buckets.screen_spaced.iter().map(|node| node.name()).collect();
    assert_eq!(names, ["overlay", "axis", "label", "cube"]);
    assert_eq!(buckets.opaque.len(), 1);
    assert_eq!(buckets.opaque[0].name(), "scene");
    assert!(buckets.transparent.is_empty());
}

#[test]
fn frustum_bypass_keeps_order() {
    init_logging();
    let (_, device) = recording_device();
    let effects = helix_render::EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device, effects).unwrap();
    let mut roots = common::tagged_nodes(16);
    frame.attach(&mut roots).unwrap();

    let entries = flatten_all(&roots);
    let mut buckets = FrameBuckets::new();
    buckets.bucketize(&entries, false);
    classify_frustum(&mut buckets, &frame.context().frustum, false);

    let ids = |nodes: &[&SceneNode]| nodes.iter().map(|node| node.id()).collect::<Vec<_>>();
    assert_eq!(ids(&buckets.opaque_in_frustum), ids(&buckets.opaque));
}

#[test]
fn screen_spaced_overlay_renders_after_scene() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(cube("scene", Vec3::ZERO)).unwrap();
    host.add_root(
        SceneNode::new(
            "gizmo",
            RenderType::ScreenSpaced,
            ScreenSpacedCore::new(ScreenCorner::TopRight, 32),
        )
        .with_child(cube("x", Vec3::X))
        .with_child(cube("y", Vec3::Y)),
    )
    .unwrap();

    host.render().unwrap();

    assert_eq!(host.statistics().nodes_rendered, 3);
    assert_eq!(recording.draw_calls().len(), 3);
}

#[test]
fn border_highlight_runs_outline_passes() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(
        cube("selected", Vec3::ZERO).with_post_effect(PostEffect::border_highlight(Vec4::new(1.0, 0.5, 0.0, 1.0))),
    )
    .unwrap();
    host.add_root(cube("plain", Vec3::X)).unwrap();
    host.add_root(SceneNode::new("outline", RenderType::PostEffect, OutlineCore::new()))
        .unwrap();

    host.render().unwrap();

    let passes = bound_passes(&recording);
    let silhouette = passes
        .iter()
        .position(|pass| *pass == ShaderPassName::EffectOutlineP1)
        .unwrap();
    let vertical = passes
        .iter()
        .position(|pass| *pass == ShaderPassName::EffectBlurVertical)
        .unwrap();
    let composite = passes
        .iter()
        .position(|pass| *pass == ShaderPassName::EffectOutlineP2)
        .unwrap();
    assert!(silhouette < vertical && vertical < composite);
    // Two scene draws, one silhouette and the blur and composite quads.
    assert!(recording.draw_calls().len() >= 5);
}

#[rstest]
#[case::double(true, 2)]
#[case::single(false, 1)]
fn x_ray_pass_count(#[case] double_pass: bool, #[case] expected: usize) {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(cube("hidden", Vec3::ZERO).with_post_effect(PostEffect::x_ray(Vec4::ONE)))
        .unwrap();
    host.add_root(SceneNode::new("x-ray", RenderType::PostEffect, XRayCore::new(double_pass)))
        .unwrap();

    host.render().unwrap();

    let passes = bound_passes(&recording);
    let x_ray = passes
        .iter()
        .filter(|pass| {
            matches!(
                pass,
                ShaderPassName::EffectMeshXRayP1 | ShaderPassName::EffectMeshXRayP2
            )
        })
        .count();
    assert_eq!(x_ray, expected);
}

#[test]
fn missing_effect_pass_is_skipped_at_frame_time() {
    init_logging();
    let (recording, device) = recording_device();
    let effects = helix_render::EffectsManager::builder()
        .with_pass(ShaderPassName::MeshDefault)
        .build(device.as_ref())
        .unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let mut nodes = vec![
        SceneNode::new("tagged", RenderType::Opaque, TaggedCore::new(0))
            .with_post_effect(PostEffect::border_highlight(Vec4::ONE)),
        SceneNode::new("outline", RenderType::PostEffect, OutlineCore::new()),
    ];
    frame.attach(&mut nodes).unwrap();
    let buffers = RenderBuffer::new(device.clone(), 64, 64, 1).unwrap();
    let renderer = ImmediateRenderer::new(&device, 1).unwrap();
    let mut dc = device.create_immediate_context().unwrap();

    let rendered = renderer
        .render_post_proc(
            &frame.context(),
            &[&nodes[1]],
            &[&nodes[0]],
            &buffers,
            &frame.parameter(),
            dc.as_mut(),
        )
        .unwrap();
    dc.flush().unwrap();

    assert_eq!(rendered, 0);
    assert!(recording.draw_calls().is_empty());
    assert!(bound_passes(&recording).is_empty());
}

#[test]
fn refused_pass_fails_start() {
    init_logging();
    let (recording, device) = recording_device();
    recording.refuse_shader_pass(ShaderPassName::EffectOutlineP1);
    let mut host = RenderHost::new(device, RenderConfiguration::default());

    assert_eq!(
        host.start(64, 64),
        Err(RenderError::MissingShaderPass(ShaderPassName::EffectOutlineP1))
    );
    assert!(!host.is_started());
}

#[test]
fn device_lost_restarts_host() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();
    host.render().unwrap();

    recording.lose_device();
    assert_eq!(host.render(), Ok(false));
    assert!(!host.is_started());
    assert!(!host.roots()[0].is_attached());

    recording.restore_device();
    host.start(128, 96).unwrap();
    recording.clear_timeline();
    assert_eq!(host.render(), Ok(true));
    assert!(host.roots()[0].is_attached());
    assert_eq!(recording.draw_calls().len(), 1);
}

#[test]
fn end_releases_device_resources() {
    let (recording, mut host) = started_host(RenderConfiguration {
        msaa: MsaaLevel::Four,
        ..Default::default()
    });
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();
    host.render().unwrap();
    assert!(recording.live_textures() > 0);

    host.end();
    assert_eq!(recording.live_textures(), 0);
    assert_eq!(recording.live_buffers(), 0);
}

#[test]
fn msaa_frame_resolves_into_back_buffer() {
    let (recording, mut host) = started_host(RenderConfiguration {
        msaa: MsaaLevel::Four,
        ..Default::default()
    });
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();
    host.add_root(glass()).unwrap();

    host.render().unwrap();

    let passes = bound_passes(&recording);
    assert_eq!(passes.first(), Some(&ShaderPassName::DepthPrepass));
    assert!(passes.contains(&ShaderPassName::OitComposite));
    let back_buffer = host.back_buffer().unwrap();
    assert!(recording.timeline().iter().any(|command| matches!(
        command,
        RecordedCommand::ResolveTexture { destination, .. } if *destination == back_buffer.view
    )));
}

#[test]
fn parallel_host_runs_update_thread() {
    let updates = Arc::new(AtomicUsize::new(0));
    let (recording, mut host) = started_host(RenderConfiguration {
        enable_parallel_processing: true,
        minimum_draw_calls: 8,
        max_number_of_tasks: 2,
        ..Default::default()
    });
    for tag in 0..20 {
        host.add_root(SceneNode::new(
            format!("node {tag}"),
            RenderType::Opaque,
            TaggedCore::counting(tag, updates.clone()),
        ))
        .unwrap();
    }

    host.render().unwrap();

    assert_eq!(updates.load(Ordering::Relaxed), 20);
    assert_eq!(host.statistics().command_lists, 2);
    assert_eq!(draw_tags(&recording.draw_calls()), (0..20).collect::<Vec<u32>>());
}

#[test]
fn render_order_sorts_opaque_nodes() {
    let (recording, mut host) = started_host(RenderConfiguration {
        enable_render_order: true,
        ..Default::default()
    });
    for (tag, order) in [(0, 3), (1, 1), (2, 2)] {
        host.add_root(
            SceneNode::new(format!("node {tag}"), RenderType::Opaque, TaggedCore::new(tag))
                .with_render_order(order),
        )
        .unwrap();
    }

    host.render().unwrap();

    assert_eq!(draw_tags(&recording.draw_calls()), vec![1, 2, 0]);
}

#[test]
fn outline_composite_masks_the_silhouette() {
    let (recording, mut host) = started_host(RenderConfiguration::default());
    host.add_root(cube("selected", Vec3::ZERO).with_post_effect(PostEffect::border_highlight(Vec4::ONE)))
        .unwrap();
    host.add_root(SceneNode::new("outline", RenderType::PostEffect, OutlineCore::new()))
        .unwrap();

    host.render().unwrap();

    let silhouettes = targets_for_pass(&recording, ShaderPassName::EffectOutlineP1);
    assert_eq!(silhouettes.len(), 1);
    let mask = silhouettes[0].colors[0];
    let blurred = targets_for_pass(&recording, ShaderPassName::EffectBlurHorizontal)
        .last()
        .map(|targets| targets.colors[0])
        .unwrap();
    assert_ne!(blurred, mask);

    // The blur works on a copy; the sharp mask reaches the composite untouched.
    let mask_texture = recording.view_texture(mask).unwrap();
    let copy = texture_copies(&recording)
        .into_iter()
        .find(|(_, source, _)| *source == mask_texture)
        .unwrap();
    assert_eq!(Some(copy.2), recording.view_texture(blurred));
    assert!(copy.0 < first_bind(&recording, ShaderPassName::EffectBlurVertical).unwrap());
    assert_eq!(textures_for_pass(&recording, ShaderPassName::EffectOutlineP2, 0), vec![blurred]);
    assert_eq!(textures_for_pass(&recording, ShaderPassName::EffectOutlineP2, 1), vec![mask]);
}

#[test]
fn fxaa_runs_before_back_buffer_copy() {
    let (recording, mut host) = started_host(RenderConfiguration {
        fxaa_level: FxaaLevel::High,
        ..Default::default()
    });
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();

    host.render().unwrap();

    let fxaa = first_bind(&recording, ShaderPassName::Fxaa).unwrap();
    let copies = texture_copies(&recording);
    assert_eq!(copies.len(), 2);
    let (into_ping_pong, _, ping_pong) = copies[0];
    let (into_back_buffer, filtered, back_buffer) = copies[1];
    assert!(into_ping_pong < fxaa && fxaa < into_back_buffer);
    assert_eq!(back_buffer, host.back_buffer().unwrap().texture);

    let sources = textures_for_pass(&recording, ShaderPassName::Fxaa, 0);
    assert_eq!(sources.len(), 1);
    assert_eq!(recording.view_texture(sources[0]), Some(ping_pong));
    let target = &targets_for_pass(&recording, ShaderPassName::Fxaa)[0];
    assert_eq!(recording.view_texture(target.colors[0]), Some(filtered));
}

#[test]
fn low_feature_level_skips_oit_and_fxaa() {
    init_logging();
    let (recording, device) = recording_device_at(FeatureLevel::Level9_3);
    let mut host = RenderHost::new(
        device,
        RenderConfiguration {
            fxaa_level: FxaaLevel::High,
            oit_mode: OitMode::SinglePassWeighted,
            ..Default::default()
        },
    );
    host.start(128, 96).unwrap();
    host.set_camera(Camera::new(Vec3::new(0.0, 0.0, 6.0), Vec3::ZERO));
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();
    host.add_root(glass()).unwrap();

    host.render().unwrap();

    let passes = bound_passes(&recording);
    for skipped in [
        ShaderPassName::OitWeighted,
        ShaderPassName::OitComposite,
        ShaderPassName::Fxaa,
    ] {
        assert!(!passes.contains(&skipped), "{skipped} ran below 10.0");
    }
    assert!(passes.contains(&ShaderPassName::MeshTransparent));
    assert_eq!(recording.draw_calls().len(), 2);

    let copies = texture_copies(&recording);
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].2, host.back_buffer().unwrap().texture);
}

#[test]
fn depth_peeling_blends_layers_back_to_front() {
    let (recording, mut host) = started_host(RenderConfiguration {
        oit_mode: OitMode::DepthPeeling,
        oit_depth_peeling_layers: 3,
        ..Default::default()
    });
    host.add_root(cube("cube", Vec3::new(0.0, 0.0, -1.0))).unwrap();
    host.add_root(glass()).unwrap();

    host.render().unwrap();

    let peels = targets_for_pass(&recording, ShaderPassName::OitDepthPeeling);
    assert_eq!(peels.len(), 3);
    let layers: Vec<TextureViewHandle> = peels.iter().map(|targets| targets.colors[0]).collect();

    // Every layer re-draws the opaque occluders and reads the depth the
    // previous layer wrote.
    assert_eq!(targets_for_pass(&recording, ShaderPassName::DepthPrepass).len(), 3);
    let reads = textures_for_pass(&recording, ShaderPassName::OitDepthPeeling, 0);
    assert_eq!(reads.len(), 3);
    for layer in 1..3 {
        assert_eq!(reads[layer], peels[layer - 1].colors[1]);
    }

    let blended = textures_for_pass(&recording, ShaderPassName::OitDepthPeelingBlend, 0);
    let back_to_front: Vec<TextureViewHandle> = layers.iter().rev().copied().collect();
    assert_eq!(blended, back_to_front);
    assert!(
        first_bind(&recording, ShaderPassName::OitDepthPeelingBlend)
            > first_bind(&recording, ShaderPassName::OitDepthPeeling)
    );
}

#[rstest]
#[case::lit(true)]
#[case::unlit(false)]
fn directional_light_reaches_light_slot(#[case] render_light: bool) {
    let (recording, mut host) = started_host(RenderConfiguration {
        render_light,
        ..Default::default()
    });
    host.add_root(cube("cube", Vec3::ZERO)).unwrap();
    host.add_root(SceneNode::new(
        "sun",
        RenderType::Light,
        LightCore::new(Light::directional(Vec3::new(1.0, 0.9, 0.8), 2.0)),
    ))
    .unwrap();

    host.render().unwrap();

    let timeline = recording.timeline();
    let bound = |slot: u32| {
        timeline.iter().find_map(|command| match command {
            RecordedCommand::SetConstantBuffer { slot: bound, buffer } if *bound == slot => Some(*buffer),
            _ => None,
        })
    };
    let uploaded = |buffer: BufferHandle| {
        timeline.iter().find_map(|command| match command {
            RecordedCommand::UpdateBuffer { buffer: updated, data, .. } if *updated == buffer => Some(data.clone()),
            _ => None,
        })
    };

    let globals: GlobalUniform = bytemuck::pod_read_unaligned(&uploaded(bound(0).unwrap()).unwrap());
    assert_eq!(globals.frame.x, if render_light { 1.0 } else { 0.0 });

    match bound(LIGHT_SLOT) {
        Some(buffer) => {
            assert!(render_light);
            let data = uploaded(buffer).unwrap();
            let size = std::mem::size_of::<GpuLightData>();
            let sun: GpuLightData = bytemuck::pod_read_unaligned(&data[..size]);
            assert_eq!(sun.kind(), LightKind::Directional as u32 as f32);
            assert_eq!(sun.color_intensity, Vec4::new(1.0, 0.9, 0.8, 2.0));
            assert_eq!(sun.direction_type.truncate(), Vec3::NEG_Z);
            let unused: GpuLightData = bytemuck::pod_read_unaligned(&data[size..2 * size]);
            assert_eq!(unused.color_intensity, Vec4::ZERO);
        }
        None => assert!(!render_light),
    }
}
