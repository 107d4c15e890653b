//! Frames rendered on a real wgpu device.
//!
//! Every test returns early when no adapter is available, so these pass on
//! machines without a GPU.

#![cfg(feature = "wgpu-backend")]

mod common;

use std::sync::Arc;

use glam::{Vec3, Vec4};
use rstest::rstest;

use common::{cube, init_logging};
use helix_render::backend::RenderDevice;
use helix_render::postprocess::{OutlineCore, PostEffect};
use helix_render::scene::Camera;
use helix_render::{
    FxaaLevel, MsaaLevel, OitMode, RenderConfiguration, RenderHost, RenderType, SceneNode,
    WgpuDevice,
};

fn gpu_device() -> Option<Arc<dyn RenderDevice>> {
    init_logging();
    match WgpuDevice::new() {
        Ok(device) => Some(Arc::new(device)),
        Err(err) => {
            eprintln!("wgpu unavailable, skipping: {err}");
            None
        }
    }
}

#[rstest]
#[case::plain(RenderConfiguration::default())]
#[case::msaa_fxaa(RenderConfiguration {
    msaa: MsaaLevel::Four,
    fxaa_level: FxaaLevel::High,
    ..Default::default()
})]
#[case::depth_peeling(RenderConfiguration {
    oit_mode: OitMode::DepthPeeling,
    oit_depth_peeling_layers: 2,
    ..Default::default()
})]
fn host_renders_frames(#[case] config: RenderConfiguration) {
    let Some(device) = gpu_device() else {
        return;
    };
    let mut host = RenderHost::new(device, config);
    host.start(256, 256).unwrap();
    host.set_camera(Camera::new(Vec3::new(2.0, 2.0, 4.0), Vec3::ZERO));
    host.add_root(
        cube("selected", Vec3::ZERO).with_post_effect(PostEffect::border_highlight(Vec4::new(1.0, 0.0, 0.0, 1.0))),
    )
    .unwrap();
    host.add_root(cube("neighbour", Vec3::new(1.5, 0.0, 0.0))).unwrap();
    host.add_root(SceneNode::new("outline", RenderType::PostEffect, OutlineCore::new()))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(host.render(), Ok(true));
    }
    assert_eq!(host.statistics().frame_count, 3);
    assert!(host.statistics().triangles >= 24);

    host.resize(128, 64).unwrap();
    assert_eq!(host.render(), Ok(true));
    let back_buffer = host.back_buffer().unwrap();
    assert_eq!((back_buffer.width, back_buffer.height), (128, 64));
    host.end();
}

#[test]
fn parallel_recording_on_gpu() {
    let Some(device) = gpu_device() else {
        return;
    };
    let mut host = RenderHost::new(
        device,
        RenderConfiguration {
            enable_parallel_processing: true,
            enable_frustum_test: false,
            minimum_draw_calls: 16,
            max_number_of_tasks: 4,
            ..Default::default()
        },
    );
    host.start(128, 128).unwrap();
    for i in 0..64 {
        let x = (i % 8) as f32 - 4.0;
        let y = (i / 8) as f32 - 4.0;
        host.add_root(cube(&format!("cube {i}"), Vec3::new(x, y, -10.0))).unwrap();
    }

    assert_eq!(host.render(), Ok(true));
    assert_eq!(host.statistics().command_lists, 4);
}
