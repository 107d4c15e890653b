use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use glam::Vec3;

use helix_render::backend::{
    DeferredContextPool, DeviceContext, GlobalUniform, GpuBuffer, GpuTexture, RecordingDevice,
    RenderDevice, TextureDescriptor,
};
use helix_render::render::{
    classify_frustum, FrameBuckets, RenderContext, RenderParameter, RenderTaskScheduler,
};
use helix_render::scene::{
    flatten, flatten_all, AttachContext, BoundingBox, Camera, RenderCore, Transform,
};
use helix_render::technique::COLOR_FORMAT;
use helix_render::{EffectsManager, RenderConfiguration, RenderResult, RenderType, SceneNode};

// ---------------------------------------------------------------------------
// Scene fixtures
// ---------------------------------------------------------------------------

struct DrawCore;

impl RenderCore for DrawCore {
    fn attach(&mut self, _ctx: &AttachContext<'_>) -> RenderResult<()> {
        Ok(())
    }

    fn detach(&mut self) {}

    fn render(&self, _ctx: &RenderContext<'_>, dc: &mut dyn DeviceContext) -> RenderResult<()> {
        dc.draw(0..36, 0..1);
        Ok(())
    }
}

/// `groups` groups of `per_group` leaves spread on a grid around the origin
fn grid_scene(groups: usize, per_group: usize) -> Vec<SceneNode> {
    (0..groups)
        .map(|g| {
            let mut group = SceneNode::group(format!("group {g}"));
            for i in 0..per_group {
                let position = Vec3::new((i % 32) as f32 - 16.0, (g % 16) as f32 - 8.0, -((i / 32) as f32));
                let render_type = if i % 5 == 0 {
                    RenderType::Transparent
                } else {
                    RenderType::Opaque
                };
                group.add_child(
                    SceneNode::new(format!("leaf {g}.{i}"), render_type, DrawCore)
                        .with_transform(Transform::from_position(position))
                        .with_bounds(BoundingBox::new(Vec3::splat(-0.5), Vec3::splat(0.5)))
                        .with_render_order((i % 7) as i32),
                );
            }
            group
        })
        .collect()
}

fn attached_scene(device: &Arc<dyn RenderDevice>, effects: &EffectsManager) -> Vec<SceneNode> {
    let mut roots = grid_scene(40, 250);
    let attach = AttachContext { device, effects };
    for root in &mut roots {
        root.attach(&attach).expect("attach");
        root.update(&glam::Mat4::IDENTITY, false);
    }
    roots
}

// ---------------------------------------------------------------------------
// Flatten and bucketize
// ---------------------------------------------------------------------------

fn bench_flatten(c: &mut Criterion) {
    let device: Arc<dyn RenderDevice> = Arc::new(RecordingDevice::new());
    let effects = EffectsManager::builder().build(device.as_ref()).expect("effects");
    let roots = attached_scene(&device, &effects);

    c.bench_function("flatten_10k_nodes", |b| {
        let mut entries = Vec::new();
        b.iter(|| {
            flatten(&roots, |_| true, &mut entries);
            black_box(entries.len());
        });
    });
}

fn bench_bucketize(c: &mut Criterion) {
    let device: Arc<dyn RenderDevice> = Arc::new(RecordingDevice::new());
    let effects = EffectsManager::builder().build(device.as_ref()).expect("effects");
    let roots = attached_scene(&device, &effects);
    let entries = flatten_all(&roots);
    let camera = Camera::new(Vec3::new(0.0, 0.0, 20.0), Vec3::ZERO);
    let frustum = helix_render::scene::BoundingFrustum::from_view_projection(&camera.view_projection_matrix());

    c.bench_function("bucketize_sorted_10k_nodes", |b| {
        let mut buckets = FrameBuckets::new();
        b.iter(|| {
            buckets.bucketize(&entries, true);
            black_box(buckets.len());
        });
    });

    c.bench_function("bucketize_and_cull_10k_nodes", |b| {
        let mut buckets = FrameBuckets::new();
        b.iter(|| {
            buckets.bucketize(&entries, false);
            classify_frustum(&mut buckets, &frustum, true);
            black_box(buckets.opaque_in_frustum.len());
        });
    });
}

// ---------------------------------------------------------------------------
// Parallel recording
// ---------------------------------------------------------------------------

fn bench_schedule(c: &mut Criterion) {
    let recording = RecordingDevice::new();
    let device: Arc<dyn RenderDevice> = Arc::new(recording.clone());
    let effects = EffectsManager::builder().build(device.as_ref()).expect("effects");
    let roots = attached_scene(&device, &effects);
    let entries = flatten_all(&roots);
    let mut buckets = FrameBuckets::new();
    buckets.bucketize(&entries, false);
    let opaque = buckets.opaque.clone();

    let config = RenderConfiguration::default();
    let camera = Camera::default();
    let globals = GpuBuffer::uniform::<GlobalUniform>(&device, "globals").expect("globals");
    let target = GpuTexture::new(&device, TextureDescriptor::render_target("target", 256, 256, COLOR_FORMAT))
        .expect("target");
    let ctx = RenderContext::new(&camera, globals.handle(), &config, &effects, device.feature_level(), 256, 256);
    let parameter = RenderParameter::new(target.view(), None, 256, 256);
    let pool = DeferredContextPool::new(device.clone());

    for tasks in [1, 2, 4] {
        let scheduler = RenderTaskScheduler::new(600, tasks);
        c.bench_function(&format!("schedule_8k_draws_{tasks}_tasks"), |b| {
            b.iter_batched(
                || recording.clear_timeline(),
                |_| {
                    let outcome = scheduler
                        .schedule_and_run(&opaque, &pool, &ctx, &parameter, false)
                        .expect("schedule");
                    black_box(outcome.rendered)
                },
                BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(benches, bench_flatten, bench_bucketize, bench_schedule);
criterion_main!(benches);
