//! Parallel recording against the recording backend.
//!
//! Covers the fallback threshold, partition coverage, replay ordering and
//! failure propagation of [`RenderTaskScheduler`].

mod common;

use rstest::rstest;

use common::{draw_tags, init_logging, recording_device, tagged_nodes, Frame, TaggedCore};
use helix_render::backend::{DeferredContextPool, RecordedCommand};
use helix_render::render::{DeferredRenderer, ImmediateRenderer, RenderTaskScheduler, Renderer};
use helix_render::{EffectsManager, RenderError, RenderType, SceneNode};

#[rstest]
#[case::empty(0)]
#[case::below(10)]
#[case::at_threshold(600)]
fn small_batches_are_not_committed(#[case] count: u32) {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let nodes = tagged_nodes(count);
    let refs: Vec<&SceneNode> = nodes.iter().collect();
    let pool = DeferredContextPool::new(device);

    let outcome = RenderTaskScheduler::new(600, 4)
        .schedule_and_run(&refs, &pool, &frame.context(), &frame.parameter(), false)
        .unwrap();

    assert!(!outcome.committed);
    assert!(outcome.command_lists.is_empty());
    assert_eq!(outcome.rendered, 0);
    assert_eq!(recording.deferred_contexts_created(), 0);
}

#[rstest]
#[case(601, 4)]
#[case(1000, 4)]
#[case(1001, 3)]
#[case(700, 1)]
fn large_batches_cover_every_item_once(#[case] count: u32, #[case] tasks: usize) {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let nodes = tagged_nodes(count);
    let refs: Vec<&SceneNode> = nodes.iter().collect();
    let pool = DeferredContextPool::new(device);

    let outcome = RenderTaskScheduler::new(600, tasks)
        .schedule_and_run(&refs, &pool, &frame.context(), &frame.parameter(), false)
        .unwrap();

    assert!(outcome.committed);
    assert_eq!(outcome.command_lists.len(), tasks);
    assert_eq!(outcome.rendered, count as usize);
    assert!(pool.created() <= tasks);
    assert_eq!(pool.available(), pool.created());

    let mut starts: Vec<usize> = outcome.command_lists.iter().map(|(start, _)| *start).collect();
    starts.sort_unstable();
    assert_eq!(starts[0], 0);

    // Nothing reaches the device timeline until replay.
    assert!(draw_tags(&recording.timeline()).is_empty());
}

#[test]
fn replay_matches_sequential_rendering() {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let nodes = tagged_nodes(1203);
    let refs: Vec<&SceneNode> = nodes.iter().collect();
    let ctx = frame.context();
    let parameter = frame.parameter();

    let mut immediate = device.create_immediate_context().unwrap();
    for node in &refs {
        node.render(&ctx, immediate.as_mut()).unwrap();
    }
    immediate.flush().unwrap();
    let sequential = recording.draw_calls();
    recording.clear_timeline();

    let pool = DeferredContextPool::new(device.clone());
    let outcome = RenderTaskScheduler::new(600, 4)
        .schedule_and_run(&refs, &pool, &ctx, &parameter, false)
        .unwrap();
    let rendered = outcome.replay(immediate.as_mut()).unwrap();
    immediate.flush().unwrap();

    assert_eq!(rendered, refs.len());
    assert_eq!(recording.command_lists_executed(), 4);
    let replayed = recording.draw_calls();
    assert_eq!(replayed, sequential);
    assert_eq!(draw_tags(&replayed), (0..1203).collect::<Vec<u32>>());
}

#[test]
fn failing_partition_propagates_and_nothing_is_drawn() {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();

    // 800 items in four partitions of 200; only the third one fails.
    let mut nodes = tagged_nodes(800);
    nodes[450] = SceneNode::new("broken", RenderType::Opaque, TaggedCore::failing(450));
    let refs: Vec<&SceneNode> = nodes.iter().collect();

    let immediate_renderer = ImmediateRenderer::new(&device, 1).unwrap();
    let renderer = DeferredRenderer::new(device.clone(), immediate_renderer);
    let mut dc = device.create_immediate_context().unwrap();

    let result = renderer.render_opaque(&frame.context(), &refs, &frame.parameter(), dc.as_mut(), false);
    assert_eq!(
        result,
        Err(RenderError::Draw("tagged core 450 failed".to_string()))
    );
    dc.flush().unwrap();

    assert!(recording.draw_calls().is_empty());
    assert_eq!(recording.command_lists_executed(), 0);
    // Contexts of every partition went back to the pool.
    assert_eq!(renderer.pool().available(), renderer.pool().created());
}

#[test]
fn deferred_renderer_falls_back_below_threshold() {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let nodes = tagged_nodes(32);
    let refs: Vec<&SceneNode> = nodes.iter().collect();

    let renderer = DeferredRenderer::new(device.clone(), ImmediateRenderer::new(&device, 1).unwrap());
    let mut dc = device.create_immediate_context().unwrap();
    let rendered = renderer
        .render_opaque(&frame.context(), &refs, &frame.parameter(), dc.as_mut(), false)
        .unwrap();
    dc.flush().unwrap();

    assert_eq!(rendered, 32);
    assert_eq!(renderer.last_command_lists(), 0);
    assert_eq!(recording.deferred_contexts_created(), 0);
    assert_eq!(draw_tags(&recording.draw_calls()), (0..32).collect::<Vec<u32>>());
}

#[test]
fn deferred_renderer_restores_targets_after_replay() {
    init_logging();
    let (recording, device) = recording_device();
    let effects = EffectsManager::builder().build(device.as_ref()).unwrap();
    let frame = Frame::new(device.clone(), effects).unwrap();
    let nodes = tagged_nodes(640);
    let refs: Vec<&SceneNode> = nodes.iter().collect();
    let parameter = frame.parameter();

    let renderer = DeferredRenderer::new(device.clone(), ImmediateRenderer::new(&device, 1).unwrap());
    let mut dc = device.create_immediate_context().unwrap();
    renderer
        .render_opaque(&frame.context(), &refs, &parameter, dc.as_mut(), false)
        .unwrap();
    dc.flush().unwrap();

    assert_eq!(renderer.last_command_lists(), frame.config.max_number_of_tasks);
    let timeline = recording.timeline();
    let last_draw = timeline.iter().rposition(|command| command.is_draw()).unwrap();
    assert!(timeline[last_draw..]
        .iter()
        .any(|command| *command == RecordedCommand::SetRenderTargets(parameter.targets())));
}
