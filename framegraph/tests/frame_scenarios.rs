use std::sync::Arc;
use std::time::Duration;

use api_types::buffer::BufferDescriptor;
use api_types::command::{PassKind, ResourceCommand, ResourceCommandKind};
use api_types::device::DeviceInterface;
use api_types::handle::ResourceHandle;
use api_types::image::{PixelFormat, TextureDescriptor};
use api_types::queue::QueueKind;
use api_types::usage::{ResourceAccess, ResourceUsageFlags, StageMask, StorageMode};
use framegraph::pass_node::PassNode;
use framegraph::testing::NullDevice;
use framegraph::{FrameGraph, FrameGraphConfig};

fn new_graph(config: FrameGraphConfig) -> (Arc<NullDevice>, FrameGraph) {
    let device = Arc::new(NullDevice::new());
    let dyn_device: Arc<dyn DeviceInterface> = device.clone();
    (device, FrameGraph::new(dyn_device, config))
}

fn storage_buffer(length: u64) -> BufferDescriptor {
    BufferDescriptor::new(
        length,
        StorageMode::Private,
        ResourceUsageFlags::SHADER_READ | ResourceUsageFlags::SHADER_WRITE)
}

fn color_target(width: u32, height: u32) -> TextureDescriptor {
    TextureDescriptor::new_2d(
        PixelFormat::Rgba8Unorm,
        width,
        height,
        ResourceUsageFlags::RENDER_TARGET | ResourceUsageFlags::SHADER_READ,
        StorageMode::Private)
}

fn find_commands<'c>(
    commands: &'c [ResourceCommand],
    mut predicate: impl FnMut(&ResourceCommandKind) -> bool,
) -> Vec<&'c ResourceCommand> {
    commands.iter().filter(|c| predicate(&c.kind)).collect()
}

#[test]
fn zero_pass_frame_submits_nothing() {
    let (device, mut graph) = new_graph(FrameGraphConfig::default());
    let frame = graph.start_frame();
    let report = graph.commit_frame(frame).unwrap();
    assert!(report.submissions.is_empty());
    assert_eq!(report.fence_count, 0);
    assert_eq!(device.submit_count(), 0);
}

#[test]
fn unconsumed_pass_is_culled() {
    let (device, mut graph) = new_graph(FrameGraphConfig::default());
    let mut frame = graph.start_frame();
    let scratch = frame.create_buffer("scratch", storage_buffer(1024));
    frame.add_pass(PassKind::Compute, "dead-end", Box::new(move |recorder| {
        recorder.use_resource(scratch, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.dispatch([8, 8, 1]);
    }));
    let report = graph.commit_frame(frame).unwrap();
    assert_eq!(report.culled_passes, vec!["dead-end".to_string()]);
    assert!(report.submissions.is_empty());
    assert_eq!(report.encoder_count, 0);
    assert_eq!(device.submit_count(), 0);
}

#[test]
fn raw_across_queues_emits_one_fence() {
    let (device, mut graph) = new_graph(FrameGraphConfig::default());
    let x = graph.persistent().allocate_buffer("x", storage_buffer(4096)).unwrap();
    let target = graph.persistent().allocate_texture("target", color_target(640, 480)).unwrap();

    let mut frame = graph.start_frame();
    frame.add_pass(PassKind::Compute, "produce", Box::new(move |recorder| {
        recorder.use_resource(x, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.dispatch([64, 1, 1]);
    }));
    frame.add_pass(PassKind::Graphics, "consume", Box::new(move |recorder| {
        recorder.use_resource(
            x,
            ResourceAccess::READ,
            StageMask::VERTEX | StageMask::FRAGMENT,
            true);
        recorder.use_resource(target, ResourceAccess::RENDER_TARGET, StageMask::FRAGMENT, true);
        recorder.draw(3, 1, 0, 0);
    }));
    let report = graph.commit_frame(frame).unwrap();

    assert_eq!(report.encoder_count, 2);
    assert_eq!(report.fence_count, 1);

    let updates = find_commands(&report.compacted[0], |kind| {
        matches!(kind, ResourceCommandKind::UpdateFence { after_stages, .. }
            if *after_stages == StageMask::COMPUTE)
    });
    assert_eq!(updates.len(), 1);

    let waits = find_commands(&report.compacted[1], |kind| {
        matches!(kind, ResourceCommandKind::WaitFence { before_stages, .. }
            if *before_stages == StageMask::VERTEX | StageMask::FRAGMENT)
    });
    assert_eq!(waits.len(), 1);

    // the producing submission signals the fence, the consuming one waits
    let submits = device.submits.lock().unwrap();
    assert_eq!(submits.len(), 2);
    assert_eq!(submits[0].signals.len(), 1);
    assert_eq!(submits[1].waits.len(), 1);
    assert_eq!(submits[0].signals[0].fence, submits[1].waits[0].fence);
}

#[test]
fn disjoint_transients_share_an_offset() {
    let (_, mut graph) = new_graph(FrameGraphConfig::default());
    let attachment_a = graph.persistent()
        .allocate_texture("rt-a", color_target(256, 256)).unwrap();
    let attachment_b = graph.persistent()
        .allocate_texture("rt-b", color_target(256, 256)).unwrap();
    let sink_a = graph.persistent().allocate_buffer("sink-a", storage_buffer(64)).unwrap();
    let sink_b = graph.persistent().allocate_buffer("sink-b", storage_buffer(64)).unwrap();

    let mut frame = graph.start_frame();
    let t1 = frame.create_buffer("t1", storage_buffer(4 << 20));
    let t2 = frame.create_buffer("t2", storage_buffer(4 << 20));

    // compute passes pinned to the graphics queue alternate with graphics
    // passes so each lands in its own encoder while sharing one arena
    frame.add_pass_node(PassNode::builder("write-t1", PassKind::Compute)
        .queue(QueueKind::Graphics)
        .executor(Box::new(move |recorder| {
            recorder.use_resource(t1, ResourceAccess::WRITE, StageMask::COMPUTE, true);
            recorder.dispatch([1, 1, 1]);
        })));
    frame.add_pass_node(PassNode::builder("read-t1", PassKind::Graphics)
        .attachment(attachment_a)
        .executor(Box::new(move |recorder| {
            recorder.use_resource(t1, ResourceAccess::READ, StageMask::FRAGMENT, true);
            recorder.use_resource(sink_a, ResourceAccess::WRITE, StageMask::FRAGMENT, true);
            recorder.draw(3, 1, 0, 0);
        })));
    frame.add_pass_node(PassNode::builder("write-t2", PassKind::Compute)
        .queue(QueueKind::Graphics)
        .executor(Box::new(move |recorder| {
            recorder.use_resource(t2, ResourceAccess::WRITE, StageMask::COMPUTE, true);
            recorder.dispatch([1, 1, 1]);
        })));
    frame.add_pass_node(PassNode::builder("read-t2", PassKind::Graphics)
        .attachment(attachment_b)
        .executor(Box::new(move |recorder| {
            recorder.use_resource(t2, ResourceAccess::READ, StageMask::FRAGMENT, true);
            recorder.use_resource(sink_b, ResourceAccess::WRITE, StageMask::FRAGMENT, true);
            recorder.draw(3, 1, 0, 0);
        })));

    let report = graph.commit_frame(frame).unwrap();
    assert_eq!(report.encoder_count, 4);
    assert_eq!(report.transient_placements.len(), 2);
    let offset_of = |handle: ResourceHandle| {
        report.transient_placements.iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, offset)| *offset)
            .unwrap()
    };
    assert_eq!(offset_of(t1), offset_of(t2));
}

#[test]
fn many_resources_coalesce_into_one_scoped_barrier() {
    let (_, mut graph) = new_graph(FrameGraphConfig::default());
    let sink = graph.persistent().allocate_buffer("sink", storage_buffer(64)).unwrap();
    let buffers: Vec<ResourceHandle> = (0..10)
        .map(|i| graph.persistent()
            .allocate_buffer(format!("b{}", i).as_str(), storage_buffer(1024))
            .unwrap())
        .collect();

    let mut frame = graph.start_frame();
    let producer_buffers = buffers.clone();
    frame.add_pass(PassKind::Compute, "produce", Box::new(move |recorder| {
        for &buffer in &producer_buffers {
            recorder.use_resource(buffer, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        }
        recorder.dispatch([1, 1, 1]);
    }));
    let consumer_buffers = buffers.clone();
    frame.add_pass_node(PassNode::builder("consume", PassKind::Blit)
        .queue(QueueKind::Compute)
        .executor(Box::new(move |recorder| {
            for &buffer in &consumer_buffers {
                recorder.use_resource(buffer, ResourceAccess::READ, StageMask::BLIT, true);
            }
            recorder.use_resource(sink, ResourceAccess::BLIT_DST, StageMask::BLIT, true);
            recorder.copy_buffer(consumer_buffers[0], 0, sink, 0, 64);
        })));
    let report = graph.commit_frame(frame).unwrap();

    assert_eq!(report.encoder_count, 2);
    let barriers = find_commands(&report.compacted[1], |kind| {
        matches!(kind,
            ResourceCommandKind::ResourceBarrier { .. }
                | ResourceCommandKind::ScopedBarrier { .. })
    });
    assert_eq!(barriers.len(), 1);
    match &barriers[0].kind {
        ResourceCommandKind::ScopedBarrier { scope, .. } => {
            assert!(scope.contains(api_types::usage::BarrierScope::BUFFERS));
        }
        other => panic!("Expected one scoped barrier, got {:?}", other),
    }
}

#[test]
fn identical_frames_produce_identical_compacted_lists() {
    let (_, mut graph) = new_graph(FrameGraphConfig::default());
    let x = graph.persistent().allocate_buffer("x", storage_buffer(4096)).unwrap();
    let y = graph.persistent().allocate_buffer("y", storage_buffer(4096)).unwrap();

    let mut run = |graph: &mut FrameGraph| {
        let mut frame = graph.start_frame();
        frame.add_pass(PassKind::Compute, "produce", Box::new(move |recorder| {
            recorder.use_resource(x, ResourceAccess::WRITE, StageMask::COMPUTE, true);
            recorder.dispatch([16, 1, 1]);
        }));
        frame.add_pass_node(PassNode::builder("consume", PassKind::Blit)
            .queue(QueueKind::Compute)
            .executor(Box::new(move |recorder| {
                recorder.use_resource(x, ResourceAccess::BLIT_SRC, StageMask::BLIT, true);
                recorder.copy_buffer(x, 0, y, 0, 4096);
            })));
        graph.commit_frame(frame).unwrap()
    };

    let first = run(&mut graph);
    let second = run(&mut graph);
    assert_eq!(first.compacted, second.compacted);
}

#[test]
fn retired_arena_purges_after_grace_period() {
    let config = FrameGraphConfig {
        transient_purge_delay: Duration::ZERO,
        ..Default::default()
    };
    let (device, mut graph) = new_graph(config);
    let sink = graph.persistent().allocate_buffer("sink", storage_buffer(64)).unwrap();

    let mut frame = graph.start_frame();
    let t = frame.create_buffer("t", storage_buffer(1 << 20));
    frame.add_pass(PassKind::Compute, "use-t", Box::new(move |recorder| {
        recorder.use_resource(t, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.use_resource(sink, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.dispatch([1, 1, 1]);
    }));
    graph.commit_frame(frame).unwrap();
    let released_before = device.released.lock().unwrap().len();

    // the headless backend completes immediately, so the next retirement
    // sweep sees the frame retired and the zero grace period elapsed
    graph.process_retirements();
    graph.process_retirements();
    let released_after = device.released.lock().unwrap().len();
    assert!(released_after > released_before,
        "Arena heap should have been returned to the OS");
}

#[test]
fn arena_survives_within_grace_period() {
    let (device, mut graph) = new_graph(FrameGraphConfig::default());
    let sink = graph.persistent().allocate_buffer("sink", storage_buffer(64)).unwrap();

    let mut frame = graph.start_frame();
    let t = frame.create_buffer("t", storage_buffer(1 << 20));
    frame.add_pass(PassKind::Compute, "use-t", Box::new(move |recorder| {
        recorder.use_resource(t, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.use_resource(sink, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.dispatch([1, 1, 1]);
    }));
    graph.commit_frame(frame).unwrap();
    graph.process_retirements();
    assert!(device.released.lock().unwrap().is_empty(),
        "Arena must not be purged before the 5 second grace period");
}

#[test]
fn oom_retries_after_retire_then_fails() {
    let (device, mut graph) = new_graph(FrameGraphConfig::default());
    let sink = graph.persistent().allocate_buffer("sink", storage_buffer(64)).unwrap();
    device.allow_materialization.store(false, std::sync::atomic::Ordering::Relaxed);

    let mut frame = graph.start_frame();
    let t = frame.create_buffer("t", storage_buffer(1 << 20));
    frame.add_pass(PassKind::Compute, "use-t", Box::new(move |recorder| {
        recorder.use_resource(t, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.use_resource(sink, ResourceAccess::WRITE, StageMask::COMPUTE, true);
        recorder.dispatch([1, 1, 1]);
    }));
    let result = graph.commit_frame(frame);
    assert!(matches!(result, Err(framegraph::FrameGraphError::OutOfMemory { .. })));
    assert_eq!(device.submit_count(), 0, "An abandoned frame must not submit");
}

#[cfg(debug_assertions)]
#[test]
fn memoryless_crossing_passes_fails_validation() {
    let (_, mut graph) = new_graph(FrameGraphConfig::default());
    let sink = graph.persistent().allocate_buffer("sink", storage_buffer(64)).unwrap();
    let memoryless = graph.persistent().allocate_texture(
        "tile-only",
        TextureDescriptor::new_2d(
            PixelFormat::Rgba8Unorm,
            128,
            128,
            ResourceUsageFlags::RENDER_TARGET | ResourceUsageFlags::INPUT_ATTACHMENT,
            StorageMode::Memoryless)).unwrap();

    let mut frame = graph.start_frame();
    frame.add_pass(PassKind::Graphics, "produce", Box::new(move |recorder| {
        recorder.use_resource(
            memoryless,
            ResourceAccess::RENDER_TARGET,
            StageMask::FRAGMENT,
            true);
        recorder.draw(3, 1, 0, 0);
    }));
    frame.add_pass(PassKind::Graphics, "consume", Box::new(move |recorder| {
        recorder.use_resource(
            memoryless,
            ResourceAccess::INPUT_ATTACHMENT,
            StageMask::FRAGMENT,
            true);
        recorder.use_resource(sink, ResourceAccess::WRITE, StageMask::FRAGMENT, true);
        recorder.draw(3, 1, 0, 0);
    }));
    let result = graph.commit_frame(frame);
    assert!(matches!(result, Err(framegraph::FrameGraphError::ValidationFailure(_))));
}
