//! Context & Frame Tests
//!
//! Tests for:
//! - Frame lifecycle: begin/end, batch order, sequence numbers
//! - Buffer writes: applied on consume, once, in production order
//! - Replay across frames: viewport and draw calls, bindings kept between
//!   executed frames
//! - Batch pool: reuse after execution and recycling
//! - Statistics: per-frame deltas, frame timer averages
//! - Stereo: state captured by frames, instanced replay

use std::sync::Arc;

use glam::{IVec4, Mat4, Vec4};

use ember::gpu::native::{CallLog, NativeCall, RecordingApi, ScriptedCompiler};
use ember::gpu::{
    BackendSettings, Buffer, Context, GpuError, Pipeline, Primitive, Shader, State, StateBackend, do_in_batch,
};

fn context_with(api: RecordingApi) -> (Context, CallLog) {
    let log = api.log();
    let backend = StateBackend::new(api, ScriptedCompiler::new(), BackendSettings::default());
    (Context::new(backend), log)
}

fn context() -> (Context, CallLog) {
    context_with(RecordingApi::new())
}

/// Records one frame holding a batch per entry of `draws`, each issuing a
/// single draw of that many vertices.
fn record_frame(context: &Context, draws: &[u32]) -> Arc<ember::gpu::Frame> {
    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    for (i, count) in draws.iter().enumerate() {
        do_in_batch(&format!("batch{i}"), context, |batch| {
            batch.draw(Primitive::Points, *count);
        });
    }
    context.end_frame()
}

fn draw_counts(log: &CallLog) -> Vec<u32> {
    log.calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::DrawArrays { count, .. } => Some(count),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Frame Lifecycle Tests
// ============================================================================

#[test]
fn batches_replay_in_recording_order() {
    let (context, log) = context();
    let frame = record_frame(&context, &[1, 2, 3]);
    assert_eq!(frame.batches().len(), 3);

    context.execute_frame(&frame);
    assert_eq!(draw_counts(&log), vec![1, 2, 3]);
    assert!(frame.is_consumed());
}

#[test]
fn frame_carries_view_and_pose() {
    let (context, _) = context();
    let view = Mat4::from_rotation_y(0.5);
    let pose = Mat4::from_rotation_x(0.25);
    context.begin_frame(view, pose);
    let frame = context.end_frame();
    assert_eq!(frame.view(), view);
    assert_eq!(frame.pose(), pose);
    assert!(frame.batches().is_empty());
}

#[test]
fn try_end_frame_without_begin_fails() -> anyhow::Result<()> {
    let (context, _) = context();
    assert_eq!(context.try_end_frame().err(), Some(GpuError::NoActiveFrame));
    context.try_begin_frame(Mat4::IDENTITY, Mat4::IDENTITY)?;
    assert!(context.is_recording());
    let frame = context.try_end_frame()?;
    assert_eq!(frame.sequence(), 1);
    assert!(!context.is_recording());
    Ok(())
}

#[test]
fn batch_recorded_outside_a_frame_is_dropped() {
    let (context, log) = context();
    do_in_batch("orphan", &context, |batch| batch.draw(Primitive::Triangles, 3));
    let frame = record_frame(&context, &[]);
    context.execute_frame(&frame);
    assert!(draw_counts(&log).is_empty());
}

// ============================================================================
// Buffer Update Tests
// ============================================================================

#[test]
fn buffer_writes_reach_the_shadow_on_consume() {
    let (context, _) = context();
    let buffer = Buffer::new("params", 4);

    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    buffer.set_sub_data(0, &[1, 2, 3, 4]);
    do_in_batch("upload", &context, |batch| batch.set_uniform_buffer(0, Some(&buffer), 0, 0));
    let frame = context.end_frame();

    assert_eq!(frame.pending_update_count(), 1);
    assert_ne!(buffer.shadow_bytes(), vec![1, 2, 3, 4]);

    context.consume_frame_updates(&frame);
    assert_eq!(buffer.shadow_bytes(), vec![1, 2, 3, 4]);
}

#[test]
fn consuming_a_frame_twice_applies_writes_once() {
    let (context, _) = context();
    let buffer = Buffer::new("params", 4);

    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    buffer.set_sub_data(0, &[5, 6, 7, 8]);
    do_in_batch("upload", &context, |batch| batch.set_resource_buffer(0, Some(&buffer)));
    let frame = context.end_frame();

    context.consume_frame_updates(&frame);
    let version = buffer.shadow_version();
    context.consume_frame_updates(&frame);
    assert_eq!(buffer.shadow_version(), version);
    assert_eq!(frame.pending_update_count(), 0);
}

#[test]
fn frame_order_is_checked_against_the_last_consumed() {
    let (context, _) = context();
    let first = record_frame(&context, &[]);
    let second = record_frame(&context, &[]);

    assert_eq!(
        context.check_frame_order(&second),
        Err(GpuError::FrameOutOfOrder { expected: 1, got: 2 })
    );
    context.consume_frame_updates(&first);
    assert!(context.check_frame_order(&first).is_ok());
    assert!(context.check_frame_order(&second).is_ok());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "production order")]
fn consuming_out_of_order_asserts() {
    let (context, _) = context();
    let _first = record_frame(&context, &[]);
    let second = record_frame(&context, &[]);
    context.consume_frame_updates(&second);
}

// ============================================================================
// Frame Replay Tests
// ============================================================================

#[test]
fn viewport_and_fullscreen_draw_in_consecutive_frames() {
    let (context, log) = context();
    let quad = Pipeline::create(Shader::named("quad"), Arc::new(State::new()));
    let viewport = IVec4::new(0, 0, 800, 600);

    for frame_index in 0..2 {
        log.clear();
        context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
        do_in_batch("fullscreen", &context, |batch| {
            batch.set_viewport_transform(viewport);
            batch.set_pipeline(Some(&quad));
            batch.draw(Primitive::TriangleStrip, 4);
        });
        let frame = context.end_frame();
        context.execute_frame(&frame);
        context.recycle_frame(frame);

        assert_eq!(
            log.filter(|c| matches!(c, NativeCall::SetViewport(_))),
            vec![NativeCall::SetViewport(viewport)]
        );
        assert_eq!(
            log.filter(NativeCall::is_draw),
            vec![NativeCall::DrawArrays {
                primitive: Primitive::TriangleStrip,
                first: 0,
                count: 4,
                instances: 1,
            }]
        );
        let programs = log.count(|c| matches!(c, NativeCall::UseProgram(_)));
        assert_eq!(programs, usize::from(frame_index == 0));
    }
}

#[test]
fn uniform_buffer_is_not_rebound_in_the_next_frame() {
    let (context, log) = context();
    let params = Buffer::from_slice("params", &[Vec4::ONE]);
    let record = |context: &Context| {
        do_in_batch("uniforms", context, |batch| {
            batch.set_uniform_buffer(3, Some(&params), 0, 0);
            batch.draw(Primitive::Triangles, 3);
        });
    };

    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    record(&context);
    let first = context.end_frame();
    context.execute_frame(&first);
    let handle = log.calls().into_iter().find_map(|c| match c {
        NativeCall::BindUniformBuffer { slot: 3, buffer, .. } => Some(buffer),
        _ => None,
    });
    assert!(handle.is_some());

    log.clear();
    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    params.set_sub_slice(0, &[Vec4::ZERO]);
    record(&context);
    let second = context.end_frame();
    context.execute_frame(&second);

    assert_eq!(log.count(|c| matches!(c, NativeCall::BindUniformBuffer { slot: 3, .. })), 0);
    // The write still reaches the bound native buffer.
    assert_eq!(
        log.count(|c| matches!(c, NativeCall::UploadBuffer { buffer, .. } if Some(*buffer) == handle)),
        1
    );
    assert_eq!(params.shadow_bytes(), vec![0u8; 16]);
}

// ============================================================================
// Batch Pool Tests
// ============================================================================

#[test]
fn recycled_frames_return_their_batches() {
    let (context, _) = context();
    let frame = record_frame(&context, &[3, 3]);
    context.execute_frame(&frame);

    let batches = frame.batches().len();
    let pooled = context.pooled_batch_count();
    assert!(context.recycle_frame(frame));
    assert_eq!(context.pooled_batch_count(), pooled + batches);

    let batch = context.acquire_batch("reused");
    assert_eq!(batch.name(), "reused");
    assert!(batch.is_empty());
}

#[test]
fn shared_frames_are_not_recycled() {
    let (context, _) = context();
    let frame = record_frame(&context, &[3]);
    let held = frame.clone();
    let pooled = context.pooled_batch_count();
    assert!(!context.recycle_frame(frame));
    assert_eq!(context.pooled_batch_count(), pooled);
    assert_eq!(held.batches().len(), 1);
}

// ============================================================================
// Statistics Tests
// ============================================================================

#[test]
fn frame_stats_cover_only_the_last_frame() {
    let (context, _) = context();
    let first = record_frame(&context, &[3, 3]);
    context.execute_frame(&first);
    assert_eq!(context.frame_stats().draw_calls, 2);

    let second = record_frame(&context, &[6]);
    context.execute_frame(&second);
    assert_eq!(context.frame_stats().draw_calls, 1);
    assert_eq!(context.frame_stats().vertices, 6);
    assert_eq!(context.stats().draw_calls, 3);

    context.reset_stats();
    assert_eq!(context.stats().draw_calls, 0);
}

#[test]
fn frame_timer_averages_reported_durations() {
    let (context, log) = context_with(RecordingApi::new().with_query_duration(2_000_000));
    for _ in 0..8 {
        let frame = record_frame(&context, &[3]);
        context.execute_frame(&frame);
        context.recycle_frame(frame);
    }

    let average = context.frame_timer_gpu_average();
    assert!(average > 0.0);
    assert!(average <= 2.0);
    assert_eq!(
        log.count(|c| matches!(c, NativeCall::BeginTimerQuery(_))),
        log.count(|c| matches!(c, NativeCall::EndTimerQuery(_)))
    );
}

// ============================================================================
// Stereo Tests
// ============================================================================

#[test]
fn frames_capture_the_stereo_state() {
    let (context, log) = context();
    let projections = [Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0); 2];
    context.enable_stereo(true);
    context.set_stereo_projections(projections);
    assert!(context.is_stereo());

    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    do_in_batch("stereo", &context, |batch| {
        batch.enable_stereo(true);
        batch.draw(Primitive::Triangles, 3);
    });
    let frame = context.end_frame();
    assert!(frame.stereo().is_stereo());
    assert_eq!(frame.stereo().eye_projections, projections);

    context.execute_frame(&frame);
    assert!(
        log.calls()
            .iter()
            .any(|c| matches!(c, NativeCall::DrawArrays { instances: 2, .. }))
    );
}
