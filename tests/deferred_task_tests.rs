//! Render Task Tests
//!
//! Tests for:
//! - Task: job order, enable/disable by name, duplicate names
//! - Range timers: begin/end pairing through a varying, missing ranges
//! - Deferred task: a full frame recorded, replayed and blitted on the
//!   recording backend

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use glam::{IVec4, Mat4, Vec3};

use ember::gpu::native::{CallLog, NativeCall, RecordingApi, ScriptedCompiler};
use ember::gpu::{BackendSettings, Context, Framebuffer, Pipeline, Primitive, RangeTimer, Shader, State, StateBackend};
use ember::render::deferred::{BeginGpuRangeTimer, EndGpuRangeTimer, GpuTimings};
use ember::render::{
    DeferredInputs, DeferredSettings, ItemLayer, RenderArgs, RenderContext, RenderDeferredTask, RenderItem,
    RenderItems, RenderMode, TaskBuilder, Varying,
};

fn shared_context() -> (Arc<Context>, CallLog) {
    let api = RecordingApi::new().with_query_duration(1_000_000);
    let log = api.log();
    let backend = StateBackend::new(api, ScriptedCompiler::new(), BackendSettings::default());
    (Arc::new(Context::new(backend)), log)
}

fn render_context(context: &Arc<Context>, viewport: IVec4) -> RenderContext {
    RenderContext::new(
        context.clone(),
        RenderArgs {
            viewport,
            view: Mat4::from_translation(Vec3::new(0.0, 1.0, 5.0)),
            projection: Mat4::perspective_rh(1.0, viewport.z as f32 / viewport.w as f32, 0.1, 100.0),
            ..Default::default()
        },
    )
}

fn item(shader: &str, vertex_count: u32) -> RenderItem {
    RenderItem::new(
        Pipeline::create(Shader::named(shader), Arc::new(State::new())),
        Primitive::Triangles,
        vertex_count,
    )
}

fn display(size: IVec4) -> Arc<Framebuffer> {
    Framebuffer::create(
        "display",
        size.z as u32,
        size.w as u32,
        &[wgpu::TextureFormat::Rgba8UnormSrgb],
        None,
    )
}

// ============================================================================
// Task Tests
// ============================================================================

#[test]
fn jobs_run_in_build_order() {
    let (context, _) = shared_context();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut builder = TaskBuilder::new("ordered");
    for name in ["first", "second", "third"] {
        let order = order.clone();
        builder.add_job(name, move |_: &mut RenderContext| order.borrow_mut().push(name));
    }
    let mut task = builder.build();

    let mut ctx = render_context(&context, IVec4::new(0, 0, 64, 64));
    task.run(&mut ctx);
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn disabled_jobs_are_skipped() {
    let (context, _) = shared_context();
    let runs = Rc::new(RefCell::new(0));

    let mut builder = TaskBuilder::new("toggled");
    let counter = runs.clone();
    builder.add_disabled_job("count", move |_: &mut RenderContext| *counter.borrow_mut() += 1);
    let mut task = builder.build();
    let mut ctx = render_context(&context, IVec4::new(0, 0, 64, 64));

    task.run(&mut ctx);
    assert_eq!(*runs.borrow(), 0);

    assert!(task.set_enabled("count", true));
    task.run(&mut ctx);
    assert_eq!(*runs.borrow(), 1);

    assert!(!task.set_enabled("missing", true));
    assert_eq!(task.is_enabled("missing"), None);
}

#[test]
fn duplicate_names_resolve_to_the_first_job() {
    let mut builder = TaskBuilder::new("duplicates");
    builder.add_job("pass", |_: &mut RenderContext| {});
    builder.add_job("pass", |_: &mut RenderContext| {});
    let mut task = builder.build();

    assert_eq!(task.job_count(), 2);
    assert!(task.set_enabled("pass", false));
    assert_eq!(task.is_enabled("pass"), Some(false));
}

// ============================================================================
// Range Timer Tests
// ============================================================================

#[test]
fn range_timer_pairs_begin_and_end_through_the_varying() {
    let (context, log) = shared_context();
    let open: Varying<Arc<RangeTimer>> = Varying::new();
    let timings: Varying<GpuTimings> = Varying::new();

    let mut builder = TaskBuilder::new("timed");
    builder.add_job("Begin", BeginGpuRangeTimer::new("Timed", open.clone()));
    builder.add_job("Draw", |ctx: &mut RenderContext| {
        ember::gpu::do_in_batch("draw", &ctx.context, |batch| batch.draw(Primitive::Triangles, 3));
    });
    builder.add_job("End", EndGpuRangeTimer::new(open.clone(), timings.clone()));
    let mut task = builder.build();

    let mut ctx = render_context(&context, IVec4::new(0, 0, 64, 64));
    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    task.run(&mut ctx);
    let frame = context.end_frame();
    context.execute_frame(&frame);

    assert!(!open.is_set());
    assert!(timings.is_set());
    assert_eq!(
        frame.batches().iter().map(|b| b.name()).collect::<Vec<_>>(),
        vec!["BeginGPURangeTimer", "draw", "EndGPURangeTimer"]
    );
    // One pair for the range, one for the frame timer.
    assert_eq!(log.count(|c| matches!(c, NativeCall::BeginTimerQuery(_))), 2);
    assert_eq!(log.count(|c| matches!(c, NativeCall::EndTimerQuery(_))), 2);
}

#[test]
fn range_timer_end_without_begin_records_nothing() {
    let (context, _) = shared_context();
    let timings = Varying::new();
    let mut builder = TaskBuilder::new("unpaired");
    builder.add_job("End", EndGpuRangeTimer::new(Varying::new(), timings.clone()));
    let mut task = builder.build();

    let mut ctx = render_context(&context, IVec4::new(0, 0, 64, 64));
    context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
    task.run(&mut ctx);
    let frame = context.end_frame();

    assert!(frame.batches().is_empty());
    assert!(!timings.is_set());
}

// ============================================================================
// Deferred Task Tests
// ============================================================================

struct DeferredRun {
    context: Arc<Context>,
    log: CallLog,
    outputs: ember::render::DeferredOutputs,
}

fn run_deferred(settings: &DeferredSettings, args: impl FnOnce(&mut RenderArgs), frames: usize) -> DeferredRun {
    let _ = env_logger::builder().is_test(true).try_init();
    let (context, log) = shared_context();

    let items = Varying::with_value(RenderItems {
        opaque: vec![
            item("mesh", 36).with_model(Mat4::from_translation(Vec3::X)),
            item("mesh", 36),
            item("gizmo", 12).with_layer(ItemLayer::InFront),
        ],
        transparent: vec![item("glass", 6)],
        ..Default::default()
    });

    let mut builder = TaskBuilder::new("RenderDeferredTask");
    let outputs = RenderDeferredTask::build(&mut builder, DeferredInputs { items }, settings);
    let mut task = builder.build();

    let viewport = IVec4::new(0, 0, 320, 240);
    let mut ctx = render_context(&context, viewport);
    ctx.args.blit_framebuffer = Some(display(viewport));
    args(&mut ctx.args);
    let base_args = ctx.args.clone();

    for _ in 0..frames {
        ctx.args = base_args.clone();
        context.begin_frame(ctx.args.view, Mat4::IDENTITY);
        task.run(&mut ctx);
        let frame = context.end_frame();
        context.execute_frame(&frame);
        context.recycle_frame(frame);
    }

    DeferredRun { context, log, outputs }
}

#[test]
fn deferred_frame_renders_and_blits() {
    let run = run_deferred(&DeferredSettings::default(), |_| {}, 1);

    assert!(run.outputs.primary.is_set());
    assert!(run.outputs.frame_transform.is_set());
    assert!(run.outputs.deferred.is_set());
    assert!(run.outputs.output.is_set());

    let draws = run.log.filter(NativeCall::is_draw);
    assert!(draws.iter().any(|c| matches!(c, NativeCall::DrawArrays { count: 36, .. })));
    assert!(draws.iter().any(|c| matches!(c, NativeCall::DrawArrays { count: 12, .. })));
    assert!(draws.iter().any(|c| matches!(c, NativeCall::DrawArrays { count: 6, .. })));
    assert_eq!(run.log.count(|c| matches!(c, NativeCall::Blit { .. })), 1);
    assert_eq!(run.context.frame_stats().draw_calls, draws.len() as u64);
}

#[test]
fn deferred_phase_timers_are_balanced() {
    let run = run_deferred(&DeferredSettings::default(), |_| {}, 3);

    assert_eq!(
        run.log.count(|c| matches!(c, NativeCall::BeginTimerQuery(_))),
        run.log.count(|c| matches!(c, NativeCall::EndTimerQuery(_)))
    );
    assert!(run.outputs.timings.opaque.is_set());
    assert!(run.outputs.timings.highlight.is_set());
    assert!(run.outputs.timings.overlays_in_front.is_set());
    assert!(run.outputs.timings.tone_and_post.is_set());
}

#[test]
fn scaled_resolution_is_upsampled_to_the_display() {
    let settings = DeferredSettings {
        resolution_scale: 0.5,
        ..Default::default()
    };
    let run = run_deferred(&settings, |_| {}, 1);

    let output = run.outputs.output.get();
    assert_eq!(output.map(|fb| fb.size()), Some(glam::UVec2::new(320, 240)));
    let primary = run.outputs.primary.get();
    assert_eq!(primary.map(|p| p.framebuffer.size()), Some(glam::UVec2::new(160, 120)));
    assert_eq!(
        run.log
            .count(|c| matches!(c, NativeCall::CreateTexture { label, .. } if label.starts_with("UpsampledFramebuffer"))),
        2
    );
}

#[test]
fn unscaled_resolution_reuses_the_primary_buffer() {
    let run = run_deferred(&DeferredSettings::default(), |_| {}, 1);

    let output = run.outputs.output.get().map(|fb| fb.id());
    let primary = run.outputs.primary.get().map(|p| p.framebuffer.id());
    assert!(output.is_some());
    assert_eq!(output, primary);
}

#[test]
fn mirrored_output_still_blits_once() {
    let run = run_deferred(
        &DeferredSettings::default(),
        |args| args.render_mode = RenderMode::Mirror,
        1,
    );
    assert_eq!(run.log.count(|c| matches!(c, NativeCall::Blit { .. })), 1);
}

#[test]
fn missing_blit_target_skips_the_blit() {
    let run = run_deferred(&DeferredSettings::default(), |args| args.blit_framebuffer = None, 1);
    assert_eq!(run.log.count(|c| matches!(c, NativeCall::Blit { .. })), 0);
    assert!(run.outputs.output.is_set());
}

#[test]
fn deferred_frames_replay_in_a_steady_state() {
    let single = run_deferred(&DeferredSettings::default(), |_| {}, 1);
    let repeated = run_deferred(&DeferredSettings::default(), |_| {}, 4);
    let stats = repeated.context.frame_stats();
    assert!(stats.draw_calls > 0);
    assert_eq!(stats.draw_calls, single.context.frame_stats().draw_calls);
    assert_eq!(stats.vertices, single.context.frame_stats().vertices);
}
