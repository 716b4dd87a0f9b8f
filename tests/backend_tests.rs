//! Backend Replay Tests
//!
//! Tests for:
//! - Pipeline binding: identity no-op, state restore between pipelines,
//!   failed resolution keeping or dropping draws
//! - Resource binding: cache dedup, release on `None`, out-of-range slots,
//!   swap-chain textures resolved at replay time
//! - Transform stage: viewport, saved slots, projection jitter, stereo draws

use std::sync::Arc;

use glam::{IVec4, Mat4, Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use ember::gpu::native::{CallLog, NativeCall, RecordingApi, ScriptedCompiler};
use ember::gpu::pipeline::{BlendFunction, CullMode, StateCommand};
use ember::gpu::{
    Backend, BackendSettings, Batch, Buffer, Framebuffer, FramebufferSwapChain, NativeHandle, Pipeline, Primitive,
    Shader, State, StateBackend, StateData, StereoState, Texture, TextureDesc,
};

struct Harness {
    backend: StateBackend<RecordingApi>,
    log: CallLog,
    mirror: Arc<Mutex<StateData>>,
    compiler: ScriptedCompiler,
}

fn harness_with(settings: BackendSettings) -> Harness {
    let api = RecordingApi::new();
    let log = api.log();
    let mirror = api.mirror();
    let compiler = ScriptedCompiler::new();
    let backend = StateBackend::new(api, compiler.clone(), settings);
    Harness {
        backend,
        log,
        mirror,
        compiler,
    }
}

fn harness() -> Harness {
    harness_with(BackendSettings::default())
}

fn pipeline(shader: &str, configure: impl FnOnce(&mut State)) -> Arc<Pipeline> {
    let mut state = State::new();
    configure(&mut state);
    Pipeline::create(Shader::named(shader), Arc::new(state))
}

fn texture(label: &str) -> Arc<Texture> {
    Texture::new(TextureDesc::resource(label, wgpu::TextureFormat::Rgba8Unorm, 4, 4))
}

fn count_use_program(log: &CallLog) -> usize {
    log.count(|c| matches!(c, NativeCall::UseProgram(_)))
}

fn count_apply_state(log: &CallLog) -> usize {
    log.count(|c| matches!(c, NativeCall::ApplyState(_)))
}

fn draws(log: &CallLog) -> Vec<NativeCall> {
    log.filter(NativeCall::is_draw)
}

/// Handle the backend allocated for the texture labeled `label`.
fn texture_handle(log: &CallLog, label: &str) -> Option<NativeHandle> {
    log.calls().into_iter().find_map(|call| match call {
        NativeCall::CreateTexture { handle, label: l } if l == label => Some(handle),
        _ => None,
    })
}

// ============================================================================
// Pipeline Stage Tests
// ============================================================================

#[test]
fn setting_the_bound_pipeline_again_is_a_no_op() {
    let mut h = harness();
    let blended = pipeline("blended", |s| s.set_blend_function(BlendFunction::alpha_blending()));

    let mut batch = Batch::new("pipeline");
    batch.set_pipeline(Some(&blended));
    batch.draw(Primitive::Triangles, 3);
    batch.set_pipeline(Some(&blended));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(count_use_program(&h.log), 1);
    assert_eq!(count_apply_state(&h.log), 1);
    assert_eq!(h.backend.stats().pipelines_set, 1);
    assert_eq!(draws(&h.log).len(), 2);
    assert_eq!(h.backend.cache().pipeline, Some(blended.id()));
}

#[test]
fn switching_pipelines_restores_fields_the_next_one_leaves_default() {
    let mut h = harness();
    let culled = pipeline("culled", |s| {
        s.set_blend_function(BlendFunction::alpha_blending());
        s.set_cull_mode(CullMode::Back);
    });
    let blended = pipeline("blended", |s| s.set_blend_function(BlendFunction::alpha_blending()));

    let mut batch = Batch::new("restore");
    batch.set_pipeline(Some(&culled));
    batch.draw(Primitive::Triangles, 3);
    batch.set_pipeline(Some(&blended));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    let mirror = h.mirror.lock();
    assert_eq!(mirror.cull_mode, CullMode::None);
    assert_eq!(mirror.blend_function, BlendFunction::alpha_blending());
    assert_eq!(
        h.log
            .count(|c| *c == NativeCall::ApplyState(StateCommand::CullMode(CullMode::None))),
        1
    );
}

#[test]
fn failed_pipeline_keeps_the_previous_program() {
    let mut h = harness();
    h.compiler.fail("broken");
    let good = pipeline("good", |_| {});
    let broken = pipeline("broken", |_| {});

    let mut batch = Batch::new("fallback");
    batch.set_pipeline(Some(&good));
    batch.set_pipeline(Some(&broken));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(h.backend.cache().pipeline, Some(good.id()));
    assert_eq!(count_use_program(&h.log), 1);
    assert_eq!(draws(&h.log).len(), 1);
}

#[test]
fn failed_pipeline_can_drop_draws_until_the_next_bind() {
    let mut h = harness_with(BackendSettings {
        skip_draws_without_pipeline: true,
        ..Default::default()
    });
    h.compiler.fail("broken");
    let good = pipeline("good", |_| {});
    let broken = pipeline("broken", |_| {});

    let mut batch = Batch::new("skip");
    batch.set_pipeline(Some(&broken));
    batch.draw(Primitive::Triangles, 3);
    batch.set_pipeline(Some(&good));
    batch.draw(Primitive::Triangles, 6);
    h.backend.render(&batch);

    let draws = draws(&h.log);
    assert_eq!(draws.len(), 1);
    assert!(matches!(draws[0], NativeCall::DrawArrays { count: 6, .. }));
}

#[test]
fn rebinding_the_last_good_pipeline_resumes_draws() {
    let mut h = harness_with(BackendSettings {
        skip_draws_without_pipeline: true,
        ..Default::default()
    });
    h.compiler.fail("broken");
    let good = pipeline("good", |_| {});
    let broken = pipeline("broken", |_| {});

    let mut batch = Batch::new("resume");
    batch.set_pipeline(Some(&good));
    batch.draw(Primitive::Triangles, 3);
    batch.set_pipeline(Some(&broken));
    batch.draw(Primitive::Triangles, 4);
    batch.set_pipeline(Some(&good));
    batch.draw(Primitive::Triangles, 6);
    h.backend.render(&batch);

    let counts: Vec<_> = draws(&h.log)
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::DrawArrays { count, .. } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![3, 6]);
    // The program never changed, so it is not reissued.
    assert_eq!(count_use_program(&h.log), 1);
}

#[test]
fn failed_pipeline_is_not_counted_as_set() {
    let mut h = harness();
    h.compiler.fail("broken");
    let good = pipeline("good", |_| {});
    let broken = pipeline("broken", |_| {});

    let mut batch = Batch::new("count");
    batch.set_pipeline(Some(&good));
    batch.set_pipeline(Some(&broken));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(h.backend.stats().pipelines_set, 1);
}

#[test]
fn pipeline_compiles_once_per_shader() {
    let mut h = harness();
    let first = pipeline("shared", |_| {});

    let mut batch = Batch::new("compile");
    batch.set_pipeline(Some(&first));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);
    h.backend.render(&batch);

    assert_eq!(h.compiler.compiled_count(), 1);
}

// ============================================================================
// Resource Stage Tests
// ============================================================================

#[test]
fn texture_is_bound_once_across_draws() {
    let mut h = harness();
    let albedo = texture("albedo");

    let mut batch = Batch::new("textures");
    batch.set_resource_texture(0, Some(&albedo));
    batch.draw(Primitive::Triangles, 3);
    batch.set_resource_texture(0, Some(&albedo));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(h.log.count(|c| matches!(c, NativeCall::BindTexture { slot: 0, .. })), 1);
    assert_eq!(h.backend.stats().textures_bound, 1);
    assert!(h.backend.cache().textures.get(0).is_some());
}

#[test]
fn out_of_range_slots_leave_the_cache_untouched() {
    let mut h = harness();
    let settings = h.backend.settings().clone();
    let albedo = texture("albedo");
    let params = Buffer::new("params", 64);

    let mut batch = Batch::new("out_of_range");
    batch.set_resource_texture(settings.max_resource_textures, Some(&albedo));
    batch.set_resource_buffer(settings.max_resource_buffers, Some(&params));
    batch.set_uniform_buffer(settings.max_uniform_buffers, Some(&params), 0, 0);
    h.backend.render(&batch);

    let cache = h.backend.cache();
    assert_eq!(cache.textures.iter().count(), 0);
    assert_eq!(cache.resource_buffers.iter().count(), 0);
    assert_eq!(cache.uniform_buffers.iter().count(), 0);
    assert_eq!(
        h.log.count(|c| matches!(
            c,
            NativeCall::BindTexture { .. } | NativeCall::BindResourceBuffer { .. } | NativeCall::BindUniformBuffer { .. }
        )),
        0
    );
}

#[test]
fn uniform_buffer_stays_bound_across_batches() {
    let mut h = harness();
    let params = Buffer::from_slice("params", &[Vec4::ONE]);

    let mut batch = Batch::new("uniforms");
    batch.set_uniform_buffer(3, Some(&params), 0, 0);
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);
    h.backend.advance_frame();
    h.log.clear();
    h.backend.render(&batch);

    assert_eq!(
        h.log
            .count(|c| matches!(c, NativeCall::BindUniformBuffer { slot: 3, .. })),
        0
    );
}

#[test]
fn binding_none_releases_the_slot() {
    let mut h = harness();
    let params = Buffer::from_slice("params", &[Vec4::ONE]);
    let storage = Buffer::new("storage", 64);
    let albedo = texture("albedo");

    let mut batch = Batch::new("release");
    batch.set_uniform_buffer(2, Some(&params), 0, 0);
    batch.set_resource_buffer(1, Some(&storage));
    batch.set_resource_texture(4, Some(&albedo));
    batch.draw(Primitive::Triangles, 3);
    batch.set_uniform_buffer(2, None, 0, 0);
    batch.set_resource_buffer(1, None);
    batch.set_resource_texture(4, None);
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(h.log.count(|c| matches!(c, NativeCall::UnbindUniformBuffer(2))), 1);
    assert_eq!(h.log.count(|c| matches!(c, NativeCall::UnbindResourceBuffer(1))), 1);
    assert_eq!(h.log.count(|c| matches!(c, NativeCall::UnbindTexture(4))), 1);
    let cache = h.backend.cache();
    assert!(cache.uniform_buffers.get(2).is_none());
    assert!(cache.resource_buffers.get(1).is_none());
    assert!(cache.textures.get(4).is_none());

    // The same objects are bound again once released.
    h.log.clear();
    let mut rebind = Batch::new("rebind");
    rebind.set_uniform_buffer(2, Some(&params), 0, 0);
    rebind.set_resource_buffer(1, Some(&storage));
    rebind.set_resource_texture(4, Some(&albedo));
    rebind.draw(Primitive::Triangles, 3);
    h.backend.render(&rebind);

    assert_eq!(h.log.count(|c| matches!(c, NativeCall::BindUniformBuffer { slot: 2, .. })), 1);
    assert_eq!(h.log.count(|c| matches!(c, NativeCall::BindResourceBuffer { slot: 1, .. })), 1);
    assert_eq!(h.log.count(|c| matches!(c, NativeCall::BindTexture { slot: 4, .. })), 1);
}

#[test]
fn releasing_an_empty_slot_issues_nothing() {
    let mut h = harness();
    let mut batch = Batch::new("empty");
    batch.set_uniform_buffer(2, None, 0, 0);
    batch.set_resource_texture(4, None);
    h.backend.render(&batch);

    assert_eq!(
        h.log.count(|c| matches!(c, NativeCall::UnbindUniformBuffer(_) | NativeCall::UnbindTexture(_))),
        0
    );
}

#[test]
fn swap_chain_texture_resolves_at_replay() {
    let mut h = harness();
    let format = [wgpu::TextureFormat::Rgba16Float];
    let chain = FramebufferSwapChain::new(vec![
        Framebuffer::create("history_a", 8, 8, &format, None),
        Framebuffer::create("history_b", 8, 8, &format, None),
    ]);

    let mut batch = Batch::new("history");
    batch.set_resource_framebuffer_swap_chain_texture(5, &chain, 0);
    // The front moves after recording, before replay.
    chain.advance();
    h.backend.render(&batch);

    let expected = texture_handle(&h.log, "history_b.color0");
    assert!(expected.is_some());
    let bound: Vec<_> = h
        .log
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::BindTexture { slot: 5, texture } => Some(texture),
            _ => None,
        })
        .collect();
    assert_eq!(bound.len(), 1);
    assert_eq!(Some(bound[0]), expected);
}

#[test]
fn advance_command_rotates_the_chain_during_replay() {
    let mut h = harness();
    let format = [wgpu::TextureFormat::Rgba8Unorm];
    let chain = FramebufferSwapChain::new(vec![
        Framebuffer::create("a", 4, 4, &format, None),
        Framebuffer::create("b", 4, 4, &format, None),
    ]);

    let mut batch = Batch::new("advance");
    batch.advance(&chain);
    assert_eq!(chain.front_index(), 0);
    h.backend.render(&batch);
    assert_eq!(chain.front_index(), 1);
}

// ============================================================================
// Transform Stage Tests
// ============================================================================

#[test]
fn viewport_and_fullscreen_draw() {
    let mut h = harness();
    let quad = pipeline("quad", |_| {});

    let mut batch = Batch::new("fullscreen");
    batch.set_viewport_transform(IVec4::new(0, 0, 800, 600));
    batch.set_pipeline(Some(&quad));
    batch.draw(Primitive::TriangleStrip, 4);
    h.backend.render(&batch);

    assert_eq!(
        h.log.filter(|c| matches!(c, NativeCall::SetViewport(_))),
        vec![NativeCall::SetViewport(IVec4::new(0, 0, 800, 600))]
    );
    assert_eq!(
        draws(&h.log),
        vec![NativeCall::DrawArrays {
            primitive: Primitive::TriangleStrip,
            first: 0,
            count: 4,
            instances: 1,
        }]
    );
}

#[test]
fn saved_slot_restores_view_and_projection() {
    let mut h = harness();
    let view = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
    let projection = Mat4::perspective_rh(1.0, 1.5, 0.1, 100.0);

    let mut batch = Batch::new("saved");
    batch.set_view_transform(view, true);
    batch.set_projection_transform(projection);
    batch.save_view_projection_transform(2);
    batch.set_view_transform(Mat4::IDENTITY, true);
    batch.set_projection_transform(Mat4::IDENTITY);
    batch.set_saved_view_projection_transform(2);
    h.backend.render(&batch);

    assert_eq!(h.backend.saved_view_projection(2), (view, projection));
    assert_eq!(h.backend.view_transform(), view);
    assert_eq!(h.backend.projection_transform(), projection);
}

#[test]
fn saved_slots_past_the_last_share_it() {
    let mut h = harness();
    let view = Mat4::from_translation(Vec3::X);

    let mut batch = Batch::new("clamped");
    batch.set_view_transform(view, true);
    batch.save_view_projection_transform(42);
    h.backend.render(&batch);

    assert_eq!(h.backend.saved_view_projection(5).0, view);
}

#[test]
fn jitter_cycles_one_sample_per_frame() {
    let mut h = harness();
    let sequence = [Vec2::new(0.25, -0.25), Vec2::new(-0.25, 0.25)];
    let target = Framebuffer::create("target", 16, 16, &[wgpu::TextureFormat::Rgba8Unorm], None);

    let mut batch = Batch::new("jitter");
    batch.set_framebuffer(Some(&target));
    batch.set_projection_jitter_sequence(&sequence);
    batch.set_projection_jitter_scale(2.0);
    batch.set_projection_jitter_enabled(true);
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    let first = h.backend.jitter_offset();
    assert!(sequence.iter().any(|s| *s * 2.0 == first));
    h.backend.advance_frame();
    let second = h.backend.jitter_offset();
    assert_ne!(first, second);
    h.backend.advance_frame();
    assert_eq!(h.backend.jitter_offset(), first);
}

#[test]
fn previous_jitter_survives_a_cleared_sequence() {
    let mut h = harness();
    let target = Framebuffer::create("target", 16, 16, &[wgpu::TextureFormat::Rgba8Unorm], None);

    let mut batch = Batch::new("taa");
    batch.set_framebuffer(Some(&target));
    batch.set_projection_jitter_sequence(&[Vec2::new(0.25, -0.25)]);
    batch.set_projection_jitter_scale(2.0);
    batch.set_projection_jitter_enabled(true);
    batch.draw(Primitive::Triangles, 3);
    batch.set_projection_jitter_sequence(&[]);
    h.backend.render(&batch);
    assert_eq!(h.backend.jitter_offset(), Vec2::ZERO);

    h.backend.advance_frame();
    assert_eq!(h.backend.previous_jitter_offset(), Vec2::new(0.5, -0.5));
}

#[test]
fn empty_jitter_sequence_removes_the_offset() {
    let mut h = harness();
    let mut batch = Batch::new("no_jitter");
    batch.set_projection_jitter_sequence(&[Vec2::new(0.5, 0.5)]);
    batch.set_projection_jitter_sequence(&[]);
    h.backend.render(&batch);
    assert_eq!(h.backend.jitter_offset(), Vec2::ZERO);
}

#[test]
fn stereo_draws_double_the_instances() {
    let mut h = harness();
    h.backend.set_stereo_state(&StereoState {
        enabled: true,
        ..Default::default()
    });
    let mesh = pipeline("mesh", |_| {});

    let mut batch = Batch::new("stereo");
    batch.enable_stereo(true);
    batch.set_pipeline(Some(&mesh));
    batch.draw_instanced(3, Primitive::Triangles, 6, 0, 0);
    h.backend.render(&batch);

    assert!(matches!(draws(&h.log)[0], NativeCall::DrawArrays { instances: 6, .. }));
}

#[test]
fn draws_bind_the_camera_block() {
    let mut h = harness();
    let mesh = pipeline("mesh", |_| {});

    let mut batch = Batch::new("camera");
    batch.set_view_transform(Mat4::from_translation(Vec3::Z), true);
    batch.set_pipeline(Some(&mesh));
    batch.draw(Primitive::Triangles, 3);
    h.backend.render(&batch);

    assert_eq!(h.backend.camera_elements().len(), 1);
    assert_eq!(
        h.log
            .count(|c| matches!(c, NativeCall::BindUniformBuffer { slot, .. } if *slot == ember::gpu::CAMERA_SLOT)),
        1
    );
}

#[test]
fn reset_stages_forgets_bindings() {
    let mut h = harness();
    let albedo = texture("albedo");
    let mut batch = Batch::new("reset");
    batch.set_resource_texture(1, Some(&albedo));
    h.backend.render(&batch);
    assert!(h.backend.cache().textures.get(1).is_some());

    h.backend.reset_stages();
    assert!(h.backend.cache().textures.get(1).is_none());
    assert!(h.backend.cache().pipeline.is_none());
}
