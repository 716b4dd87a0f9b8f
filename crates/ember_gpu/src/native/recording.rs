//! A [`NativeApi`] that records calls instead of issuing them.
//!
//! Every call is appended to a shared [`CallLog`] as a [`NativeCall`], and
//! fixed-function state changes are mirrored in a [`StateData`] so that the
//! effective native state can be inspected after replay.
//!
//! ```rust,ignore
//! let api = RecordingApi::new();
//! let log = api.log();
//! let mirror = api.mirror();
//! let mut backend = StateBackend::new(api, ScriptedCompiler::new(), BackendSettings::default());
//! backend.render(&batch);
//! assert_eq!(log.count(|c| matches!(c, NativeCall::DrawArrays { .. })), 1);
//! assert_eq!(mirror.lock().cull_mode, CullMode::None);
//! ```

use std::sync::Arc;

use glam::{IVec4, Vec4};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::{CompiledProgram, NativeApi, NativeHandle, NativeLimits, ProgramCompiler};
use crate::batch::{ClearFlags, Primitive};
use crate::errors::{GpuError, Result};
use crate::pipeline::{Shader, StateCommand, StateData};
use crate::resources::TextureDesc;

/// One recorded native call.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    CreateBuffer { handle: NativeHandle, size: usize },
    UploadBuffer { buffer: NativeHandle, offset: usize, len: usize },
    DeleteBuffer(NativeHandle),
    CreateTexture { handle: NativeHandle, label: String },
    DeleteTexture(NativeHandle),
    CreateFramebuffer(NativeHandle),
    DeleteFramebuffer(NativeHandle),
    CreateQuery(NativeHandle),
    DeleteQuery(NativeHandle),
    UseProgram(NativeHandle),
    ApplyState(StateCommand),
    BindUniformBuffer { slot: u32, buffer: NativeHandle, offset: usize, size: usize },
    UnbindUniformBuffer(u32),
    BindResourceBuffer { slot: u32, buffer: NativeHandle },
    UnbindResourceBuffer(u32),
    BindTexture { slot: u32, texture: NativeHandle },
    UnbindTexture(u32),
    BindFramebuffer(NativeHandle),
    SetViewport(IVec4),
    SetDepthRange { near: f32, far: f32 },
    SetScissor(IVec4),
    Clear { flags: ClearFlags, color: Vec4, depth: f32, stencil: i32 },
    Blit { source: NativeHandle, destination: NativeHandle },
    DrawArrays { primitive: Primitive, first: u32, count: u32, instances: u32 },
    DrawElements { primitive: Primitive, first: u32, count: u32, instances: u32 },
    BeginTimerQuery(NativeHandle),
    EndTimerQuery(NativeHandle),
    PushDebugGroup(String),
    PopDebugGroup,
}

impl NativeCall {
    #[must_use]
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::DrawArrays { .. } | Self::DrawElements { .. })
    }
}

/// Shared, clonable log of native calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<NativeCall>>>);

impl CallLog {
    fn push(&self, call: NativeCall) {
        self.0.lock().push(call);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<NativeCall> {
        self.0.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    #[must_use]
    pub fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.0.lock().iter().filter(|c| predicate(c)).count()
    }

    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&NativeCall) -> bool) -> Vec<NativeCall> {
        self.0.lock().iter().filter(|c| predicate(c)).cloned().collect()
    }
}

/// Records calls into a [`CallLog`] and mirrors fixed-function state.
#[derive(Debug)]
pub struct RecordingApi {
    log: CallLog,
    mirror: Arc<Mutex<StateData>>,
    limits: NativeLimits,
    next_handle: u32,
    query_duration_ns: u64,
}

impl Default for RecordingApi {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingApi {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            mirror: Arc::new(Mutex::new(StateData::default())),
            limits: NativeLimits::default(),
            next_handle: 1,
            query_duration_ns: 0,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: NativeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// GPU time reported by every timer query.
    #[must_use]
    pub fn with_query_duration(mut self, nanoseconds: u64) -> Self {
        self.query_duration_ns = nanoseconds;
        self
    }

    #[must_use]
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    #[must_use]
    pub fn mirror(&self) -> Arc<Mutex<StateData>> {
        self.mirror.clone()
    }

    fn allocate(&mut self) -> NativeHandle {
        let handle = NativeHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl NativeApi for RecordingApi {
    fn limits(&self) -> NativeLimits {
        self.limits
    }

    fn create_buffer(&mut self, size: usize) -> NativeHandle {
        let handle = self.allocate();
        self.log.push(NativeCall::CreateBuffer { handle, size });
        handle
    }

    fn upload_buffer(&mut self, buffer: NativeHandle, offset: usize, data: &[u8]) {
        self.log.push(NativeCall::UploadBuffer {
            buffer,
            offset,
            len: data.len(),
        });
    }

    fn delete_buffer(&mut self, buffer: NativeHandle) {
        self.log.push(NativeCall::DeleteBuffer(buffer));
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> NativeHandle {
        let handle = self.allocate();
        self.log.push(NativeCall::CreateTexture {
            handle,
            label: desc.label.clone(),
        });
        handle
    }

    fn delete_texture(&mut self, texture: NativeHandle) {
        self.log.push(NativeCall::DeleteTexture(texture));
    }

    fn create_framebuffer(&mut self, _color: &[NativeHandle], _depth_stencil: Option<NativeHandle>) -> NativeHandle {
        let handle = self.allocate();
        self.log.push(NativeCall::CreateFramebuffer(handle));
        handle
    }

    fn delete_framebuffer(&mut self, framebuffer: NativeHandle) {
        self.log.push(NativeCall::DeleteFramebuffer(framebuffer));
    }

    fn create_query(&mut self) -> NativeHandle {
        let handle = self.allocate();
        self.log.push(NativeCall::CreateQuery(handle));
        handle
    }

    fn delete_query(&mut self, query: NativeHandle) {
        self.log.push(NativeCall::DeleteQuery(query));
    }

    fn use_program(&mut self, program: NativeHandle) {
        self.log.push(NativeCall::UseProgram(program));
    }

    fn apply_state(&mut self, command: &StateCommand) {
        self.mirror.lock().apply(command);
        self.log.push(NativeCall::ApplyState(*command));
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: NativeHandle, offset: usize, size: usize) {
        self.log.push(NativeCall::BindUniformBuffer {
            slot,
            buffer,
            offset,
            size,
        });
    }

    fn unbind_uniform_buffer(&mut self, slot: u32) {
        self.log.push(NativeCall::UnbindUniformBuffer(slot));
    }

    fn bind_resource_buffer(&mut self, slot: u32, buffer: NativeHandle) {
        self.log
            .push(NativeCall::BindResourceBuffer { slot, buffer });
    }

    fn unbind_resource_buffer(&mut self, slot: u32) {
        self.log.push(NativeCall::UnbindResourceBuffer(slot));
    }

    fn bind_texture(&mut self, slot: u32, texture: NativeHandle) {
        self.log.push(NativeCall::BindTexture { slot, texture });
    }

    fn unbind_texture(&mut self, slot: u32) {
        self.log.push(NativeCall::UnbindTexture(slot));
    }

    fn bind_framebuffer(&mut self, framebuffer: NativeHandle) {
        self.log.push(NativeCall::BindFramebuffer(framebuffer));
    }

    fn set_viewport(&mut self, viewport: IVec4) {
        self.log.push(NativeCall::SetViewport(viewport));
    }

    fn set_depth_range(&mut self, near: f32, far: f32) {
        self.log.push(NativeCall::SetDepthRange { near, far });
    }

    fn set_scissor(&mut self, rect: IVec4) {
        self.log.push(NativeCall::SetScissor(rect));
    }

    fn clear(&mut self, flags: ClearFlags, color: Vec4, depth: f32, stencil: i32) {
        self.log.push(NativeCall::Clear {
            flags,
            color,
            depth,
            stencil,
        });
    }

    fn blit(&mut self, source: NativeHandle, _source_rect: IVec4, destination: NativeHandle, _destination_rect: IVec4) {
        self.log.push(NativeCall::Blit {
            source,
            destination,
        });
    }

    fn draw_arrays(&mut self, primitive: Primitive, first: u32, count: u32, instances: u32, _first_instance: u32) {
        self.log.push(NativeCall::DrawArrays {
            primitive,
            first,
            count,
            instances,
        });
    }

    fn draw_elements(&mut self, primitive: Primitive, first: u32, count: u32, instances: u32, _first_instance: u32) {
        self.log.push(NativeCall::DrawElements {
            primitive,
            first,
            count,
            instances,
        });
    }

    fn begin_timer_query(&mut self, query: NativeHandle) {
        self.log.push(NativeCall::BeginTimerQuery(query));
    }

    fn end_timer_query(&mut self, query: NativeHandle) {
        self.log.push(NativeCall::EndTimerQuery(query));
    }

    fn query_result(&mut self, _query: NativeHandle) -> Option<u64> {
        Some(self.query_duration_ns)
    }

    fn push_debug_group(&mut self, name: &str) {
        self.log.push(NativeCall::PushDebugGroup(name.to_string()));
    }

    fn pop_debug_group(&mut self) {
        self.log.push(NativeCall::PopDebugGroup);
    }
}

// ─── Scripted Compiler ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Script {
    failing: FxHashSet<String>,
    camera_correction: FxHashSet<String>,
    stereo_variants: bool,
    next_program: u32,
    compiled: usize,
}

/// A [`ProgramCompiler`] whose outcome per shader name is scripted.
///
/// Clones share the script, so a test can keep one clone to change the
/// outcome after handing the other to a backend.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompiler(Arc<Mutex<Script>>);

impl ScriptedCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes compilation of `shader` fail until [`succeed`](Self::succeed).
    pub fn fail(&self, shader: &str) {
        self.0.lock().failing.insert(shader.to_string());
    }

    pub fn succeed(&self, shader: &str) {
        self.0.lock().failing.remove(shader);
    }

    /// Programs compiled from `shader` read the view-correction block.
    pub fn require_camera_correction(&self, shader: &str) {
        self.0
            .lock()
            .camera_correction
            .insert(shader.to_string());
    }

    /// Emit a dedicated stereo program next to every mono program.
    pub fn with_stereo_variants(&self, enabled: bool) {
        self.0.lock().stereo_variants = enabled;
    }

    /// Number of successful compilations.
    #[must_use]
    pub fn compiled_count(&self) -> usize {
        self.0.lock().compiled
    }
}

impl ProgramCompiler for ScriptedCompiler {
    fn compile(&mut self, shader: &Shader) -> Result<CompiledProgram> {
        let mut script = self.0.lock();
        if script.failing.contains(shader.name()) {
            return Err(GpuError::ProgramCompile {
                shader: shader.name().to_string(),
                reason: "program not ready".to_string(),
            });
        }
        // Programs live in their own handle range, away from objects.
        script.next_program += 1;
        let program = NativeHandle(0x1000 + script.next_program * 2);
        let stereo_program = script
            .stereo_variants
            .then(|| NativeHandle(program.0 + 1));
        script.compiled += 1;
        Ok(CompiledProgram {
            program,
            stereo_program,
            camera_correction: script.camera_correction.contains(shader.name()),
        })
    }
}
