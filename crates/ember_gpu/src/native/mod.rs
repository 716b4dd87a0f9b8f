//! Native Graphics API
//!
//! The backend lowers logical commands onto a [`NativeApi`]: a fixed
//! vocabulary of state-setting, binding and drawing calls whose exact
//! signatures in a real driver are backend-specific. Program compilation is
//! a separate collaborator, the [`ProgramCompiler`].
//!
//! [`RecordingApi`](recording::RecordingApi) implements the trait by logging
//! every call. It backs headless contexts and the test suite.

pub mod recording;

use glam::{IVec4, Vec4};

use crate::batch::{ClearFlags, Primitive};
use crate::errors::Result;
use crate::pipeline::{Shader, StateCommand};
use crate::resources::TextureDesc;

pub use recording::{CallLog, NativeCall, RecordingApi, ScriptedCompiler};

/// Opaque handle of a native object. Zero is the null object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NativeHandle(pub u32);

impl NativeHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Binding limits reported by the native API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeLimits {
    pub max_uniform_buffers: u32,
    pub max_resource_buffers: u32,
    pub max_resource_textures: u32,
}

impl Default for NativeLimits {
    fn default() -> Self {
        Self {
            max_uniform_buffers: 16,
            max_resource_buffers: 16,
            max_resource_textures: 32,
        }
    }
}

/// The native graphics API the backend drives.
///
/// Calls are fire-and-forget: the backend never inspects their outcome,
/// except for object creation and query results.
pub trait NativeApi: Send {
    fn limits(&self) -> NativeLimits {
        NativeLimits::default()
    }

    // Objects
    fn create_buffer(&mut self, size: usize) -> NativeHandle;
    fn upload_buffer(&mut self, buffer: NativeHandle, offset: usize, data: &[u8]);
    fn delete_buffer(&mut self, buffer: NativeHandle);
    fn create_texture(&mut self, desc: &TextureDesc) -> NativeHandle;
    fn delete_texture(&mut self, texture: NativeHandle);
    fn create_framebuffer(&mut self, color: &[NativeHandle], depth_stencil: Option<NativeHandle>) -> NativeHandle;
    fn delete_framebuffer(&mut self, framebuffer: NativeHandle);
    fn create_query(&mut self) -> NativeHandle;
    fn delete_query(&mut self, query: NativeHandle);

    // Pipeline
    fn use_program(&mut self, program: NativeHandle);
    fn apply_state(&mut self, command: &StateCommand);

    // Bindings
    fn bind_uniform_buffer(&mut self, slot: u32, buffer: NativeHandle, offset: usize, size: usize);
    fn unbind_uniform_buffer(&mut self, slot: u32);
    fn bind_resource_buffer(&mut self, slot: u32, buffer: NativeHandle);
    fn unbind_resource_buffer(&mut self, slot: u32);
    fn bind_texture(&mut self, slot: u32, texture: NativeHandle);
    fn unbind_texture(&mut self, slot: u32);
    fn bind_framebuffer(&mut self, framebuffer: NativeHandle);

    // Fixed function
    fn set_viewport(&mut self, viewport: IVec4);
    fn set_depth_range(&mut self, near: f32, far: f32);
    fn set_scissor(&mut self, rect: IVec4);

    // Work
    fn clear(&mut self, flags: ClearFlags, color: Vec4, depth: f32, stencil: i32);
    fn blit(&mut self, source: NativeHandle, source_rect: IVec4, destination: NativeHandle, destination_rect: IVec4);
    fn draw_arrays(&mut self, primitive: Primitive, first: u32, count: u32, instances: u32, first_instance: u32);
    fn draw_elements(&mut self, primitive: Primitive, first: u32, count: u32, instances: u32, first_instance: u32);

    // Queries
    fn begin_timer_query(&mut self, query: NativeHandle);
    fn end_timer_query(&mut self, query: NativeHandle);
    /// Elapsed GPU nanoseconds, `None` while the result is not available.
    fn query_result(&mut self, query: NativeHandle) -> Option<u64>;

    // Debug
    fn push_debug_group(&mut self, _name: &str) {}
    fn pop_debug_group(&mut self) {}
}

/// Result of compiling a shader into a native program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledProgram {
    pub program: NativeHandle,
    /// Variant used when rendering both eyes in one instanced draw.
    pub stereo_program: Option<NativeHandle>,
    /// The program reads the view-correction block at
    /// [`CAMERA_CORRECTION_SLOT`](crate::settings::CAMERA_CORRECTION_SLOT).
    pub camera_correction: bool,
}

/// External shader/program compiler.
pub trait ProgramCompiler: Send {
    fn compile(&mut self, shader: &Shader) -> Result<CompiledProgram>;
}
