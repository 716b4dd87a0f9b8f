//! Ember GPU layer
//!
//! Recording threads describe GPU work as [`Batch`]es of commands and group
//! them into [`Frame`]s through a [`Context`]. The rendering thread replays
//! frames on a [`Backend`], which keeps a cache of the native binding state
//! and issues native calls only for what actually changed.

pub mod backend;
pub mod batch;
pub mod context;
pub mod errors;
pub mod frame;
pub mod native;
pub mod pipeline;
pub mod query;
pub mod resources;
pub mod settings;
pub mod stats;

pub use backend::{Backend, StateBackend, StateCache};
pub use batch::{Batch, ClearFlags, Command, PoolIndex, Primitive};
pub use context::{BatchGuard, Context, FRAME_TIMER_NAME, do_in_batch};
pub use errors::{GpuError, Result};
pub use frame::{Frame, StereoState};
pub use native::{CompiledProgram, NativeApi, NativeHandle, NativeLimits, ProgramCompiler};
pub use pipeline::{Pipeline, Shader, State, StateData, StateSignature};
pub use query::{Query, QueryResult, RangeTimer};
pub use resources::{
    Buffer, BufferView, Framebuffer, FramebufferSwapChain, ResourceId, StructBuffer, Texture, TextureDesc,
    TextureTable, TextureUsageKind,
};
pub use settings::{BackendSettings, CAMERA_CORRECTION_SLOT, CAMERA_SLOT, MAX_TRANSFORM_SAVE_SLOT_COUNT};
pub use stats::{ContextStats, GPU_METRICS, GpuMetrics};
