#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub use ember_gpu as gpu;
pub use ember_render as render;
pub use glam;

pub use ember_gpu::{
    Backend, Batch, BackendSettings, ClearFlags, Context, ContextStats, Frame, Framebuffer, FramebufferSwapChain,
    GpuError, Pipeline, Primitive, RangeTimer, Shader, State, StateBackend, Texture,
};
pub use ember_gpu::native::{CallLog, NativeCall, RecordingApi, ScriptedCompiler};
pub use ember_render::{
    DeferredSettings, RenderArgs, RenderContext, RenderDeferredTask, RenderItem, RenderItems, Task, TaskBuilder,
    Varying,
};
