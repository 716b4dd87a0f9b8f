//! Ember render layer
//!
//! A [`Task`] is a fixed list of [`Job`]s built once at startup and run once
//! per rendered view. The [`deferred`] module provides the jobs of the
//! deferred renderer and wires them into a task with
//! [`RenderDeferredTask::build`].

pub mod args;
pub mod deferred;
pub mod settings;
pub mod task;

pub use args::{ItemLayer, RenderArgs, RenderContext, RenderItem, RenderItems, RenderMode};
pub use deferred::{DeferredInputs, DeferredOutputs, PhaseTimings, RenderDeferredTask};
pub use settings::{
    AntialiasingConfig, AntialiasingSetupConfig, DebugMode, DeferredSettings, JITTER_SEQUENCE_LENGTH, JitterMode,
};
pub use task::{Job, Task, TaskBuilder, Varying};
