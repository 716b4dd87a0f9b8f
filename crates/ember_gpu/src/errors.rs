//! Error Types
//!
//! This module defines the error types used by the GPU layer.
//!
//! # Overview
//!
//! The main error type [`GpuError`] covers the failure modes of the
//! recording and replay paths:
//! - Program compilation failures reported by the [`ProgramCompiler`](crate::native::ProgramCompiler)
//! - Binding slots outside the limits of the backend
//! - Frame protocol misuse detected by the non-panicking entry points
//!
//! Most of these are *recoverable*: the backend logs them and keeps
//! replaying the batch. Only the frame protocol has panicking variants
//! ([`Context::begin_frame`](crate::Context::begin_frame) and
//! [`Context::end_frame`](crate::Context::end_frame)).
//!
//! # Usage
//!
//! ```rust,ignore
//! use ember_gpu::errors::{GpuError, Result};
//!
//! fn resolve() -> Result<()> {
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the GPU layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    // ========================================================================
    // Pipeline Resolution
    // ========================================================================
    /// The program compiler rejected a shader.
    #[error("Failed to compile program '{shader}': {reason}")]
    ProgramCompile {
        /// Name of the shader that failed
        shader: String,
        /// Reason reported by the compiler
        reason: String,
    },

    // ========================================================================
    // Binding Errors
    // ========================================================================
    /// A binding slot is outside the range supported by the backend.
    #[error("{stage} slot {slot} is out of range (max {max})")]
    SlotOutOfRange {
        /// Name of the binding stage (e.g. "uniform buffer")
        stage: &'static str,
        /// The requested slot
        slot: u32,
        /// The number of slots available
        max: u32,
    },

    // ========================================================================
    // Frame Protocol
    // ========================================================================
    /// `begin_frame` was called while a frame is already being recorded.
    #[error("A frame is already being recorded")]
    FrameAlreadyActive,

    /// `end_frame` was called without a matching `begin_frame`.
    #[error("No frame is being recorded")]
    NoActiveFrame,

    /// A frame was consumed out of production order.
    #[error("Frame {got} consumed out of order (expected frame {expected})")]
    FrameOutOfOrder {
        /// Sequence number the context expected next
        expected: u64,
        /// Sequence number of the frame that was passed in
        got: u64,
    },

    // ========================================================================
    // Native Objects
    // ========================================================================
    /// The native API failed to provide an object.
    #[error("Native object error: {0}")]
    NativeObject(String),
}

/// Alias for `Result<T, GpuError>`.
pub type Result<T> = std::result::Result<T, GpuError>;
