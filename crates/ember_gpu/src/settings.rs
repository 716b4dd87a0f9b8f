//! Backend Settings
//!
//! [`BackendSettings`] configures the binding limits and replay behavior of a
//! [`StateBackend`](crate::backend::StateBackend).
//!
//! The slot counts play the role of the maxima a native driver would report.
//! When the native API reports lower limits, [`BackendSettings::clamped_to`]
//! narrows the settings so that every slot the backend accepts can actually
//! be bound.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember_gpu::BackendSettings;
//!
//! let settings = BackendSettings {
//!     max_resource_textures: 16,
//!     ..Default::default()
//! };
//! ```
//!
//! # Defaults
//!
//! | Field                          | Default |
//! |--------------------------------|---------|
//! | `max_uniform_buffers`          | 14      |
//! | `max_resource_buffers`         | 16      |
//! | `max_resource_textures`        | 32      |
//! | `camera_buffer_capacity`       | 256     |
//! | `skip_draws_without_pipeline`  | `false` |

use crate::native::NativeLimits;

/// Uniform slot the backend binds the per-draw camera block to.
pub const CAMERA_SLOT: u32 = 15;

/// Uniform slot reserved for the view-correction block of programs that
/// request camera correction.
pub const CAMERA_CORRECTION_SLOT: u32 = 14;

/// Number of saved view/projection slots a batch can address.
pub const MAX_TRANSFORM_SAVE_SLOT_COUNT: u32 = 6;

/// Configuration of a [`StateBackend`](crate::backend::StateBackend).
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    /// Number of uniform buffer slots batches may address. Slots
    /// [`CAMERA_CORRECTION_SLOT`] and [`CAMERA_SLOT`] are used internally.
    pub max_uniform_buffers: u32,

    /// Number of read-only storage buffer slots.
    pub max_resource_buffers: u32,

    /// Number of texture units.
    pub max_resource_textures: u32,

    /// Initial number of camera elements reserved per replay.
    pub camera_buffer_capacity: usize,

    /// Drop draw calls recorded after a pipeline that failed to resolve,
    /// instead of running them with the previously bound program.
    pub skip_draws_without_pipeline: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            max_uniform_buffers: 14,
            max_resource_buffers: 16,
            max_resource_textures: 32,
            camera_buffer_capacity: 256,
            skip_draws_without_pipeline: false,
        }
    }
}

impl BackendSettings {
    /// Returns a copy whose slot counts do not exceed the native limits.
    #[must_use]
    pub fn clamped_to(&self, limits: &NativeLimits) -> Self {
        Self {
            max_uniform_buffers: self.max_uniform_buffers.min(limits.max_uniform_buffers),
            max_resource_buffers: self.max_resource_buffers.min(limits.max_resource_buffers),
            max_resource_textures: self.max_resource_textures.min(limits.max_resource_textures),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_to_keeps_lower_native_limits() {
        let limits = NativeLimits {
            max_uniform_buffers: 8,
            max_resource_buffers: 64,
            max_resource_textures: 16,
        };
        let settings = BackendSettings::default().clamped_to(&limits);
        assert_eq!(settings.max_uniform_buffers, 8);
        assert_eq!(settings.max_resource_buffers, 16);
        assert_eq!(settings.max_resource_textures, 16);
    }
}
