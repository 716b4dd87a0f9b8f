//! Deferred Renderer Settings
//!
//! [`DeferredSettings`] is read once when the deferred task is built. Jobs
//! keep their own copy of the part they use, so changing the settings
//! afterwards means rebuilding the task.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember_render::{AntialiasingSetupConfig, DeferredSettings};
//!
//! let settings = DeferredSettings {
//!     resolution_scale: 0.75,
//!     antialiasing_setup: AntialiasingSetupConfig::paused(3),
//!     ..Default::default()
//! };
//! ```
//!
//! # Defaults
//!
//! | Field                | Default |
//! |----------------------|---------|
//! | `resolution_scale`   | 1.0     |
//! | `render_shadows`     | `true`  |
//! | `background_enabled` | `true`  |
//! | `haze_enabled`       | `true`  |
//! | `bloom_enabled`      | `true`  |
//! | `debug_enabled`      | `false` |
//! | `debug_mode`         | `Albedo`|

/// Number of samples in the jitter sequence.
pub const JITTER_SEQUENCE_LENGTH: usize = 16;

/// Jitter playback of the antialiasing setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterMode {
    /// No jitter is recorded.
    None,
    /// A single sample is repeated every frame.
    Pause,
    /// The whole sequence cycles, one sample per frame.
    #[default]
    Play,
}

/// Buffer shown by the debug pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    #[default]
    Albedo,
    Normal,
    Specular,
    Velocity,
    Lighting,
    LinearDepth,
    Curvature,
    AmbientOcclusion,
}

/// Jitter sequence configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntialiasingSetupConfig {
    /// Multiplier applied to the jitter offsets.
    pub scale: f32,
    /// Repeat the sample at `index` instead of cycling.
    pub freeze: bool,
    /// Record no jitter at all.
    pub stop: bool,
    /// Sample used when frozen, wrapped to the sequence length.
    pub index: usize,
}

impl Default for AntialiasingSetupConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            freeze: false,
            stop: false,
            index: 0,
        }
    }
}

impl AntialiasingSetupConfig {
    #[must_use]
    pub fn paused(index: usize) -> Self {
        Self {
            freeze: true,
            index: index % JITTER_SEQUENCE_LENGTH,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stopped() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mode(&self) -> JitterMode {
        if self.stop {
            JitterMode::None
        } else if self.freeze {
            JitterMode::Pause
        } else {
            JitterMode::Play
        }
    }

    /// Switches to `mode`, resetting the frozen sample to the first one.
    pub fn set_mode(&mut self, mode: JitterMode) {
        self.stop = mode == JitterMode::None;
        self.freeze = mode == JitterMode::Pause;
        self.index = 0;
    }

    /// Cycles None → Pause → Play → None.
    pub fn cycle_mode(&mut self) -> JitterMode {
        let next = match self.mode() {
            JitterMode::None => JitterMode::Pause,
            JitterMode::Pause => JitterMode::Play,
            JitterMode::Play => JitterMode::None,
        };
        self.set_mode(next);
        next
    }

    /// Steps the frozen sample forward, wrapping around the sequence.
    pub fn next_sample(&mut self) -> usize {
        self.index = (self.index + 1) % JITTER_SEQUENCE_LENGTH;
        self.index
    }

    /// Steps the frozen sample backward, wrapping around the sequence.
    pub fn previous_sample(&mut self) -> usize {
        self.index = (self.index + JITTER_SEQUENCE_LENGTH - 1) % JITTER_SEQUENCE_LENGTH;
        self.index
    }
}

/// Temporal antialiasing resolve parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntialiasingConfig {
    /// History blend factor; the shader receives its square.
    pub blend: f32,
    /// Sharpening of the blended result, scaled by a quarter.
    pub sharpen: f32,
    pub covariance_gamma: f32,
    /// Clamp the history to the neighborhood of the current sample.
    pub constrain_color: bool,
    pub feedback_color: bool,
    pub bicubic_history_fetch: bool,
    /// Blend through the debug pipeline that shows the resolve inputs.
    pub debug: bool,
    pub debug_show_velocity_threshold: f32,
}

impl Default for AntialiasingConfig {
    fn default() -> Self {
        Self {
            blend: 0.2,
            sharpen: 0.0,
            covariance_gamma: 1.15,
            constrain_color: true,
            feedback_color: false,
            bicubic_history_fetch: true,
            debug: false,
            debug_show_velocity_threshold: 1.0,
        }
    }
}

/// Configuration of the deferred task.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredSettings {
    /// Scale of the internal render resolution relative to the viewport.
    pub resolution_scale: f32,
    pub antialiasing_setup: AntialiasingSetupConfig,
    pub antialiasing: AntialiasingConfig,
    pub render_shadows: bool,
    pub background_enabled: bool,
    pub haze_enabled: bool,
    pub bloom_enabled: bool,
    /// Adds the debug passes to the task.
    pub debug_enabled: bool,
    pub debug_mode: DebugMode,
}

impl Default for DeferredSettings {
    fn default() -> Self {
        Self {
            resolution_scale: 1.0,
            antialiasing_setup: AntialiasingSetupConfig::default(),
            antialiasing: AntialiasingConfig::default(),
            render_shadows: true,
            background_enabled: true,
            haze_enabled: true,
            bloom_enabled: true,
            debug_enabled: false,
            debug_mode: DebugMode::Albedo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_cycles_through_all_states() {
        let mut config = AntialiasingSetupConfig::default();
        assert_eq!(config.mode(), JitterMode::Play);
        assert_eq!(config.cycle_mode(), JitterMode::None);
        assert!(config.stop);
        assert_eq!(config.cycle_mode(), JitterMode::Pause);
        assert!(config.freeze && !config.stop);
        assert_eq!(config.cycle_mode(), JitterMode::Play);
    }

    #[test]
    fn sample_index_wraps() {
        let mut config = AntialiasingSetupConfig::paused(0);
        assert_eq!(config.previous_sample(), JITTER_SEQUENCE_LENGTH - 1);
        assert_eq!(config.next_sample(), 0);
        assert_eq!(AntialiasingSetupConfig::paused(JITTER_SEQUENCE_LENGTH + 2).index, 2);
    }
}
