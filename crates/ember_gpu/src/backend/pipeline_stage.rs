//! Pipeline stage
//!
//! Resolves pipelines into native programs and state command lists, and
//! applies only the difference between the bound state and the next one.
//!
//! Fixed-function state persists natively across program changes. When a
//! new state is flushed, every field the previous states set away from its
//! default but the new state leaves alone is first restored to the default:
//!
//! ```text
//!   touched (cache)   : BLEND | CULL
//!   next signature    : BLEND
//!   reset to default  : CULL            (touched & !next)
//!   touched after     : BLEND
//! ```

use std::sync::{Arc, Weak};

use bytemuck::bytes_of;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::StateBackend;
use super::camera::CameraCorrection;
use crate::errors::Result;
use crate::native::{NativeApi, NativeHandle};
use crate::pipeline::{Pipeline, State, StateCommand, StateSignature};
use crate::resources::{Buffer, ResourceId};
use crate::settings::CAMERA_CORRECTION_SLOT;

/// Fixed-function state lowered to native commands.
#[derive(Debug)]
pub(crate) struct ResolvedState {
    pub id: ResourceId,
    pub signature: StateSignature,
    pub commands: SmallVec<[StateCommand; 8]>,
    pub scissor_enable: bool,
}

impl ResolvedState {
    fn new(state: &State) -> Self {
        Self {
            id: state.id(),
            signature: state.signature(),
            commands: state.commands(),
            scissor_enable: state.data().scissor_enable,
        }
    }
}

/// A pipeline lowered to native objects.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPipeline {
    pub program: NativeHandle,
    pub stereo_program: Option<NativeHandle>,
    pub camera_correction: bool,
    pub state: Arc<ResolvedState>,
}

#[derive(Debug)]
pub(crate) struct PipelineStageState {
    resolved: FxHashMap<ResourceId, (Weak<Pipeline>, ResolvedPipeline)>,
    state: Option<Arc<ResolvedState>>,
    camera_correction: bool,
    invalid_program: bool,
    invalid_state: bool,
    /// Scissor test enable of the state applied natively.
    pub scissor_enable: bool,
    /// Set when the last pipeline failed to resolve and draws are skipped.
    pub draws_disabled: bool,
    identity_correction: Arc<Buffer>,
    view_correction: Arc<Buffer>,
}

impl PipelineStageState {
    pub fn new() -> Self {
        let identity = CameraCorrection::default();
        Self {
            resolved: FxHashMap::default(),
            state: None,
            camera_correction: false,
            invalid_program: false,
            invalid_state: false,
            scissor_enable: false,
            draws_disabled: false,
            identity_correction: Buffer::from_bytes("camera_correction.identity", bytes_of(&identity)),
            view_correction: Buffer::from_bytes("camera_correction", bytes_of(&identity)),
        }
    }

    /// Writes the view-correction block straight into the shadow copy; the
    /// buffer never travels through a frame.
    pub fn write_view_correction(&self, correction: &CameraCorrection) {
        self.view_correction.set_data(bytes_of(correction));
        self.view_correction
            .apply_updates(&self.view_correction.take_pending_updates());
    }
}

impl<A: NativeApi> StateBackend<A> {
    fn resolve_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<ResolvedPipeline> {
        if let Some((_, resolved)) = self.pipeline.resolved.get(&pipeline.id()) {
            return Ok(resolved.clone());
        }

        let compiled = self.compiler.compile(pipeline.shader())?;
        // Pipelines sharing a state object share its resolution.
        let state = self
            .pipeline
            .resolved
            .values()
            .find(|(_, r)| r.state.id == pipeline.state().id())
            .map_or_else(
                || Arc::new(ResolvedState::new(pipeline.state())),
                |(_, r)| r.state.clone(),
            );
        let resolved = ResolvedPipeline {
            program: compiled.program,
            stereo_program: compiled.stereo_program,
            camera_correction: compiled.camera_correction,
            state,
        };
        log::debug!(
            "Resolved pipeline {:?} (shader '{}') to program {:?}",
            pipeline.id(),
            pipeline.shader().name(),
            resolved.program
        );
        self.pipeline
            .resolved
            .insert(pipeline.id(), (Arc::downgrade(pipeline), resolved.clone()));
        Ok(resolved)
    }

    pub(super) fn do_set_pipeline(&mut self, pipeline: Option<&Arc<Pipeline>>) {
        let id = pipeline.map(|p| p.id());
        // Rebinding the last good pipeline after a failed resolve re-enables draws.
        if self.cache.pipeline == id && !self.pipeline.draws_disabled {
            return;
        }

        match pipeline {
            None => {
                self.stats.pipelines_set += 1;
                self.cache.pipeline = None;
                self.cache.program = NativeHandle::NULL;
                self.pipeline.state = None;
                self.pipeline.camera_correction = false;
                self.pipeline.invalid_program = true;
                self.pipeline.invalid_state = true;
                self.pipeline.draws_disabled = false;
            }
            Some(pipeline) => {
                let resolved = match self.resolve_pipeline(pipeline) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        log::warn!("set_pipeline: {err}, keeping the previous pipeline");
                        if self.settings.skip_draws_without_pipeline {
                            self.pipeline.draws_disabled = true;
                        }
                        return;
                    }
                };
                self.stats.pipelines_set += 1;
                self.pipeline.draws_disabled = false;

                let program = match resolved.stereo_program {
                    Some(stereo_program) if self.is_stereo() => stereo_program,
                    _ => resolved.program,
                };
                if self.cache.program != program {
                    self.cache.program = program;
                    self.pipeline.camera_correction = resolved.camera_correction;
                    self.pipeline.invalid_program = true;
                }

                let state_changed = self
                    .pipeline
                    .state
                    .as_ref()
                    .is_none_or(|current| current.id != resolved.state.id);
                if state_changed {
                    self.pipeline.state = Some(resolved.state);
                    self.pipeline.invalid_state = true;
                }

                self.cache.pipeline = Some(pipeline.id());
            }
        }

        if self.pipeline.invalid_program {
            self.api.use_program(self.cache.program);
            if self.pipeline.camera_correction {
                self.bind_camera_correction();
            }
            self.pipeline.invalid_program = false;
        }
    }

    /// Rebinds the correction block at [`CAMERA_CORRECTION_SLOT`], forcing
    /// the bind even when the slot looks up to date.
    fn bind_camera_correction(&mut self) {
        self.cache.uniform_buffers.set(CAMERA_CORRECTION_SLOT, None);
        let buffer = if self.transform.view_correction_enabled {
            self.pipeline.view_correction.clone()
        } else {
            self.pipeline.identity_correction.clone()
        };
        self.bind_uniform_buffer(
            CAMERA_CORRECTION_SLOT,
            &buffer,
            0,
            std::mem::size_of::<CameraCorrection>(),
        );
    }

    /// Flushes pending program and state changes before a draw.
    pub(super) fn update_pipeline(&mut self) {
        if self.pipeline.invalid_program {
            self.api.use_program(self.cache.program);
            self.pipeline.invalid_program = false;
        }

        if self.pipeline.invalid_state {
            match self.pipeline.state.clone() {
                Some(state) => {
                    self.reset_pipeline_state(state.signature);
                    self.cache.touched |= state.signature;
                    for command in &state.commands {
                        self.api.apply_state(command);
                    }
                    self.pipeline.scissor_enable = state.scissor_enable;
                }
                None => {
                    self.reset_pipeline_state(StateSignature::empty());
                    self.pipeline.scissor_enable = false;
                }
            }
            self.pipeline.invalid_state = false;
        }
    }

    /// Restores to default every touched field missing from `next`.
    fn reset_pipeline_state(&mut self, next: StateSignature) {
        let to_reset = self.cache.touched & !next;
        for field in to_reset.iter() {
            if let Some(command) = StateCommand::reset(field) {
                self.api.apply_state(&command);
            }
        }
        self.cache.touched.remove(to_reset);
    }

    pub(super) fn reset_pipeline_stage(&mut self) {
        self.reset_pipeline_state(StateSignature::empty());
        self.pipeline.state = None;
        self.pipeline.camera_correction = false;
        self.pipeline.invalid_program = false;
        self.pipeline.invalid_state = false;
        self.pipeline.scissor_enable = false;
        self.pipeline.draws_disabled = false;
        self.cache.pipeline = None;
        self.cache.program = NativeHandle::NULL;
        self.api.use_program(NativeHandle::NULL);
    }

    /// Drops resolutions of pipelines that no longer exist.
    pub(super) fn recycle_pipelines(&mut self) -> usize {
        let before = self.pipeline.resolved.len();
        self.pipeline
            .resolved
            .retain(|_, (owner, _)| owner.strong_count() > 0);
        before - self.pipeline.resolved.len()
    }

    pub(super) fn do_set_view_correction(&mut self, correction: glam::Mat4) {
        let previous = self.transform.correction;
        self.transform.correction = correction;
        self.transform.correction_inverse = correction.inverse();
        self.pipeline.write_view_correction(&CameraCorrection {
            correction,
            correction_inverse: self.transform.correction_inverse,
            previous_correction: previous,
            previous_correction_inverse: previous.inverse(),
        });
    }
}
