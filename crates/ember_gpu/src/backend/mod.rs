//! Backend
//!
//! A [`Backend`] replays batches against a native graphics API. The one
//! implementation, [`StateBackend`], is a state-diffing interpreter: it keeps
//! a [`StateCache`] of what is bound natively and issues a native call only
//! when a command actually changes something.
//!
//! # Replay
//!
//! Each batch is walked twice:
//!
//! ```text
//!  transfer pass                          draw pass
//!  ─────────────                          ─────────
//!  transform commands ──► camera state    transform commands: skipped
//!  draw ──► pre_update: push camera       draw ──► update_transform (cursor)
//!           element, record                       update_pipeline
//!           (command index, offset)               native draw
//!  ─────────────                          everything else: executed
//!  upload camera elements
//! ```
//!
//! Camera state may change several times between draws of one batch, so
//! each draw binds the camera element recorded for its own position in the
//! command stream.
//!
//! # Stages
//!
//! The interpreter is split by binding category, one `impl` block per file:
//!
//! | File                | Commands                                          |
//! |---------------------|---------------------------------------------------|
//! | `pipeline_stage`    | `set_pipeline`, state delta application            |
//! | `transform_stage`   | view, projection, viewport, depth range, jitter   |
//! | `resource_stage`    | uniform buffers, resource buffers and textures    |
//! | `output_stage`      | framebuffers, clears, blits, queries, debug groups |

pub mod cache;
pub mod camera;
mod objects;
mod output_stage;
mod pipeline_stage;
mod resource_stage;
mod transform_stage;

use glam::Mat4;

use crate::batch::{Batch, Command, Primitive};
use crate::frame::StereoState;
use crate::native::{NativeApi, ProgramCompiler};
use crate::settings::{BackendSettings, CAMERA_SLOT};
use crate::stats::ContextStats;

pub use cache::{BoundObject, SlotCache, StateCache, UniformBinding};
pub use camera::{CAMERA_ELEMENT_SIZE, CameraCorrection, CameraElement, TransformCamera};

use objects::NativeObjects;
use output_stage::OutputStageState;
use pipeline_stage::PipelineStageState;
use transform_stage::TransformStageState;

/// Replays batches against a native graphics API.
///
/// A backend is owned by the [`Context`](crate::Context) and only ever used
/// from the rendering thread.
pub trait Backend: Send {
    /// Replays every command of `batch`.
    fn render(&mut self, batch: &Batch);

    /// Stereo configuration used by the next batches.
    fn set_stereo_state(&mut self, stereo: &StereoState);

    /// View correction applied to camera views of the next batches.
    fn set_view_correction(&mut self, correction: Mat4);

    /// Called once per frame before its batches are replayed.
    fn advance_frame(&mut self);

    /// Deletes native objects whose logical resources were dropped.
    /// Returns the number of native objects deleted.
    fn recycle(&mut self) -> usize;

    /// Forgets every binding and restores default fixed-function state.
    fn reset_stages(&mut self);

    fn stats(&self) -> ContextStats;

    fn reset_stats(&mut self);

    fn settings(&self) -> &BackendSettings;

    /// Name and version of the backend, for diagnostics.
    fn version(&self) -> &'static str {
        concat!("ember-state-backend ", env!("CARGO_PKG_VERSION"))
    }
}

/// The state-diffing [`Backend`] over a [`NativeApi`].
pub struct StateBackend<A: NativeApi> {
    api: A,
    compiler: Box<dyn ProgramCompiler>,
    settings: BackendSettings,
    objects: NativeObjects,
    cache: StateCache,

    pipeline: PipelineStageState,
    transform: TransformStageState,
    output: OutputStageState,

    /// Stereo configuration set by the context.
    stereo: StereoState,
    /// Stereo configuration of the batch being replayed.
    batch_stereo: StereoState,
    command_index: usize,
    in_transfer_pass: bool,
    stats: ContextStats,
}

impl<A: NativeApi> std::fmt::Debug for StateBackend<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBackend")
            .field("settings", &self.settings)
            .field("cache", &self.cache)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<A: NativeApi> StateBackend<A> {
    /// Creates a backend. Slot counts of `settings` are narrowed to the
    /// native limits.
    pub fn new(api: A, compiler: impl ProgramCompiler + 'static, settings: BackendSettings) -> Self {
        let settings = settings.clamped_to(&api.limits());
        // The internal camera slots sit above the user range.
        let uniform_slots = settings.max_uniform_buffers.max(CAMERA_SLOT + 1);
        let cache = StateCache::new(
            uniform_slots,
            settings.max_resource_buffers,
            settings.max_resource_textures,
        );
        log::debug!(
            "StateBackend: {} uniform, {} resource buffer, {} texture slots",
            settings.max_uniform_buffers,
            settings.max_resource_buffers,
            settings.max_resource_textures
        );
        Self {
            api,
            compiler: Box::new(compiler),
            transform: TransformStageState::new(settings.camera_buffer_capacity),
            settings,
            objects: NativeObjects::default(),
            cache,
            pipeline: PipelineStageState::new(),
            output: OutputStageState::default(),
            stereo: StereoState::default(),
            batch_stereo: StereoState::default(),
            command_index: 0,
            in_transfer_pass: false,
            stats: ContextStats::default(),
        }
    }

    /// What the backend believes is bound natively.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    #[must_use]
    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    #[inline]
    fn is_stereo(&self) -> bool {
        self.batch_stereo.is_stereo()
    }

    fn render_pass_transfer(&mut self, batch: &Batch) {
        self.in_transfer_pass = true;
        self.transform.begin_transfer();

        for (index, command) in batch.commands().iter().enumerate() {
            self.command_index = index;
            match command {
                c if c.is_draw() => self.pre_update_transform(),
                c if c.is_camera_only() => self.do_command(batch, c),
                Command::SetViewportTransform(_)
                | Command::SetViewCorrectionEnabled(_)
                | Command::SetFramebuffer(_)
                | Command::SetFramebufferSwapChain { .. } => self.do_command(batch, command),
                _ => {}
            }
        }

        self.transfer_transform_state();
        self.in_transfer_pass = false;
    }

    fn render_pass_draw(&mut self, batch: &Batch) {
        for (index, command) in batch.commands().iter().enumerate() {
            self.command_index = index;
            if command.is_camera_only() {
                continue;
            }
            self.do_command(batch, command);
        }
    }

    fn do_command(&mut self, batch: &Batch, command: &Command) {
        match command {
            Command::Draw {
                primitive,
                vertex_count,
                start_vertex,
            } => self.do_draw(*primitive, *vertex_count, *start_vertex, 1, 0, false),
            Command::DrawIndexed {
                primitive,
                index_count,
                start_index,
            } => self.do_draw(*primitive, *index_count, *start_index, 1, 0, true),
            Command::DrawInstanced {
                instance_count,
                primitive,
                vertex_count,
                start_vertex,
                start_instance,
            } => self.do_draw(
                *primitive,
                *vertex_count,
                *start_vertex,
                *instance_count,
                *start_instance,
                false,
            ),
            Command::DrawIndexedInstanced {
                instance_count,
                primitive,
                index_count,
                start_index,
                start_instance,
            } => self.do_draw(
                *primitive,
                *index_count,
                *start_index,
                *instance_count,
                *start_instance,
                true,
            ),

            Command::ClearFramebuffer {
                flags,
                color,
                depth,
                stencil,
                enable_scissor,
            } => self.do_clear_framebuffer(*flags, *color, *depth, *stencil, *enable_scissor),
            Command::Blit {
                source,
                source_rect,
                destination_rect,
            } => {
                let source = batch.framebuffers().get(*source).clone();
                self.do_blit(&source, *source_rect, *destination_rect);
            }
            Command::SetFramebuffer(framebuffer) => {
                let framebuffer = framebuffer.map(|index| batch.framebuffers().get(index).clone());
                self.do_set_framebuffer(framebuffer.as_ref());
            }
            Command::SetFramebufferSwapChain { swap_chain, index } => {
                let framebuffer = batch.swap_chains().get(*swap_chain).get(*index as usize).clone();
                self.do_set_framebuffer(Some(&framebuffer));
            }
            Command::AdvanceSwapChain(swap_chain) => {
                batch.swap_chains().get(*swap_chain).advance();
            }

            Command::SetViewTransform { view, camera } => self.do_set_view_transform(*view, *camera),
            Command::SetProjectionTransform(projection) => self.do_set_projection_transform(*projection),
            Command::SetProjectionJitterEnabled(enabled) => self.do_set_projection_jitter_enabled(*enabled),
            Command::SetProjectionJitterSequence(sequence) => self.do_set_projection_jitter_sequence(sequence),
            Command::SetProjectionJitterScale(scale) => self.do_set_projection_jitter_scale(*scale),
            Command::SetViewportTransform(viewport) => self.do_set_viewport_transform(*viewport),
            Command::SetDepthRangeTransform { near, far } => self.do_set_depth_range_transform(*near, *far),
            Command::SaveViewProjectionTransform(slot) => self.do_save_view_projection_transform(*slot),
            Command::SetSavedViewProjectionTransform(slot) => {
                self.do_set_saved_view_projection_transform(*slot);
            }
            Command::SetViewCorrectionEnabled(enabled) => self.do_set_view_correction_enabled(*enabled),

            Command::SetPipeline(pipeline) => {
                let pipeline = pipeline.map(|index| batch.pipelines().get(index).clone());
                self.do_set_pipeline(pipeline.as_ref());
            }
            Command::SetStateScissorRect(rect) => self.api.set_scissor(*rect),

            Command::SetUniformBuffer {
                slot,
                buffer,
                offset,
                size,
            } => {
                let buffer = buffer.map(|index| batch.buffers().get(index).clone());
                self.do_set_uniform_buffer(*slot, buffer.as_ref(), *offset, *size);
            }
            Command::SetResourceBuffer { slot, buffer } => {
                let buffer = buffer.map(|index| batch.buffers().get(index).clone());
                self.do_set_resource_buffer(*slot, buffer.as_ref());
            }
            Command::SetResourceTexture { slot, texture } => {
                let texture = texture.map(|index| batch.textures().get(index).clone());
                self.do_set_resource_texture(*slot, texture.as_ref());
            }
            Command::SetResourceTextureTable { first_slot, table } => {
                let table = table.map(|index| batch.texture_tables().get(index).clone());
                self.do_set_resource_texture_table(*first_slot, table.as_ref());
            }
            Command::SetResourceFramebufferSwapChainTexture {
                slot,
                swap_chain,
                index,
                render_buffer,
            } => {
                let swap_chain = batch.swap_chains().get(*swap_chain).clone();
                self.do_set_resource_framebuffer_swap_chain_texture(*slot, &swap_chain, *index, *render_buffer);
            }

            Command::BeginQuery(query) => {
                let query = batch.queries().get(*query).clone();
                self.do_begin_query(&query);
            }
            Command::EndQuery(query) => {
                let query = batch.queries().get(*query).clone();
                self.do_end_query(&query);
            }
            Command::PushProfileRange(name) => self.api.push_debug_group(name),
            Command::PopProfileRange => self.api.pop_debug_group(),
        }
    }

    fn do_draw(
        &mut self,
        primitive: Primitive,
        count: u32,
        first: u32,
        instances: u32,
        first_instance: u32,
        indexed: bool,
    ) {
        if self.pipeline.draws_disabled {
            log::trace!("Draw {} dropped: no pipeline bound", self.command_index);
            return;
        }

        self.update_transform(self.command_index);
        self.update_pipeline();

        // Stereo draws render both eyes in one instanced call.
        let api_instances = if self.is_stereo() { instances * 2 } else { instances };
        if indexed {
            self.api
                .draw_elements(primitive, first, count, api_instances, first_instance);
        } else {
            self.api
                .draw_arrays(primitive, first, count, api_instances, first_instance);
        }

        self.stats.draw_calls += 1;
        self.stats.api_draw_calls += 1;
        self.stats.vertices += u64::from(count) * u64::from(api_instances);
        self.stats.triangles += u64::from(primitive.triangle_count(count)) * u64::from(api_instances);
    }
}

impl<A: NativeApi> Backend for StateBackend<A> {
    fn render(&mut self, batch: &Batch) {
        self.batch_stereo = StereoState {
            enabled: self.stereo.enabled && batch.is_stereo_enabled(),
            skybox: batch.is_skybox_enabled(),
            ..self.stereo
        };
        self.transform.skybox = batch.is_skybox_enabled();

        // The draw pass must start from the state the transfer pass saw.
        let correction_enabled = self.transform.view_correction_enabled;
        self.render_pass_transfer(batch);
        self.transform.view_correction_enabled = correction_enabled;

        self.render_pass_draw(batch);
        self.command_index = 0;
    }

    fn set_stereo_state(&mut self, stereo: &StereoState) {
        self.stereo = *stereo;
    }

    fn set_view_correction(&mut self, correction: Mat4) {
        self.do_set_view_correction(correction);
    }

    fn advance_frame(&mut self) {
        self.advance_transform_frame();
        self.poll_queries();
        self.check_open_queries();
    }

    fn recycle(&mut self) -> usize {
        let pipelines = self.recycle_pipelines();
        if pipelines > 0 {
            log::debug!("Dropped {pipelines} pipeline resolutions");
        }
        self.objects.recycle(&mut self.api)
    }

    fn reset_stages(&mut self) {
        self.reset_pipeline_stage();
        self.reset_uniform_stage();
        self.reset_resource_stage();
        self.reset_output_stage();
        self.reset_transform_stage();
    }

    fn stats(&self) -> ContextStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = ContextStats::default();
    }

    fn settings(&self) -> &BackendSettings {
        &self.settings
    }
}

impl<A: NativeApi> Drop for StateBackend<A> {
    fn drop(&mut self) {
        self.release_transform_buffers();
        self.objects.release_all(&mut self.api);
    }
}

