//! GPU Context
//!
//! The [`Context`] is the entry point of the GPU layer. Recording threads use
//! it to acquire batches and build frames; the rendering thread uses it to
//! consume and execute them on its [`Backend`].
//!
//! # Frame Protocol
//!
//! ```text
//!  recording thread                         rendering thread
//!  ────────────────                         ────────────────
//!  begin_frame(view, pose)
//!  do_in_batch("pass", |batch| ...)  ×n
//!  end_frame() ──► Arc<Frame> ─────────────► consume_frame_updates(&frame)
//!                                           execute_frame(&frame)
//!                                           recycle_frame(frame)
//! ```
//!
//! Frames must be consumed in the order they were produced: buffer writes
//! are applied to the rendering side as deltas, so skipping a frame would
//! lose them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::Mat4;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::batch::Batch;
use crate::errors::{GpuError, Result};
use crate::frame::{Frame, StereoState};
use crate::query::RangeTimer;
use crate::stats::{ContextStats, GPU_METRICS};

/// Name of the range timer wrapping every executed frame.
pub const FRAME_TIMER_NAME: &str = "gpu::Context::Frame";

/// A batch on loan from the context's pool.
///
/// Dropping the guard returns the batch to the pool; submitting it with
/// [`Context::append_frame_batch`] moves it into the frame instead.
pub struct BatchGuard<'a> {
    context: &'a Context,
    batch: Batch,
    submitted: bool,
}

impl BatchGuard<'_> {
    fn take(mut self) -> Batch {
        self.submitted = true;
        std::mem::take(&mut self.batch)
    }
}

impl Deref for BatchGuard<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        &self.batch
    }
}

impl DerefMut for BatchGuard<'_> {
    fn deref_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if !self.submitted {
            self.context.release_batch(std::mem::take(&mut self.batch));
        }
    }
}

/// Recording and execution entry point of the GPU layer.
pub struct Context {
    backend: Mutex<Box<dyn Backend>>,
    batch_pool: Mutex<Vec<Batch>>,
    recording: Mutex<Option<Frame>>,
    /// Sequence number of the last frame produced.
    produced: AtomicU64,
    /// Sequence number of the last frame consumed, 0 before the first one.
    consumed: AtomicU64,
    stereo: Mutex<StereoState>,
    frame_timer: Mutex<Option<Arc<RangeTimer>>>,
    frame_stats: Mutex<ContextStats>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("produced", &self.produced.load(Ordering::Relaxed))
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .field("pooled_batches", &self.batch_pool.lock().len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(backend: impl Backend + 'static) -> Self {
        log::info!("GPU context created on {}", backend.version());
        Self {
            backend: Mutex::new(Box::new(backend)),
            batch_pool: Mutex::new(Vec::new()),
            recording: Mutex::new(None),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            stereo: Mutex::new(StereoState::default()),
            frame_timer: Mutex::new(None),
            frame_stats: Mutex::new(ContextStats::default()),
        }
    }

    // ========================================================================
    // Batch Pool
    // ========================================================================

    /// Takes a batch from the pool, or allocates one when the pool is empty.
    pub fn acquire_batch(&self, name: &str) -> BatchGuard<'_> {
        let pooled = self.batch_pool.lock().pop();
        let batch = match pooled {
            Some(mut batch) => {
                batch.set_name(name);
                batch
            }
            None => {
                log::trace!("Batch pool empty, allocating '{name}'");
                Batch::new(name)
            }
        };
        BatchGuard {
            context: self,
            batch,
            submitted: false,
        }
    }

    /// Clears `batch` and returns it to the pool.
    pub fn release_batch(&self, mut batch: Batch) {
        batch.clear();
        self.batch_pool.lock().push(batch);
    }

    /// Number of batches waiting in the pool.
    #[must_use]
    pub fn pooled_batch_count(&self) -> usize {
        self.batch_pool.lock().len()
    }

    // ========================================================================
    // Frame Recording
    // ========================================================================

    /// Starts recording a frame.
    ///
    /// # Panics
    ///
    /// Panics if a frame is already being recorded.
    pub fn begin_frame(&self, view: Mat4, pose: Mat4) {
        if let Err(err) = self.try_begin_frame(view, pose) {
            panic!("begin_frame: {err}");
        }
    }

    pub fn try_begin_frame(&self, view: Mat4, pose: Mat4) -> Result<()> {
        let mut recording = self.recording.lock();
        if recording.is_some() {
            return Err(GpuError::FrameAlreadyActive);
        }
        let sequence = self.produced.fetch_add(1, Ordering::AcqRel) + 1;
        *recording = Some(Frame::new(sequence, view, pose));
        drop(recording);

        self.frame_timer
            .lock()
            .get_or_insert_with(|| RangeTimer::new(FRAME_TIMER_NAME));
        Ok(())
    }

    /// True between `begin_frame` and `end_frame`.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.lock().is_some()
    }

    /// Seals the frame being recorded.
    ///
    /// # Panics
    ///
    /// Panics if no frame is being recorded.
    pub fn end_frame(&self) -> Arc<Frame> {
        match self.try_end_frame() {
            Ok(frame) => frame,
            Err(err) => panic!("end_frame: {err}"),
        }
    }

    pub fn try_end_frame(&self) -> Result<Arc<Frame>> {
        let mut frame = self.recording.lock().take().ok_or(GpuError::NoActiveFrame)?;
        frame.set_stereo(*self.stereo.lock());
        frame.finish();
        log::trace!(
            "Frame {} sealed: {} batches, {} buffers updated",
            frame.sequence(),
            frame.batches().len(),
            frame.pending_update_count()
        );
        Ok(Arc::new(frame))
    }

    /// Moves a recorded batch into the current frame.
    ///
    /// Outside of a frame the batch is dropped back into the pool.
    pub fn append_frame_batch(&self, batch: BatchGuard<'_>) {
        let batch = batch.take();
        let mut recording = self.recording.lock();
        match recording.as_mut() {
            Some(frame) => frame.push_batch(batch),
            None => {
                drop(recording);
                log::warn!("append_frame_batch: no frame is being recorded, batch '{}' dropped", batch.name());
                self.release_batch(batch);
            }
        }
    }

    // ========================================================================
    // Frame Execution
    // ========================================================================

    /// Checks that `frame` is the next frame to consume, or the one consumed
    /// last.
    pub fn check_frame_order(&self, frame: &Frame) -> Result<()> {
        let consumed = self.consumed.load(Ordering::Acquire);
        let sequence = frame.sequence();
        if sequence == consumed || sequence == consumed + 1 {
            Ok(())
        } else {
            Err(GpuError::FrameOutOfOrder {
                expected: consumed + 1,
                got: sequence,
            })
        }
    }

    /// Applies the buffer writes of `frame` to the rendering side.
    ///
    /// Consuming a frame twice is a no-op. Consuming out of production order
    /// is a programming error: it asserts in debug builds and is logged in
    /// release builds.
    pub fn consume_frame_updates(&self, frame: &Frame) {
        let order = self.check_frame_order(frame);
        if let Err(err) = &order {
            log::error!("consume_frame_updates: {err}");
        }
        debug_assert!(order.is_ok(), "frames must be consumed in production order");
        self.consumed.fetch_max(frame.sequence(), Ordering::AcqRel);
        let updated = frame.consume_updates();
        if updated > 0 {
            log::trace!("Frame {}: {updated} buffers updated", frame.sequence());
        }
    }

    /// Replays every batch of `frame`, wrapped in the frame timer.
    pub fn execute_frame(&self, frame: &Frame) {
        self.consume_frame_updates(frame);

        let timer = self
            .frame_timer
            .lock()
            .get_or_insert_with(|| RangeTimer::new(FRAME_TIMER_NAME))
            .clone();
        let mut begin_batch = self.acquire_batch("gpu::Context::Frame::begin");
        timer.begin(&mut begin_batch);
        let mut end_batch = self.acquire_batch("gpu::Context::Frame::end");
        timer.end(&mut end_batch);

        {
            let mut backend = self.backend.lock();
            let begin = backend.stats();
            backend.set_stereo_state(frame.stereo());
            backend.advance_frame();

            backend.render(&begin_batch);
            for batch in frame.batches() {
                backend.render(batch);
            }
            backend.render(&end_batch);

            let end = backend.stats();
            *self.frame_stats.lock() = ContextStats::eval_delta(&begin, &end);
        }
    }

    /// Replays a single batch immediately.
    pub fn execute_batch(&self, batch: &Batch) {
        self.backend.lock().render(batch);
    }

    /// Returns the batches of an executed frame to the pool.
    ///
    /// Returns `false`, keeping the batches alive, while other handles to
    /// the frame exist.
    pub fn recycle_frame(&self, frame: Arc<Frame>) -> bool {
        match Arc::try_unwrap(frame) {
            Ok(frame) => {
                for batch in frame.into_batches() {
                    self.release_batch(batch);
                }
                true
            }
            Err(frame) => {
                log::debug!("recycle_frame: frame {} is still shared", frame.sequence());
                false
            }
        }
    }

    /// Deletes native objects whose resources were dropped.
    pub fn recycle(&self) -> usize {
        self.backend.lock().recycle()
    }

    /// Forgets every native binding.
    pub fn reset_stages(&self) {
        self.backend.lock().reset_stages();
    }

    /// Runs `f` with exclusive access to the backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn Backend) -> R) -> R {
        let mut backend = self.backend.lock();
        f(backend.as_mut())
    }

    // ========================================================================
    // Stereo & View Correction
    // ========================================================================

    pub fn enable_stereo(&self, enable: bool) {
        self.stereo.lock().enabled = enable;
    }

    #[must_use]
    pub fn is_stereo(&self) -> bool {
        self.stereo.lock().is_stereo()
    }

    pub fn enable_skybox_stereo(&self, enable: bool) {
        self.stereo.lock().skybox = enable;
    }

    pub fn set_stereo_projections(&self, projections: [Mat4; 2]) {
        self.stereo.lock().eye_projections = projections;
    }

    pub fn set_stereo_views(&self, views: [Mat4; 2]) {
        self.stereo.lock().eye_views = views;
    }

    #[must_use]
    pub fn stereo_projections(&self) -> [Mat4; 2] {
        self.stereo.lock().eye_projections
    }

    #[must_use]
    pub fn stereo_views(&self) -> [Mat4; 2] {
        self.stereo.lock().eye_views
    }

    #[must_use]
    pub fn stereo_state(&self) -> StereoState {
        *self.stereo.lock()
    }

    /// Sets the correction applied to camera views, e.g. the head motion
    /// since the frame was recorded.
    pub fn set_view_correction(&self, correction: Mat4) {
        self.backend.lock().set_view_correction(correction);
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Counters accumulated by the backend since the last reset.
    #[must_use]
    pub fn stats(&self) -> ContextStats {
        self.backend.lock().stats()
    }

    pub fn reset_stats(&self) {
        self.backend.lock().reset_stats();
    }

    /// Counters of the last executed frame.
    #[must_use]
    pub fn frame_stats(&self) -> ContextStats {
        *self.frame_stats.lock()
    }

    /// Average GPU time of recent frames in milliseconds.
    #[must_use]
    pub fn frame_timer_gpu_average(&self) -> f64 {
        self.frame_timer
            .lock()
            .as_ref()
            .map_or(0.0, |timer| timer.gpu_elapsed_average())
    }

    /// Average backend replay time of recent frames in milliseconds.
    #[must_use]
    pub fn frame_timer_batch_average(&self) -> f64 {
        self.frame_timer
            .lock()
            .as_ref()
            .map_or(0.0, |timer| timer.batch_elapsed_average())
    }

    #[must_use]
    pub fn buffer_gpu_count() -> u64 {
        GPU_METRICS.buffer_count.value()
    }

    #[must_use]
    pub fn buffer_gpu_mem_size() -> u64 {
        GPU_METRICS.buffer_memory.value()
    }

    #[must_use]
    pub fn texture_gpu_count() -> u64 {
        GPU_METRICS.texture_count()
    }

    #[must_use]
    pub fn texture_gpu_mem_size() -> u64 {
        GPU_METRICS.texture_memory()
    }

    #[must_use]
    pub fn texture_framebuffer_gpu_mem_size() -> u64 {
        GPU_METRICS.texture_framebuffer_memory.value()
    }

    #[must_use]
    pub fn texture_resource_gpu_mem_size() -> u64 {
        GPU_METRICS.texture_resource_memory.value()
    }

    #[must_use]
    pub fn texture_pending_transfer_gpu_mem_size() -> u64 {
        GPU_METRICS.texture_pending_transfer_memory.value()
    }

    #[must_use]
    pub fn used_gpu_mem_size() -> u64 {
        GPU_METRICS.used_memory()
    }

    #[must_use]
    pub fn free_gpu_mem_size() -> u64 {
        GPU_METRICS.free_memory.value()
    }
}

/// Records a batch with `f` and appends it to the current frame.
pub fn do_in_batch<R>(name: &str, context: &Context, f: impl FnOnce(&mut Batch) -> R) -> R {
    let mut batch = context.acquire_batch(name);
    let result = f(&mut batch);
    context.append_frame_batch(batch);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StateBackend;
    use crate::native::{RecordingApi, ScriptedCompiler};
    use crate::settings::BackendSettings;

    fn context() -> Context {
        let _ = env_logger::builder().is_test(true).try_init();
        Context::new(StateBackend::new(
            RecordingApi::new(),
            ScriptedCompiler::new(),
            BackendSettings::default(),
        ))
    }

    #[test]
    fn released_batches_are_reused() {
        let context = context();
        drop(context.acquire_batch("a"));
        assert_eq!(context.pooled_batch_count(), 1);
        let batch = context.acquire_batch("b");
        assert_eq!(batch.name(), "b");
        assert_eq!(context.pooled_batch_count(), 0);
    }

    #[test]
    fn append_outside_frame_returns_batch_to_pool() {
        let context = context();
        do_in_batch("orphan", &context, |batch| batch.draw(crate::batch::Primitive::Triangles, 3));
        assert_eq!(context.pooled_batch_count(), 1);
    }

    #[test]
    fn try_begin_frame_twice_fails() {
        let context = context();
        context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
        assert_eq!(
            context.try_begin_frame(Mat4::IDENTITY, Mat4::IDENTITY),
            Err(GpuError::FrameAlreadyActive)
        );
        assert!(context.try_end_frame().is_ok());
        assert_eq!(context.try_end_frame().err(), Some(GpuError::NoActiveFrame));
    }

    #[test]
    fn frames_are_numbered_in_production_order() {
        let context = context();
        context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
        let first = context.end_frame();
        context.begin_frame(Mat4::IDENTITY, Mat4::IDENTITY);
        let second = context.end_frame();
        assert_eq!(first.sequence() + 1, second.sequence());
        assert!(context.check_frame_order(&first).is_ok());
        assert!(context.check_frame_order(&second).is_err());
    }
}
