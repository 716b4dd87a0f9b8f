//! Frames
//!
//! A [`Frame`] is the sealed set of batches recorded between
//! [`Context::begin_frame`](crate::Context::begin_frame) and
//! [`Context::end_frame`](crate::Context::end_frame).
//!
//! # Lifecycle
//!
//! ```text
//!  Idle ──begin_frame──► Recording ──end_frame──► Sealed
//!                                                   │
//!                          consume_frame_updates    ▼
//!                       (idempotent, exactly once)  Consumed ──execute_frame──► Executed (0..n)
//! ```
//!
//! Sealing drains the pending writes of every buffer the batches reference
//! into the frame. Consuming applies them to the buffers' shadow copies; the
//! update list is emptied as it is applied, so consuming twice is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use glam::Mat4;
use parking_lot::Mutex;

use crate::batch::Batch;
use crate::resources::{Buffer, BufferUpdate};

/// Stereo rendering configuration captured by a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoState {
    pub enabled: bool,
    /// Renders the skybox with zero inter-pupillary distance.
    pub skybox: bool,
    /// Eye-to-head transforms, translation only is used.
    pub eye_views: [Mat4; 2],
    pub eye_projections: [Mat4; 2],
}

impl Default for StereoState {
    fn default() -> Self {
        Self {
            enabled: false,
            skybox: false,
            eye_views: [Mat4::IDENTITY; 2],
            eye_projections: [Mat4::IDENTITY; 2],
        }
    }
}

impl StereoState {
    #[inline]
    #[must_use]
    pub fn is_stereo(&self) -> bool {
        self.enabled
    }
}

/// Writes of one buffer drained into a frame.
#[derive(Debug)]
pub struct PendingBufferUpdate {
    pub buffer: Arc<Buffer>,
    pub updates: Vec<BufferUpdate>,
}

/// An immutable snapshot of the batches recorded for one frame.
#[derive(Debug)]
pub struct Frame {
    sequence: u64,
    batches: Vec<Batch>,
    stereo: StereoState,
    view: Mat4,
    pose: Mat4,
    buffer_updates: Mutex<Vec<PendingBufferUpdate>>,
    consumed: AtomicBool,
}

impl Frame {
    pub(crate) fn new(sequence: u64, view: Mat4, pose: Mat4) -> Self {
        Self {
            sequence,
            batches: Vec::new(),
            stereo: StereoState::default(),
            view,
            pose,
            buffer_updates: Mutex::new(Vec::new()),
            consumed: AtomicBool::new(false),
        }
    }

    /// Position of the frame in production order, starting at 1.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    #[must_use]
    pub fn stereo(&self) -> &StereoState {
        &self.stereo
    }

    #[must_use]
    pub fn view(&self) -> Mat4 {
        self.view
    }

    #[must_use]
    pub fn pose(&self) -> Mat4 {
        self.pose
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Number of buffers with writes not yet applied.
    #[must_use]
    pub fn pending_update_count(&self) -> usize {
        self.buffer_updates.lock().len()
    }

    pub(crate) fn push_batch(&mut self, batch: Batch) {
        self.batches.push(batch);
    }

    pub(crate) fn set_stereo(&mut self, stereo: StereoState) {
        self.stereo = stereo;
    }

    /// Seals the frame: drains the pending writes of every referenced buffer.
    pub(crate) fn finish(&mut self) {
        let updates = self.buffer_updates.get_mut();
        for batch in &self.batches {
            for buffer in batch.buffers().iter() {
                let drained = buffer.take_pending_updates();
                if !drained.is_empty() {
                    updates.push(PendingBufferUpdate {
                        buffer: buffer.clone(),
                        updates: drained,
                    });
                }
            }
        }
    }

    /// Applies the drained writes to the shadow copies. Returns the number
    /// of buffers updated, zero after the first call.
    pub(crate) fn consume_updates(&self) -> usize {
        let updates = std::mem::take(&mut *self.buffer_updates.lock());
        for pending in &updates {
            pending.buffer.apply_updates(&pending.updates);
        }
        self.consumed.store(true, Ordering::Release);
        updates.len()
    }

    /// Takes the batches back out of a frame nobody else holds.
    pub(crate) fn into_batches(self) -> Vec<Batch> {
        self.batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_drains_each_buffer_once() {
        let buffer = Buffer::new("shared", 8);
        buffer.set_sub_data(0, &[1, 2, 3, 4]);

        let mut a = Batch::new("a");
        a.set_uniform_buffer(0, Some(&buffer), 0, 0);
        let mut b = Batch::new("b");
        b.set_resource_buffer(0, Some(&buffer));

        let mut frame = Frame::new(1, Mat4::IDENTITY, Mat4::IDENTITY);
        frame.push_batch(a);
        frame.push_batch(b);
        frame.finish();

        assert_eq!(frame.pending_update_count(), 1);
        assert!(!buffer.has_pending_updates());
    }

    #[test]
    fn consume_is_idempotent() {
        let buffer = Buffer::new("b", 4);
        buffer.set_sub_data(0, &[9, 9, 9, 9]);
        let mut batch = Batch::new("b");
        batch.set_resource_buffer(0, Some(&buffer));

        let mut frame = Frame::new(1, Mat4::IDENTITY, Mat4::IDENTITY);
        frame.push_batch(batch);
        frame.finish();

        assert_eq!(frame.consume_updates(), 1);
        let first = (buffer.shadow_bytes(), buffer.shadow_version());
        assert_eq!(frame.consume_updates(), 0);
        assert_eq!((buffer.shadow_bytes(), buffer.shadow_version()), first);
        assert!(frame.is_consumed());
    }
}
