//! Transform stage
//!
//! Tracks view, projection, viewport and depth range, and turns every camera
//! change seen during the transfer pass into an element of the camera
//! buffer.
//!
//! The camera buffer is double-buffered: each replayed batch uploads its
//! elements into the half the previous batch did not use, so bindings left
//! over from the previous batch still read valid data.
//!
//! `camera_offsets` pairs the index of the command that triggered a camera
//! element with the element's byte offset. The draw pass walks it with a
//! forward-only cursor, reset once per replay when the elements are
//! uploaded; it never moves backward within a pass.

use bytemuck::cast_slice;
use glam::{IVec4, Mat4, UVec2, Vec2, Vec4};

use super::StateBackend;
use super::camera::{CAMERA_ELEMENT_SIZE, CameraElement, TransformCamera};
use crate::frame::StereoState;
use crate::native::{NativeApi, NativeHandle};
use crate::resources::ResourceId;
use crate::settings::{CAMERA_SLOT, MAX_TRANSFORM_SAVE_SLOT_COUNT};
use crate::stats::GPU_METRICS;

const SAVED_SLOT_COUNT: usize = MAX_TRANSFORM_SAVE_SLOT_COUNT as usize;

/// View and projection as recorded, plus the corrected views derived from
/// them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ViewProjectionState {
    pub view: Mat4,
    pub corrected_view: Mat4,
    pub previous_corrected_view: Mat4,
    pub projection: Mat4,
    pub view_is_camera: bool,
}

impl Default for ViewProjectionState {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            corrected_view: Mat4::IDENTITY,
            previous_corrected_view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            view_is_camera: false,
        }
    }
}

impl ViewProjectionState {
    fn copy_except_previous(&mut self, other: &Self) {
        let previous = self.previous_corrected_view;
        *self = *other;
        self.previous_corrected_view = previous;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SavedTransform {
    state: ViewProjectionState,
    /// Camera buffer offset of the element pushed when the slot was saved.
    camera_offset: Option<usize>,
}

#[derive(Debug, Clone)]
struct JitterState {
    enabled: bool,
    sequence: Vec<Vec2>,
    scale: f32,
    offset: Vec2,
    /// Last offset taken from a non-empty sequence during the current frame.
    frame_offset: Vec2,
    previous_offset: Vec2,
}

impl Default for JitterState {
    fn default() -> Self {
        Self {
            enabled: false,
            sequence: Vec::new(),
            scale: 1.0,
            offset: Vec2::ZERO,
            frame_offset: Vec2::ZERO,
            previous_offset: Vec2::ZERO,
        }
    }
}

impl JitterState {
    fn update_offset(&mut self, frame_index: u64) {
        self.offset = if self.sequence.is_empty() {
            Vec2::ZERO
        } else {
            let index = (frame_index % self.sequence.len() as u64) as usize;
            self.sequence[index] * self.scale
        };
        if !self.sequence.is_empty() {
            self.frame_offset = self.offset;
        }
    }

    /// Starts frame `frame_index`, remembering the offset the previous frame
    /// rendered with even if its sequence was cleared before it ended.
    fn advance(&mut self, frame_index: u64) {
        self.previous_offset = self.frame_offset;
        self.frame_offset = Vec2::ZERO;
        self.update_offset(frame_index);
    }
}

#[derive(Debug)]
struct CameraRing {
    id: ResourceId,
    handle: NativeHandle,
    capacity: usize,
}

impl CameraRing {
    fn new() -> Self {
        Self {
            id: ResourceId::next(),
            handle: NativeHandle::NULL,
            capacity: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TransformStageState {
    camera: TransformCamera,
    vp: ViewProjectionState,
    viewport: IVec4,
    /// Depth range last set natively.
    depth_range: Option<Vec2>,
    invalid_view: bool,
    invalid_proj: bool,
    invalid_viewport: bool,

    cameras: Vec<CameraElement>,
    camera_offsets: Vec<(usize, usize)>,
    cursor: usize,
    current_camera_offset: Option<usize>,

    saved: [SavedTransform; SAVED_SLOT_COUNT],
    current_saved_slot: Option<usize>,

    jitter: JitterState,
    frame_index: u64,

    pub view_correction_enabled: bool,
    pub correction: Mat4,
    pub correction_inverse: Mat4,
    pub skybox: bool,

    rings: [CameraRing; 2],
    ring_index: usize,
    min_ring_capacity: usize,
}

impl TransformStageState {
    pub fn new(camera_capacity: usize) -> Self {
        Self {
            camera: TransformCamera::default(),
            vp: ViewProjectionState::default(),
            viewport: IVec4::ZERO,
            depth_range: None,
            invalid_view: true,
            invalid_proj: true,
            invalid_viewport: true,
            cameras: Vec::with_capacity(camera_capacity),
            camera_offsets: Vec::with_capacity(camera_capacity),
            cursor: 0,
            current_camera_offset: None,
            saved: [SavedTransform::default(); SAVED_SLOT_COUNT],
            current_saved_slot: None,
            jitter: JitterState::default(),
            frame_index: 0,
            view_correction_enabled: true,
            correction: Mat4::IDENTITY,
            correction_inverse: Mat4::IDENTITY,
            skybox: false,
            rings: [CameraRing::new(), CameraRing::new()],
            ring_index: 0,
            min_ring_capacity: camera_capacity.max(1) * CAMERA_ELEMENT_SIZE,
        }
    }

    /// Starts the transfer pass of a batch.
    ///
    /// Every batch pushes a camera element at its first draw, so that no
    /// draw reads an element uploaded by an earlier batch.
    pub fn begin_transfer(&mut self) {
        self.cameras.clear();
        self.camera_offsets.clear();
        self.cursor = 0;
        self.current_camera_offset = None;
        self.invalid_view = true;
        self.invalid_proj = true;
        self.invalid_viewport = true;
    }

    fn pre_update(&mut self, command_index: usize, stereo: Option<&StereoState>, framebuffer_size: UVec2) {
        if self.invalid_viewport {
            self.camera.viewport = self.viewport.as_vec4();
        }
        if self.invalid_proj {
            self.camera.projection = self.vp.projection;
        }
        if self.invalid_view {
            let corrected = self.vp.view_is_camera
                && self.view_correction_enabled
                && self.correction != Mat4::IDENTITY;
            self.vp.corrected_view = if corrected {
                let mut view = self.vp.view * self.correction_inverse;
                if self.skybox {
                    view.w_axis = Vec4::W;
                }
                view
            } else {
                self.vp.view
            };
        }

        if self.invalid_view || self.invalid_proj || self.invalid_viewport {
            let offset = CAMERA_ELEMENT_SIZE * self.cameras.len();
            self.camera_offsets.push((command_index, offset));

            // One pixel of amplitude spans two clip units.
            let amplitude = if self.jitter.enabled { 2.0 } else { 0.0 };
            let scale = Vec2::splat(amplitude) / framebuffer_size.as_vec2();
            self.cameras.push(self.camera.element(
                stereo,
                self.vp.corrected_view,
                self.vp.previous_corrected_view,
                scale * self.jitter.offset,
                scale * self.jitter.previous_offset,
            ));

            if let Some(slot) = self.current_saved_slot {
                self.saved[slot].camera_offset = Some(offset);
            }
        }

        self.invalid_view = false;
        self.invalid_proj = false;
        self.invalid_viewport = false;
    }

    /// Advances the cursor past every camera change recorded at or before
    /// `command_index`, returning the offset of the last one.
    fn advance_cursor(&mut self, command_index: usize) -> Option<usize> {
        let mut offset = None;
        while let Some(&(index, element_offset)) = self.camera_offsets.get(self.cursor) {
            if command_index < index {
                break;
            }
            offset = Some(element_offset);
            self.cursor += 1;
        }
        if offset.is_some() {
            self.current_camera_offset = offset;
        }
        offset
    }
}

fn clamp_slot(slot: u32) -> usize {
    let clamped = (slot as usize).min(SAVED_SLOT_COUNT - 1);
    if clamped != slot as usize {
        log::debug!("Saved transform slot {slot} clamped to {clamped}");
    }
    clamped
}

impl<A: NativeApi> StateBackend<A> {
    pub(super) fn do_set_view_transform(&mut self, view: Mat4, camera: bool) {
        let t = &mut self.transform;
        t.vp.view = view;
        // View history exists only through saved slots.
        t.vp.previous_corrected_view = view;
        t.vp.view_is_camera = camera;
        t.invalid_view = true;
        t.current_saved_slot = None;
    }

    pub(super) fn do_set_projection_transform(&mut self, projection: Mat4) {
        let t = &mut self.transform;
        t.vp.projection = projection;
        t.invalid_proj = true;
        t.current_saved_slot = None;
    }

    pub(super) fn do_set_projection_jitter_enabled(&mut self, enabled: bool) {
        let t = &mut self.transform;
        t.jitter.enabled = enabled;
        t.invalid_proj = true;
        t.current_saved_slot = None;
    }

    pub(super) fn do_set_projection_jitter_sequence(&mut self, sequence: &[Vec2]) {
        let t = &mut self.transform;
        t.jitter.sequence.clear();
        t.jitter.sequence.extend_from_slice(sequence);
        t.jitter.update_offset(t.frame_index);
        t.invalid_proj = true;
        t.current_saved_slot = None;
    }

    pub(super) fn do_set_projection_jitter_scale(&mut self, scale: f32) {
        let t = &mut self.transform;
        t.jitter.scale = scale;
        t.jitter.update_offset(t.frame_index);
        t.invalid_proj = true;
        t.current_saved_slot = None;
    }

    pub(super) fn do_set_viewport_transform(&mut self, viewport: IVec4) {
        self.transform.viewport = viewport;
        if self.in_transfer_pass {
            self.transform.invalid_viewport = true;
        } else {
            self.api.set_viewport(viewport);
        }
    }

    pub(super) fn do_set_depth_range_transform(&mut self, near: f32, far: f32) {
        let range = Vec2::new(near, far);
        if self.transform.depth_range != Some(range) {
            self.transform.depth_range = Some(range);
            self.api.set_depth_range(near, far);
        }
    }

    pub(super) fn do_set_view_correction_enabled(&mut self, enabled: bool) {
        self.transform.view_correction_enabled = enabled;
        if self.in_transfer_pass {
            self.transform.invalid_view = true;
        }
    }

    pub(super) fn do_save_view_projection_transform(&mut self, slot: u32) {
        let slot = clamp_slot(slot);
        self.transform.saved[slot].camera_offset = None;
        self.transform.current_saved_slot = Some(slot);
        self.pre_update_transform();
        let current = self.transform.vp;
        self.transform.saved[slot].state.copy_except_previous(&current);
    }

    pub(super) fn do_set_saved_view_projection_transform(&mut self, slot: u32) {
        let slot = clamp_slot(slot);
        let t = &mut self.transform;
        t.vp = t.saved[slot].state;
        t.invalid_view = true;
        t.invalid_proj = true;
        t.current_saved_slot = Some(slot);
    }

    /// Pushes a camera element for the command being replayed if any part
    /// of the camera changed.
    pub(super) fn pre_update_transform(&mut self) {
        let framebuffer_size = match self.output.size {
            Some(size) => size.max(UVec2::ONE),
            None => {
                if self.transform.jitter.enabled {
                    log::debug!("Projection jitter needs a framebuffer to be set");
                }
                UVec2::ONE
            }
        };
        let stereo = self.is_stereo().then_some(self.batch_stereo);
        self.transform
            .pre_update(self.command_index, stereo.as_ref(), framebuffer_size);
    }

    /// Uploads the camera elements of the transfer pass and rewinds the
    /// cursor for the draw pass.
    pub(super) fn transfer_transform_state(&mut self) {
        let t = &mut self.transform;
        t.cursor = 0;
        t.current_camera_offset = None;
        if t.cameras.is_empty() {
            return;
        }

        t.ring_index = (t.ring_index + 1) % t.rings.len();
        let bytes: &[u8] = cast_slice(&t.cameras);
        let ring = &mut t.rings[t.ring_index];
        if ring.capacity < bytes.len() {
            if !ring.handle.is_null() {
                self.api.delete_buffer(ring.handle);
                GPU_METRICS.buffer_destroyed(ring.capacity as u64);
            }
            let capacity = bytes.len().next_power_of_two().max(t.min_ring_capacity);
            ring.handle = self.api.create_buffer(capacity);
            ring.capacity = capacity;
            GPU_METRICS.buffer_created(capacity as u64);
        }
        self.api.upload_buffer(ring.handle, 0, bytes);
    }

    /// Binds the camera element of the draw at `command_index`.
    pub(super) fn update_transform(&mut self, command_index: usize) {
        if let Some(offset) = self.transform.advance_cursor(command_index) {
            let ring = &self.transform.rings[self.transform.ring_index];
            let (id, handle) = (ring.id, ring.handle);
            self.bind_uniform_native(CAMERA_SLOT, id, handle, offset, CAMERA_ELEMENT_SIZE);
        }
    }

    /// Rolls the jitter sequence and the saved-slot view history over to
    /// the next frame.
    pub(super) fn advance_transform_frame(&mut self) {
        let t = &mut self.transform;
        t.frame_index += 1;
        t.jitter.advance(t.frame_index);
        for saved in &mut t.saved {
            saved.state.previous_corrected_view = saved.state.corrected_view;
        }
        t.invalid_proj = true;
    }

    pub(super) fn reset_transform_stage(&mut self) {
        let t = &mut self.transform;
        t.invalid_view = true;
        t.invalid_proj = true;
        t.invalid_viewport = true;
        t.depth_range = None;
        t.cursor = 0;
        t.current_camera_offset = None;
        t.current_saved_slot = None;
    }

    pub(super) fn release_transform_buffers(&mut self) {
        for ring in &mut self.transform.rings {
            if !ring.handle.is_null() {
                self.api.delete_buffer(ring.handle);
                GPU_METRICS.buffer_destroyed(ring.capacity as u64);
                ring.handle = NativeHandle::NULL;
                ring.capacity = 0;
            }
        }
    }

    // ─── Inspection ───────────────────────────────────────────────────────────

    /// The recorded eye-to-world view transform.
    #[must_use]
    pub fn view_transform(&self) -> Mat4 {
        self.transform.vp.view
    }

    #[must_use]
    pub fn projection_transform(&self) -> Mat4 {
        self.transform.vp.projection
    }

    /// Jitter offset of the current frame, in pixels.
    #[must_use]
    pub fn jitter_offset(&self) -> Vec2 {
        self.transform.jitter.offset
    }

    /// Jitter offset the previous frame rendered with.
    #[must_use]
    pub fn previous_jitter_offset(&self) -> Vec2 {
        self.transform.jitter.previous_offset
    }

    /// Camera elements uploaded by the last replayed batch.
    #[must_use]
    pub fn camera_elements(&self) -> &[CameraElement] {
        &self.transform.cameras
    }

    /// View and projection stored in a saved slot.
    #[must_use]
    pub fn saved_view_projection(&self, slot: u32) -> (Mat4, Mat4) {
        let saved = &self.transform.saved[clamp_slot(slot)];
        (saved.state.view, saved.state.projection)
    }

    /// Camera buffer offset recorded for a saved slot, if its camera was
    /// pushed while saving.
    #[must_use]
    pub fn saved_camera_offset(&self, slot: u32) -> Option<usize> {
        self.transform.saved[clamp_slot(slot)].camera_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_offset_cycles_through_sequence() {
        let mut jitter = JitterState {
            sequence: vec![Vec2::new(0.5, 0.0), Vec2::new(0.0, 0.5)],
            scale: 2.0,
            ..Default::default()
        };
        jitter.update_offset(0);
        assert_eq!(jitter.offset, Vec2::new(1.0, 0.0));
        jitter.update_offset(3);
        assert_eq!(jitter.offset, Vec2::new(0.0, 1.0));
    }

    #[test]
    fn empty_sequence_has_no_jitter() {
        let mut jitter = JitterState::default();
        jitter.update_offset(7);
        assert_eq!(jitter.offset, Vec2::ZERO);
    }

    #[test]
    fn cleared_sequence_keeps_the_frame_offset_as_previous() {
        let mut jitter = JitterState {
            sequence: vec![Vec2::new(0.5, 0.0), Vec2::new(0.0, 0.5)],
            ..Default::default()
        };
        jitter.update_offset(1);
        jitter.sequence.clear();
        jitter.update_offset(1);
        assert_eq!(jitter.offset, Vec2::ZERO);

        jitter.advance(2);
        assert_eq!(jitter.previous_offset, Vec2::new(0.0, 0.5));
        jitter.advance(3);
        assert_eq!(jitter.previous_offset, Vec2::ZERO);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut state = TransformStageState::new(4);
        state.pre_update(2, None, UVec2::ONE);
        state.invalid_view = true;
        state.pre_update(5, None, UVec2::ONE);

        assert_eq!(state.advance_cursor(2), Some(0));
        assert_eq!(state.advance_cursor(3), None);
        assert_eq!(state.current_camera_offset, Some(0));
        assert_eq!(state.advance_cursor(9), Some(CAMERA_ELEMENT_SIZE));
        // Going back finds nothing new.
        assert_eq!(state.advance_cursor(2), None);
    }

    #[test]
    fn unchanged_camera_pushes_nothing() {
        let mut state = TransformStageState::new(4);
        state.pre_update(0, None, UVec2::ONE);
        state.pre_update(1, None, UVec2::ONE);
        assert_eq!(state.cameras.len(), 1);
    }

    #[test]
    fn slots_clamp_to_last() {
        assert_eq!(clamp_slot(2), 2);
        assert_eq!(clamp_slot(MAX_TRANSFORM_SAVE_SLOT_COUNT + 3), SAVED_SLOT_COUNT - 1);
    }
}
