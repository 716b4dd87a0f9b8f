//! Camera blocks
//!
//! The per-draw camera parameters uploaded into the camera buffer and bound
//! at [`CAMERA_SLOT`](crate::settings::CAMERA_SLOT). One camera element
//! holds a block per eye; mono elements repeat the single block so that
//! every element has the same size.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec4};

use crate::frame::StereoState;

/// Camera parameters as read by shaders.
///
/// `view` maps world to eye space; `view_inverse` is the eye-to-world
/// transform recorded in the batch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformCamera {
    pub view: Mat4,
    pub view_inverse: Mat4,
    pub previous_view: Mat4,
    pub previous_view_inverse: Mat4,
    pub projection: Mat4,
    pub projection_inverse: Mat4,
    pub previous_projection: Mat4,
    pub projection_view_untranslated: Mat4,
    pub previous_projection_view_untranslated: Mat4,
    /// `(x, y, width, height)` in pixels.
    pub viewport: Vec4,
    /// `(is_stereo, eye, 1 / width, 1 / height)`.
    pub stereo_info: Vec4,
    /// Current jitter in `xy`, previous jitter in `zw`, in clip units.
    pub jitter_uv: Vec4,
}

impl Default for TransformCamera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            view_inverse: Mat4::IDENTITY,
            previous_view: Mat4::IDENTITY,
            previous_view_inverse: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            projection_inverse: Mat4::IDENTITY,
            previous_projection: Mat4::IDENTITY,
            projection_view_untranslated: Mat4::IDENTITY,
            previous_projection_view_untranslated: Mat4::IDENTITY,
            viewport: Vec4::ZERO,
            stereo_info: Vec4::ZERO,
            jitter_uv: Vec4::ZERO,
        }
    }
}

/// One element of the camera buffer: a block per eye.
pub type CameraElement = [TransformCamera; 2];

/// Size in bytes of a [`CameraElement`], the stride of the camera buffer.
pub const CAMERA_ELEMENT_SIZE: usize = std::mem::size_of::<CameraElement>();

fn untranslated(mut view: Mat4) -> Mat4 {
    view.w_axis = Vec4::W;
    view
}

fn add_jitter(projection: &mut Mat4, jitter: Vec2) {
    projection.z_axis.x += jitter.x;
    projection.z_axis.y += jitter.y;
}

fn safe_reciprocal(value: f32) -> f32 {
    if value == 0.0 { 0.0 } else { 1.0 / value }
}

impl TransformCamera {
    /// Fills the inverse and combined matrices from the eye-to-world
    /// transforms and the projections already set.
    fn recompute_derived(&mut self, view: Mat4, previous_view: Mat4) {
        self.projection_inverse = self.projection.inverse();
        self.view_inverse = view;
        self.view = view.inverse();
        self.previous_view_inverse = previous_view;
        self.previous_view = previous_view.inverse();
        self.projection_view_untranslated = self.projection * untranslated(self.view);
        self.previous_projection_view_untranslated =
            self.previous_projection * untranslated(self.previous_view);
    }

    /// The camera for a single view.
    #[must_use]
    pub fn mono(&self, view: Mat4, previous_view: Mat4, jitter: Vec2, previous_jitter: Vec2) -> Self {
        let mut result = *self;
        // The projection is assumed unchanged since last frame, jitter aside.
        result.previous_projection = result.projection;
        add_jitter(&mut result.projection, jitter);
        add_jitter(&mut result.previous_projection, previous_jitter);
        result.recompute_derived(view, previous_view);
        result.stereo_info = Vec4::new(
            0.0,
            0.0,
            safe_reciprocal(result.viewport.z),
            safe_reciprocal(result.viewport.w),
        );
        result.jitter_uv = jitter.extend(previous_jitter.x).extend(previous_jitter.y);
        result
    }

    /// The camera of `eye` (0 or 1) under `stereo`.
    #[must_use]
    pub fn eye(
        &self,
        eye: usize,
        stereo: &StereoState,
        view: Mat4,
        previous_view: Mat4,
        jitter: Vec2,
        previous_jitter: Vec2,
    ) -> Self {
        let mut result = *self;
        let (mut eye_view, mut eye_previous_view) = (view, previous_view);
        // Skybox views keep a zero inter-pupillary distance.
        if !stereo.skybox {
            let offset = Mat4::from_translation(-stereo.eye_views[eye].w_axis.truncate());
            eye_view *= offset;
            eye_previous_view *= offset;
        }
        result.projection = stereo.eye_projections[eye];
        result.previous_projection = result.projection;
        result.jitter_uv = jitter.extend(previous_jitter.x).extend(previous_jitter.y);

        // Each eye covers half the horizontal extent of the output.
        add_jitter(&mut result.projection, Vec2::new(jitter.x * 2.0, jitter.y));
        add_jitter(
            &mut result.previous_projection,
            Vec2::new(previous_jitter.x * 2.0, previous_jitter.y),
        );
        result.recompute_derived(eye_view, eye_previous_view);
        result.stereo_info = Vec4::new(
            1.0,
            eye as f32,
            safe_reciprocal(result.viewport.z),
            safe_reciprocal(result.viewport.w),
        );
        result
    }

    /// The element pushed into the camera buffer for one camera change.
    #[must_use]
    pub fn element(
        &self,
        stereo: Option<&StereoState>,
        view: Mat4,
        previous_view: Mat4,
        jitter: Vec2,
        previous_jitter: Vec2,
    ) -> CameraElement {
        match stereo {
            Some(stereo) => [
                self.eye(0, stereo, view, previous_view, jitter, previous_jitter),
                self.eye(1, stereo, view, previous_view, jitter, previous_jitter),
            ],
            None => {
                let mono = self.mono(view, previous_view, jitter, previous_jitter);
                [mono, mono]
            }
        }
    }
}

/// The view-correction block bound at
/// [`CAMERA_CORRECTION_SLOT`](crate::settings::CAMERA_CORRECTION_SLOT).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraCorrection {
    pub correction: Mat4,
    pub correction_inverse: Mat4,
    pub previous_correction: Mat4,
    pub previous_correction_inverse: Mat4,
}

impl Default for CameraCorrection {
    fn default() -> Self {
        Self {
            correction: Mat4::IDENTITY,
            correction_inverse: Mat4::IDENTITY,
            previous_correction: Mat4::IDENTITY,
            previous_correction_inverse: Mat4::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn element_stride_is_two_blocks() {
        assert_eq!(CAMERA_ELEMENT_SIZE, 2 * std::mem::size_of::<TransformCamera>());
        assert_eq!(std::mem::size_of::<TransformCamera>() % 16, 0);
    }

    #[test]
    fn mono_camera_inverts_view_and_applies_jitter() {
        let base = TransformCamera {
            viewport: Vec4::new(0.0, 0.0, 800.0, 600.0),
            ..Default::default()
        };
        let view = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let camera = base.mono(view, view, Vec2::new(0.25, -0.5), Vec2::ZERO);

        assert_eq!(camera.view_inverse, view);
        assert!(camera.view.abs_diff_eq(view.inverse(), 1e-6));
        assert_eq!(camera.projection.z_axis.x, 0.25);
        assert_eq!(camera.projection.z_axis.y, -0.5);
        assert_eq!(camera.previous_projection.z_axis.x, 0.0);
        assert_eq!(camera.jitter_uv, Vec4::new(0.25, -0.5, 0.0, 0.0));
        assert!((camera.stereo_info.z - 1.0 / 800.0).abs() < 1e-9);
    }

    #[test]
    fn stereo_eyes_are_offset_by_eye_translation() {
        let stereo = StereoState {
            enabled: true,
            skybox: false,
            eye_views: [
                Mat4::from_translation(Vec3::new(-0.03, 0.0, 0.0)),
                Mat4::from_translation(Vec3::new(0.03, 0.0, 0.0)),
            ],
            eye_projections: [Mat4::IDENTITY; 2],
        };
        let element = TransformCamera::default().element(
            Some(&stereo),
            Mat4::IDENTITY,
            Mat4::IDENTITY,
            Vec2::new(0.1, 0.1),
            Vec2::ZERO,
        );
        assert!((element[0].view_inverse.w_axis.x - 0.03).abs() < 1e-6);
        assert!((element[1].view_inverse.w_axis.x + 0.03).abs() < 1e-6);
        assert!((element[0].projection.z_axis.x - 0.2).abs() < 1e-6);
        assert_eq!(element[1].stereo_info.y, 1.0);
    }

    #[test]
    fn mono_element_repeats_the_block() {
        let element = TransformCamera::default().element(None, Mat4::IDENTITY, Mat4::IDENTITY, Vec2::ZERO, Vec2::ZERO);
        assert_eq!(element[0], element[1]);
    }
}
