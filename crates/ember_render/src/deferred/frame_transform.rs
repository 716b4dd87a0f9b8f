//! Deferred frame transform: the camera block shared by the full-screen
//! deferred passes, and the job that records the main view.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_gpu::{Buffer, BufferView, StructBuffer, do_in_batch};
use glam::{Mat4, Vec4};

use super::MAIN_VIEW_SLOT;
use crate::args::RenderContext;
use crate::task::{Job, Varying};

/// Camera parameters read by the deferred passes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameTransformParams {
    /// `(near * far, far - near, -far, 0)`.
    pub depth_info: Vec4,
    /// Viewport `(x, y, width, height)` in pixels.
    pub pixel_info: Vec4,
    /// `(1 / eye width, 1 / height, 0, 0)`.
    pub inv_pixel_info: Vec4,
    /// `(is_stereo, eye width, 0, is_stereo)`.
    pub stereo_info: Vec4,
    /// World to eye.
    pub view: Mat4,
    /// Eye to world.
    pub view_inverse: Mat4,
    pub projection_mono: Mat4,
    /// Per-eye projection, both equal to the mono one outside stereo.
    pub projection: [Mat4; 2],
    pub projection_inverse: [Mat4; 2],
}

impl Default for FrameTransformParams {
    fn default() -> Self {
        Self {
            depth_info: Vec4::ZERO,
            pixel_info: Vec4::ZERO,
            inv_pixel_info: Vec4::ZERO,
            stereo_info: Vec4::ZERO,
            view: Mat4::IDENTITY,
            view_inverse: Mat4::IDENTITY,
            projection_mono: Mat4::IDENTITY,
            projection: [Mat4::IDENTITY; 2],
            projection_inverse: [Mat4::IDENTITY; 2],
        }
    }
}

/// Handle to the frame transform of the current run.
#[derive(Debug, Clone)]
pub struct DeferredFrameTransform {
    buffer: Arc<Buffer>,
    params: FrameTransformParams,
}

impl DeferredFrameTransform {
    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    #[must_use]
    pub fn view(&self) -> BufferView {
        BufferView::new(self.buffer.clone(), 0, std::mem::size_of::<FrameTransformParams>())
    }

    #[must_use]
    pub fn params(&self) -> &FrameTransformParams {
        &self.params
    }
}

/// Updates the frame transform block and records the main view into saved
/// transform slot [`MAIN_VIEW_SLOT`].
pub struct GenerateDeferredFrameTransform {
    params: StructBuffer<FrameTransformParams>,
    output: Varying<DeferredFrameTransform>,
}

impl GenerateDeferredFrameTransform {
    #[must_use]
    pub fn new(output: Varying<DeferredFrameTransform>) -> Self {
        Self {
            params: StructBuffer::new("DeferredFrameTransform", FrameTransformParams::default()),
            output,
        }
    }

    fn update(&mut self, ctx: &RenderContext) {
        let args = &ctx.args;
        let near = args.near_clip;
        let far = args.far_clip;
        let viewport = args.viewport.as_vec4();
        let stereo = ctx.is_stereo();

        let mut params = self.params.edit();
        params.depth_info = Vec4::new(near * far, far - near, -far, 0.0);
        params.pixel_info = viewport;
        params.view_inverse = args.view;
        params.view = args.view.inverse();
        params.projection_mono = args.projection;

        if stereo {
            let projections = ctx.context.stereo_projections();
            let eye_views = ctx.context.stereo_views();
            for eye in 0..2 {
                // Mono eye space to the clip space of this eye.
                let side = projections[eye] * eye_views[eye];
                params.projection[eye] = side;
                params.projection_inverse[eye] = side.inverse();
            }
            let eye_width = (args.viewport.z >> 1) as f32;
            params.stereo_info = Vec4::new(1.0, eye_width, 0.0, 1.0);
            params.inv_pixel_info = Vec4::new(1.0 / eye_width.max(1.0), 1.0 / viewport.w.max(1.0), 0.0, 0.0);
        } else {
            params.projection = [args.projection; 2];
            params.projection_inverse = [args.projection.inverse(); 2];
            params.stereo_info = Vec4::new(0.0, viewport.z, 0.0, 0.0);
            params.inv_pixel_info = Vec4::new(1.0 / viewport.z.max(1.0), 1.0 / viewport.w.max(1.0), 0.0, 0.0);
        }
    }
}

impl Job for GenerateDeferredFrameTransform {
    fn run(&mut self, ctx: &mut RenderContext) {
        self.update(ctx);
        self.output.set(DeferredFrameTransform {
            buffer: self.params.buffer().clone(),
            params: *self.params.get(),
        });

        let args = &ctx.args;
        do_in_batch("GenerateDeferredFrameTransform::run", &ctx.context, |batch| {
            batch.set_viewport_transform(args.viewport);
            batch.set_state_scissor_rect(args.viewport);
            batch.set_projection_transform(args.projection);
            batch.set_view_transform(args.view, true);
            // Main view reused by every later pass of the frame.
            batch.save_view_projection_transform(MAIN_VIEW_SLOT);
        });
    }
}
