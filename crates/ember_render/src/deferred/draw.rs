//! Item draws: the opaque G-buffer fill, transparents, overlays, the
//! highlight outline and the background.
//!
//! Model matrices are uploaded into a per-job object buffer bound at
//! [`slot::buffer::OBJECTS`]. Item `i` of a pass is drawn as instance `i`,
//! which is how shaders find its matrix.

use std::cmp::Ordering;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_gpu::pipeline::{BlendFunction, StencilFace, StencilTest};
use ember_gpu::{Batch, Buffer, ClearFlags, Framebuffer, Pipeline, Shader, State, StructBuffer, do_in_batch};
use glam::{Mat4, Vec4};

use super::frame_transform::DeferredFrameTransform;
use super::framebuffer::DeferredFramebuffer;
use super::lighting::LightingModel;
use super::{BACKGROUND_VIEW_SLOT, MAIN_VIEW_SLOT, draw_fullscreen, fullscreen_pipeline, slot};
use crate::args::{ItemLayer, RenderContext, RenderItem, RenderItems};
use crate::task::{Job, Varying};

/// Per-pass storage of item model matrices.
#[derive(Debug)]
pub struct ObjectBuffer {
    buffer: Arc<Buffer>,
}

impl ObjectBuffer {
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            buffer: Buffer::new(label, std::mem::size_of::<Mat4>()),
        }
    }

    /// Replaces the content with the models of `items`, in order.
    pub fn upload<'a>(&self, items: impl IntoIterator<Item = &'a RenderItem>) {
        let models: Vec<Mat4> = items.into_iter().map(|item| item.model).collect();
        if models.is_empty() {
            return;
        }
        self.buffer.set_data(bytemuck::cast_slice(&models));
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

/// Orders items by pipeline identity so that consecutive draws share state.
#[must_use]
pub fn sort_by_pipeline<'a>(items: impl IntoIterator<Item = &'a RenderItem>) -> Vec<&'a RenderItem> {
    let mut sorted: Vec<_> = items.into_iter().collect();
    sorted.sort_by_key(|item| item.pipeline.id());
    sorted
}

/// Orders items from the farthest to the nearest to the camera at
/// `eye_position`.
#[must_use]
pub fn sort_back_to_front<'a>(
    items: impl IntoIterator<Item = &'a RenderItem>,
    eye_position: glam::Vec3,
) -> Vec<&'a RenderItem> {
    let distance = |item: &RenderItem| item.model.w_axis.truncate().distance_squared(eye_position);
    let mut sorted: Vec<_> = items.into_iter().collect();
    sorted.sort_by(|a, b| distance(b).partial_cmp(&distance(a)).unwrap_or(Ordering::Equal));
    sorted
}

/// Records one instanced draw per item, instance `i` for the `i`-th item.
pub fn render_items(batch: &mut Batch, items: &[&RenderItem]) {
    for (index, item) in items.iter().enumerate() {
        batch.set_pipeline(Some(&item.pipeline));
        batch.draw_instanced(1, item.primitive, item.vertex_count, 0, index as u32);
    }
}

fn bind_frame(batch: &mut Batch, frame_transform: &DeferredFrameTransform, lighting_model: &LightingModel) {
    batch.set_uniform_buffer(slot::uniform::LIGHTING_MODEL, Some(&lighting_model.buffer), 0, 0);
    batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
}

/// Shared inputs of the item passes.
#[derive(Clone, Default)]
pub struct DrawInputs {
    pub frame_transform: Varying<DeferredFrameTransform>,
    pub items: Varying<RenderItems>,
    pub lighting_model: Varying<LightingModel>,
}

impl DrawInputs {
    fn resolve(&self) -> Option<(DeferredFrameTransform, LightingModel)> {
        Some((self.frame_transform.get()?, self.lighting_model.get()?))
    }
}

/// Fills the G-buffer with the opaque items, sorted by pipeline.
pub struct DrawStateSortDeferred {
    inputs: DrawInputs,
    objects: ObjectBuffer,
    drawn: usize,
}

impl DrawStateSortDeferred {
    #[must_use]
    pub fn new(inputs: DrawInputs) -> Self {
        Self {
            inputs,
            objects: ObjectBuffer::new("DrawStateSortDeferred.objects"),
            drawn: 0,
        }
    }

    /// Number of items drawn by the last run.
    #[must_use]
    pub fn drawn(&self) -> usize {
        self.drawn
    }
}

impl Job for DrawStateSortDeferred {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some((frame_transform, lighting_model)) = self.inputs.resolve() else {
            return;
        };
        let viewport = ctx.args.viewport;
        let objects = &self.objects;
        let drawn = self.inputs.items.with(|items| {
            let sorted = sort_by_pipeline(items.opaque_in(ItemLayer::Main));
            objects.upload(sorted.iter().copied());

            do_in_batch("DrawStateSortDeferred::run", &ctx.context, |batch| {
                batch.set_viewport_transform(viewport);
                batch.set_state_scissor_rect(viewport);
                batch.set_projection_jitter_enabled(true);
                batch.set_saved_view_projection_transform(MAIN_VIEW_SLOT);

                bind_frame(batch, &frame_transform, &lighting_model);
                batch.set_resource_buffer(slot::buffer::OBJECTS, Some(objects.buffer()));
                render_items(batch, &sorted);
                batch.set_resource_buffer(slot::buffer::OBJECTS, None);
            });
            sorted.len()
        });
        self.drawn = drawn.unwrap_or(0);
    }
}

/// Forward-shades the transparent items into the lighting framebuffer,
/// back to front.
pub struct DrawDeferred {
    inputs: DrawInputs,
    light_clusters: Varying<Arc<Buffer>>,
    objects: ObjectBuffer,
}

impl DrawDeferred {
    #[must_use]
    pub fn new(inputs: DrawInputs, light_clusters: Varying<Arc<Buffer>>) -> Self {
        Self {
            inputs,
            light_clusters,
            objects: ObjectBuffer::new("DrawDeferred.objects"),
        }
    }
}

impl Job for DrawDeferred {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some((frame_transform, lighting_model)) = self.inputs.resolve() else {
            return;
        };
        let viewport = ctx.args.viewport;
        let eye = ctx.args.view.w_axis.truncate();
        let light_clusters = self.light_clusters.get();
        let objects = &self.objects;
        self.inputs.items.with(|items| {
            let sorted = sort_back_to_front(items.transparent_in(ItemLayer::Main), eye);
            objects.upload(sorted.iter().copied());

            do_in_batch("DrawDeferred::run", &ctx.context, |batch| {
                batch.set_viewport_transform(viewport);
                batch.set_state_scissor_rect(viewport);
                batch.set_projection_jitter_enabled(true);
                batch.set_saved_view_projection_transform(MAIN_VIEW_SLOT);

                bind_frame(batch, &frame_transform, &lighting_model);
                batch.set_resource_buffer(slot::buffer::LIGHT_CLUSTER_GRID, light_clusters.as_ref());
                batch.set_resource_buffer(slot::buffer::OBJECTS, Some(objects.buffer()));
                render_items(batch, &sorted);
                batch.set_resource_buffer(slot::buffer::OBJECTS, None);
                batch.set_resource_buffer(slot::buffer::LIGHT_CLUSTER_GRID, None);
            });
        });
    }
}

/// Draws 3D overlays of one layer. The opaque pass of a layer first clears
/// depth so overlays are not hidden by the scene.
pub struct DrawOverlay3D {
    inputs: DrawInputs,
    layer: ItemLayer,
    opaque: bool,
    output_velocity: bool,
    objects: ObjectBuffer,
}

impl DrawOverlay3D {
    #[must_use]
    pub fn new(inputs: DrawInputs, layer: ItemLayer, opaque: bool, output_velocity: bool) -> Self {
        Self {
            inputs,
            layer,
            opaque,
            output_velocity,
            objects: ObjectBuffer::new("DrawOverlay3D.objects"),
        }
    }
}

impl Job for DrawOverlay3D {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some((frame_transform, lighting_model)) = self.inputs.resolve() else {
            return;
        };

        // Clearing with stereo enabled is not allowed, so the clear gets its
        // own batch.
        if self.opaque {
            do_in_batch("DrawOverlay3D::run::clear", &ctx.context, |batch| {
                batch.enable_stereo(false);
                batch.clear_framebuffer(ClearFlags::DEPTH, Vec4::ZERO, 1.0, 0, false);
            });
        }

        let viewport = ctx.args.viewport;
        let (layer, opaque, output_velocity) = (self.layer, self.opaque, self.output_velocity);
        let objects = &self.objects;
        self.inputs.items.with(|items| {
            let sorted: Vec<&RenderItem> = if opaque {
                sort_by_pipeline(items.opaque_in(layer))
            } else {
                items.transparent_in(layer).collect()
            };
            if sorted.is_empty() {
                return;
            }
            objects.upload(sorted.iter().copied());

            do_in_batch("DrawOverlay3D::main", &ctx.context, |batch| {
                batch.set_viewport_transform(viewport);
                batch.set_state_scissor_rect(viewport);
                batch.set_projection_jitter_enabled(output_velocity);
                batch.set_saved_view_projection_transform(MAIN_VIEW_SLOT);

                bind_frame(batch, &frame_transform, &lighting_model);
                batch.set_resource_buffer(slot::buffer::OBJECTS, Some(objects.buffer()));
                render_items(batch, &sorted);
                batch.set_resource_buffer(slot::buffer::OBJECTS, None);
            });
        });
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HighlightParams {
    pub color: Vec4,
    /// `(width in pixels, fill opacity, 0, 0)`.
    pub outline: Vec4,
}

impl Default for HighlightParams {
    fn default() -> Self {
        Self {
            color: Vec4::new(1.0, 0.7, 0.2, 1.0),
            outline: Vec4::new(2.0, 0.0, 0.0, 0.0),
        }
    }
}

const HIGHLIGHT_STENCIL: u8 = 0x80;

/// Outlines the highlighted items: their shapes are written into the
/// stencil buffer, then an outline is drawn around the marked pixels.
pub struct DrawHighlight {
    frame_transform: Varying<DeferredFrameTransform>,
    items: Varying<RenderItems>,
    deferred: Varying<Arc<DeferredFramebuffer>>,
    params: StructBuffer<HighlightParams>,
    mask_pipeline: Arc<Pipeline>,
    outline_pipeline: Arc<Pipeline>,
    objects: ObjectBuffer,
}

impl DrawHighlight {
    #[must_use]
    pub fn new(
        frame_transform: Varying<DeferredFrameTransform>,
        items: Varying<RenderItems>,
        deferred: Varying<Arc<DeferredFramebuffer>>,
    ) -> Self {
        let mut mask = State::new();
        mask.set_stencil_activation(true, HIGHLIGHT_STENCIL);
        mask.set_stencil_test(StencilTest::both(StencilFace::write(HIGHLIGHT_STENCIL)));
        mask.set_color_write_mask(wgpu::ColorWrites::empty());

        Self {
            frame_transform,
            items,
            deferred,
            params: StructBuffer::new("HighlightParams", HighlightParams::default()),
            mask_pipeline: Pipeline::create(Shader::named("highlight_mask"), Arc::new(mask)),
            outline_pipeline: fullscreen_pipeline("highlight_outline", |state| {
                state.set_stencil_test(StencilTest::both(StencilFace::test_equal(0, HIGHLIGHT_STENCIL)));
                state.set_blend_function(BlendFunction::alpha_blending());
            }),
            objects: ObjectBuffer::new("DrawHighlight.objects"),
        }
    }
}

impl Job for DrawHighlight {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred)) = (self.frame_transform.get(), self.deferred.get()) else {
            return;
        };
        let viewport = ctx.args.viewport;
        let objects = &self.objects;
        let (mask_pipeline, outline_pipeline, params) = (&self.mask_pipeline, &self.outline_pipeline, &self.params);
        self.items.with(|items| {
            if items.highlighted.is_empty() {
                return;
            }
            objects.upload(&items.highlighted);

            do_in_batch("DrawHighlight::run", &ctx.context, |batch| {
                batch.enable_stereo(false);
                batch.set_viewport_transform(viewport);
                batch.set_state_scissor_rect(viewport);
                batch.set_projection_jitter_enabled(false);
                batch.set_saved_view_projection_transform(MAIN_VIEW_SLOT);

                batch.set_framebuffer(Some(deferred.deferred_framebuffer()));
                batch.set_pipeline(Some(mask_pipeline));
                batch.set_resource_buffer(slot::buffer::OBJECTS, Some(objects.buffer()));
                for (index, item) in items.highlighted.iter().enumerate() {
                    batch.draw_instanced(1, item.primitive, item.vertex_count, 0, index as u32);
                }
                batch.set_resource_buffer(slot::buffer::OBJECTS, None);

                batch.set_framebuffer(Some(deferred.lighting_framebuffer()));
                batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
                batch.set_uniform_buffer_view(slot::uniform::HIGHLIGHT_PARAMS, &params.view());
                batch.set_resource_texture(slot::texture::DEPTH, Some(deferred.primary_depth_texture()));
                batch.set_pipeline(Some(outline_pipeline));
                draw_fullscreen(batch);

                batch.set_resource_texture(slot::texture::DEPTH, None);
                batch.set_uniform_buffer(slot::uniform::HIGHLIGHT_PARAMS, None, 0, 0);
            });
        });
    }
}

/// Draws the skybox behind the scene, with its own saved view.
pub struct DrawBackgroundStage {
    items: Varying<RenderItems>,
    lighting_model: Varying<LightingModel>,
}

impl DrawBackgroundStage {
    #[must_use]
    pub fn new(items: Varying<RenderItems>, lighting_model: Varying<LightingModel>) -> Self {
        Self { items, lighting_model }
    }
}

impl Job for DrawBackgroundStage {
    fn run(&mut self, ctx: &mut RenderContext) {
        if !self
            .lighting_model
            .with(|model| model.background_enabled)
            .unwrap_or(false)
        {
            return;
        }
        let Some(skybox) = self.items.with(|items| items.background.clone()).flatten() else {
            return;
        };

        let args = &ctx.args;
        do_in_batch("DrawBackgroundStage::run", &ctx.context, |batch| {
            batch.enable_skybox(true);
            batch.set_viewport_transform(args.viewport);
            batch.set_state_scissor_rect(args.viewport);
            batch.set_projection_jitter_enabled(true);

            batch.set_projection_transform(args.projection);
            batch.set_view_transform(args.view, true);
            batch.save_view_projection_transform(BACKGROUND_VIEW_SLOT);
            batch.set_pipeline(Some(&skybox.pipeline));
            batch.draw(skybox.primitive, skybox.vertex_count);
        });
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HazeParams {
    pub color: Vec4,
    /// `(range, height, density, 0)`.
    pub falloff: Vec4,
}

impl Default for HazeParams {
    fn default() -> Self {
        Self {
            color: Vec4::new(0.5, 0.6, 0.7, 1.0),
            falloff: Vec4::new(1000.0, 200.0, 0.01, 0.0),
        }
    }
}

/// Blends distance haze over the lit scene.
pub struct DrawHaze {
    frame_transform: Varying<DeferredFrameTransform>,
    lighting_model: Varying<LightingModel>,
    linear_depth: Varying<Arc<Framebuffer>>,
    params: StructBuffer<HazeParams>,
    pipeline: Arc<Pipeline>,
}

impl DrawHaze {
    #[must_use]
    pub fn new(
        frame_transform: Varying<DeferredFrameTransform>,
        lighting_model: Varying<LightingModel>,
        linear_depth: Varying<Arc<Framebuffer>>,
    ) -> Self {
        Self {
            frame_transform,
            lighting_model,
            linear_depth,
            params: StructBuffer::new("HazeParams", HazeParams::default()),
            pipeline: fullscreen_pipeline("haze", |state| state.set_blend_function(BlendFunction::alpha_blending())),
        }
    }
}

impl Job for DrawHaze {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(lighting_model), Some(linear_depth)) =
            (self.frame_transform.get(), self.lighting_model.get(), self.linear_depth.get())
        else {
            return;
        };
        if !lighting_model.haze_enabled {
            return;
        }
        let viewport = ctx.args.viewport;
        do_in_batch("DrawHaze::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_pipeline(Some(&self.pipeline));

            bind_frame(batch, &frame_transform, &lighting_model);
            batch.set_uniform_buffer_view(slot::uniform::HAZE_PARAMS, &self.params.view());
            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, linear_depth.render_buffer(0));
            draw_fullscreen(batch);

            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, None);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gpu::Primitive;
    use glam::Vec3;

    fn item(pipeline: &Arc<Pipeline>, z: f32) -> RenderItem {
        RenderItem::new(pipeline.clone(), Primitive::Triangles, 3)
            .with_model(Mat4::from_translation(Vec3::new(0.0, 0.0, z)))
    }

    #[test]
    fn state_sort_groups_equal_pipelines() {
        let a = Pipeline::create(Shader::named("a"), Arc::new(State::new()));
        let b = Pipeline::create(Shader::named("b"), Arc::new(State::new()));
        let items = [item(&b, 0.0), item(&a, 0.0), item(&b, 0.0), item(&a, 0.0)];
        let sorted = sort_by_pipeline(&items);
        let ids: Vec<_> = sorted.iter().map(|i| i.pipeline.id()).collect();
        assert_eq!(ids, [a.id(), a.id(), b.id(), b.id()]);
    }

    #[test]
    fn transparents_sort_far_to_near() {
        let p = Pipeline::create(Shader::named("t"), Arc::new(State::new()));
        let items = [item(&p, -1.0), item(&p, -10.0), item(&p, -5.0)];
        let sorted = sort_back_to_front(&items, Vec3::ZERO);
        let depths: Vec<f32> = sorted.iter().map(|i| i.model.w_axis.z).collect();
        assert_eq!(depths, [-10.0, -5.0, -1.0]);
    }

    #[test]
    fn render_items_draws_one_instance_per_item() {
        let p = Pipeline::create(Shader::named("p"), Arc::new(State::new()));
        let items = [item(&p, 0.0), item(&p, 1.0)];
        let refs: Vec<&RenderItem> = items.iter().collect();
        let mut batch = Batch::new("items");
        render_items(&mut batch, &refs);
        assert_eq!(batch.draw_call_count(), 2);
        assert!(matches!(
            batch.commands()[3],
            ember_gpu::Command::DrawInstanced { start_instance: 1, .. }
        ));
    }
}
