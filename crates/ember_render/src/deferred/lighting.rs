//! Lighting model, depth-derived buffers and the deferred lighting resolve.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_gpu::pipeline::BlendFunction;
use ember_gpu::{Buffer, ClearFlags, Framebuffer, Pipeline, State, StructBuffer, do_in_batch};
use glam::{UVec4, Vec4};

use super::frame_transform::DeferredFrameTransform;
use super::framebuffer::DeferredFramebuffer;
use super::{draw_fullscreen, fullscreen_pipeline, resize_framebuffer, slot};
use crate::args::RenderContext;
use crate::settings::DeferredSettings;
use crate::task::{Job, Varying};

fn flag(enabled: bool) -> f32 {
    if enabled { 1.0 } else { 0.0 }
}

/// Switches of the lighting shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingModelParams {
    /// `(unlit, emissive, lightmap, background)`.
    pub enable_0: Vec4,
    /// `(scattering, diffuse, specular, albedo)`.
    pub enable_1: Vec4,
    /// `(ambient, directional, point, spot)`.
    pub enable_2: Vec4,
    /// `(shadow, haze, bloom, ambient_occlusion)`.
    pub enable_3: Vec4,
}

impl Default for LightingModelParams {
    fn default() -> Self {
        Self {
            enable_0: Vec4::ONE,
            enable_1: Vec4::ONE,
            enable_2: Vec4::ONE,
            enable_3: Vec4::ONE,
        }
    }
}

/// The lighting model of the current run.
#[derive(Debug, Clone)]
pub struct LightingModel {
    pub buffer: Arc<Buffer>,
    pub background_enabled: bool,
    pub haze_enabled: bool,
    pub bloom_enabled: bool,
    pub shadows_enabled: bool,
}

/// Publishes the lighting model built from the task settings.
pub struct MakeLightingModel {
    params: StructBuffer<LightingModelParams>,
    model: LightingModel,
    output: Varying<LightingModel>,
}

impl MakeLightingModel {
    #[must_use]
    pub fn new(settings: &DeferredSettings, output: Varying<LightingModel>) -> Self {
        let mut params = StructBuffer::new("LightingModel", LightingModelParams::default());
        {
            let mut p = params.edit();
            p.enable_0.w = flag(settings.background_enabled);
            p.enable_3.x = flag(settings.render_shadows);
            p.enable_3.y = flag(settings.haze_enabled);
            p.enable_3.z = flag(settings.bloom_enabled);
        }
        let model = LightingModel {
            buffer: params.buffer().clone(),
            background_enabled: settings.background_enabled,
            haze_enabled: settings.haze_enabled,
            bloom_enabled: settings.bloom_enabled,
            shadows_enabled: settings.render_shadows,
        };
        Self { params, model, output }
    }

    #[must_use]
    pub fn params(&self) -> &LightingModelParams {
        self.params.get()
    }
}

impl Job for MakeLightingModel {
    fn run(&mut self, _ctx: &mut RenderContext) {
        self.output.set(self.model.clone());
    }
}

/// Converts the primary depth buffer into linear eye depth.
pub struct LinearDepth {
    frame_transform: Varying<DeferredFrameTransform>,
    deferred: Varying<Arc<DeferredFramebuffer>>,
    pipeline: Arc<Pipeline>,
    target: Option<Arc<Framebuffer>>,
    output: Varying<Arc<Framebuffer>>,
}

impl LinearDepth {
    #[must_use]
    pub fn new(
        frame_transform: Varying<DeferredFrameTransform>,
        deferred: Varying<Arc<DeferredFramebuffer>>,
        output: Varying<Arc<Framebuffer>>,
    ) -> Self {
        Self {
            frame_transform,
            deferred,
            pipeline: fullscreen_pipeline("linear_depth", |_| {}),
            target: None,
            output,
        }
    }
}

impl Job for LinearDepth {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred)) = (self.frame_transform.get(), self.deferred.get()) else {
            return;
        };
        let target = resize_framebuffer(
            &mut self.target,
            "LinearDepth",
            deferred.size(),
            &[wgpu::TextureFormat::R32Float],
        );
        self.output.set(target.clone());

        let viewport = ctx.args.viewport;
        let far = ctx.args.far_clip;
        do_in_batch("LinearDepth::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(&target));
            batch.clear_color_framebuffer(ClearFlags::COLOR0, Vec4::new(far, 0.0, 0.0, 0.0));

            batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
            batch.set_resource_texture(slot::texture::DEPTH, Some(deferred.primary_depth_texture()));
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);

            batch.set_resource_texture(slot::texture::DEPTH, None);
        });
    }
}

/// Evaluates surface curvature from the normals and linear depth.
pub struct SurfaceGeometry {
    frame_transform: Varying<DeferredFrameTransform>,
    deferred: Varying<Arc<DeferredFramebuffer>>,
    linear_depth: Varying<Arc<Framebuffer>>,
    pipeline: Arc<Pipeline>,
    target: Option<Arc<Framebuffer>>,
    output: Varying<Arc<Framebuffer>>,
}

impl SurfaceGeometry {
    #[must_use]
    pub fn new(
        frame_transform: Varying<DeferredFrameTransform>,
        deferred: Varying<Arc<DeferredFramebuffer>>,
        linear_depth: Varying<Arc<Framebuffer>>,
        output: Varying<Arc<Framebuffer>>,
    ) -> Self {
        Self {
            frame_transform,
            deferred,
            linear_depth,
            pipeline: fullscreen_pipeline("surface_geometry_curvature", |_| {}),
            target: None,
            output,
        }
    }
}

impl Job for SurfaceGeometry {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred), Some(linear_depth)) =
            (self.frame_transform.get(), self.deferred.get(), self.linear_depth.get())
        else {
            return;
        };
        let target = resize_framebuffer(
            &mut self.target,
            "Curvature",
            deferred.size(),
            &[wgpu::TextureFormat::Rgba16Float],
        );
        self.output.set(target.clone());

        let viewport = ctx.args.viewport;
        do_in_batch("SurfaceGeometry::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(&target));

            batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
            batch.set_resource_texture(slot::texture::DEFERRED_NORMAL, deferred.normal_texture());
            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, linear_depth.render_buffer(0));
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);

            batch.set_resource_texture(slot::texture::DEFERRED_NORMAL, None);
            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, None);
        });
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AmbientOcclusionParams {
    /// `(radius, radius², 1 / radius², intensity)`.
    pub radius_info: Vec4,
    /// `(sample_count, spiral_turns, falloff_angle, 0)`.
    pub sampling_info: Vec4,
}

impl Default for AmbientOcclusionParams {
    fn default() -> Self {
        let radius: f32 = 0.5;
        Self {
            radius_info: Vec4::new(radius, radius * radius, 1.0 / (radius * radius), 1.0),
            sampling_info: Vec4::new(16.0, 7.0, 0.01, 0.0),
        }
    }
}

/// Screen-space ambient occlusion from the linear depth.
pub struct AmbientOcclusion {
    frame_transform: Varying<DeferredFrameTransform>,
    deferred: Varying<Arc<DeferredFramebuffer>>,
    linear_depth: Varying<Arc<Framebuffer>>,
    params: StructBuffer<AmbientOcclusionParams>,
    pipeline: Arc<Pipeline>,
    target: Option<Arc<Framebuffer>>,
    output: Varying<Arc<Framebuffer>>,
}

impl AmbientOcclusion {
    #[must_use]
    pub fn new(
        frame_transform: Varying<DeferredFrameTransform>,
        deferred: Varying<Arc<DeferredFramebuffer>>,
        linear_depth: Varying<Arc<Framebuffer>>,
        output: Varying<Arc<Framebuffer>>,
    ) -> Self {
        Self {
            frame_transform,
            deferred,
            linear_depth,
            params: StructBuffer::new("AmbientOcclusionParams", AmbientOcclusionParams::default()),
            pipeline: fullscreen_pipeline("ssao_make_occlusion", |_| {}),
            target: None,
            output,
        }
    }
}

impl Job for AmbientOcclusion {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred), Some(linear_depth)) =
            (self.frame_transform.get(), self.deferred.get(), self.linear_depth.get())
        else {
            return;
        };
        let target = resize_framebuffer(
            &mut self.target,
            "AmbientOcclusion",
            deferred.size(),
            &[wgpu::TextureFormat::R8Unorm],
        );
        self.output.set(target.clone());

        let viewport = ctx.args.viewport;
        do_in_batch("AmbientOcclusion::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(&target));
            batch.clear_color_framebuffer(ClearFlags::COLOR0, Vec4::ONE);

            batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
            batch.set_uniform_buffer_view(slot::uniform::AMBIENT_OCCLUSION_PARAMS, &self.params.view());
            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, linear_depth.render_buffer(0));
            batch.set_resource_texture(slot::texture::DEFERRED_NORMAL, deferred.normal_texture());
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);

            batch.set_resource_texture(slot::texture::LINEAR_DEPTH, None);
            batch.set_resource_texture(slot::texture::DEFERRED_NORMAL, None);
            batch.set_uniform_buffer(slot::uniform::AMBIENT_OCCLUSION_PARAMS, None, 0, 0);
        });
    }
}

/// Dimensions of the froxel grid lights are binned into.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightClusterGrid {
    /// `(x, y, z, 0)` cell counts.
    pub dims: UVec4,
    /// `(near, far, far / near, 0)` of the clustered range.
    pub range: Vec4,
}

impl Default for LightClusterGrid {
    fn default() -> Self {
        Self {
            dims: UVec4::new(16, 12, 16, 0),
            range: Vec4::new(0.1, 200.0, 2000.0, 0.0),
        }
    }
}

/// Fits the light cluster grid to the current frustum.
pub struct LightClustering {
    frame_transform: Varying<DeferredFrameTransform>,
    grid: StructBuffer<LightClusterGrid>,
    output: Varying<Arc<Buffer>>,
}

impl LightClustering {
    #[must_use]
    pub fn new(frame_transform: Varying<DeferredFrameTransform>, output: Varying<Arc<Buffer>>) -> Self {
        Self {
            frame_transform,
            grid: StructBuffer::new("LightClusterGrid", LightClusterGrid::default()),
            output,
        }
    }

    #[must_use]
    pub fn grid(&self) -> &LightClusterGrid {
        self.grid.get()
    }
}

impl Job for LightClustering {
    fn run(&mut self, ctx: &mut RenderContext) {
        if !self.frame_transform.is_set() {
            return;
        }
        let near = ctx.args.near_clip.max(f32::EPSILON);
        let far = ctx.args.far_clip.max(near);
        let range = Vec4::new(near, far, far / near, 0.0);
        if self.grid.get().range != range {
            self.grid.edit().range = range;
        }
        self.output.set(self.grid.buffer().clone());
    }
}

/// Resolves the G-buffer into the lighting framebuffer.
pub struct RenderDeferred {
    frame_transform: Varying<DeferredFrameTransform>,
    deferred: Varying<Arc<DeferredFramebuffer>>,
    lighting_model: Varying<LightingModel>,
    linear_depth: Varying<Arc<Framebuffer>>,
    curvature: Varying<Arc<Framebuffer>>,
    ambient_occlusion: Varying<Arc<Framebuffer>>,
    light_clusters: Varying<Arc<Buffer>>,
    pipeline: Arc<Pipeline>,
    shadowed_pipeline: Arc<Pipeline>,
    render_shadows: bool,
}

/// Inputs of [`RenderDeferred`].
#[derive(Clone)]
pub struct RenderDeferredInputs {
    pub frame_transform: Varying<DeferredFrameTransform>,
    pub deferred: Varying<Arc<DeferredFramebuffer>>,
    pub lighting_model: Varying<LightingModel>,
    pub linear_depth: Varying<Arc<Framebuffer>>,
    pub curvature: Varying<Arc<Framebuffer>>,
    pub ambient_occlusion: Varying<Arc<Framebuffer>>,
    pub light_clusters: Varying<Arc<Buffer>>,
}

impl RenderDeferred {
    #[must_use]
    pub fn new(inputs: RenderDeferredInputs, render_shadows: bool) -> Self {
        let additive = |state: &mut State| state.set_blend_function(BlendFunction::additive());
        Self {
            frame_transform: inputs.frame_transform,
            deferred: inputs.deferred,
            lighting_model: inputs.lighting_model,
            linear_depth: inputs.linear_depth,
            curvature: inputs.curvature,
            ambient_occlusion: inputs.ambient_occlusion,
            light_clusters: inputs.light_clusters,
            pipeline: fullscreen_pipeline("deferred_light", additive),
            shadowed_pipeline: fullscreen_pipeline("deferred_light_shadow", additive),
            render_shadows,
        }
    }

    fn pipeline(&self, lighting_model: &LightingModel) -> &Arc<Pipeline> {
        if self.render_shadows && lighting_model.shadows_enabled {
            &self.shadowed_pipeline
        } else {
            &self.pipeline
        }
    }
}

impl Job for RenderDeferred {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred), Some(lighting_model)) =
            (self.frame_transform.get(), self.deferred.get(), self.lighting_model.get())
        else {
            return;
        };
        let linear_depth = self.linear_depth.get();
        let curvature = self.curvature.get();
        let ambient_occlusion = self.ambient_occlusion.get();
        let light_clusters = self.light_clusters.get();
        let pipeline = self.pipeline(&lighting_model);

        let viewport = ctx.args.viewport;
        do_in_batch("RenderDeferred::run", &ctx.context, |batch| {
            batch.set_framebuffer(Some(deferred.lighting_framebuffer()));
            batch.set_viewport_transform(viewport);
            batch.set_state_scissor_rect(viewport);

            batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
            batch.set_uniform_buffer(slot::uniform::LIGHTING_MODEL, Some(&lighting_model.buffer), 0, 0);
            batch.set_resource_buffer(slot::buffer::LIGHT_CLUSTER_GRID, light_clusters.as_ref());

            batch.set_resource_texture(slot::texture::DEFERRED_COLOR, deferred.color_texture());
            batch.set_resource_texture(slot::texture::DEFERRED_NORMAL, deferred.normal_texture());
            batch.set_resource_texture(slot::texture::DEFERRED_SPECULAR, deferred.specular_texture());
            batch.set_resource_texture(slot::texture::DEPTH, Some(deferred.primary_depth_texture()));
            batch.set_resource_texture(
                slot::texture::LINEAR_DEPTH,
                linear_depth.as_ref().and_then(|fb| fb.render_buffer(0)),
            );
            batch.set_resource_texture(
                slot::texture::CURVATURE,
                curvature.as_ref().and_then(|fb| fb.render_buffer(0)),
            );
            batch.set_resource_texture(
                slot::texture::AMBIENT_OCCLUSION,
                ambient_occlusion.as_ref().and_then(|fb| fb.render_buffer(0)),
            );

            batch.set_pipeline(Some(pipeline));
            draw_fullscreen(batch);

            for texture_slot in [
                slot::texture::DEFERRED_COLOR,
                slot::texture::DEFERRED_NORMAL,
                slot::texture::DEFERRED_SPECULAR,
                slot::texture::DEPTH,
                slot::texture::LINEAR_DEPTH,
                slot::texture::CURVATURE,
                slot::texture::AMBIENT_OCCLUSION,
            ] {
                batch.set_resource_texture(texture_slot, None);
            }
            batch.set_resource_buffer(slot::buffer::LIGHT_CLUSTER_GRID, None);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lighting_model_reflects_settings() {
        let settings = DeferredSettings {
            haze_enabled: false,
            render_shadows: false,
            ..Default::default()
        };
        let job = MakeLightingModel::new(&settings, Varying::new());
        assert_eq!(job.params().enable_3.x, 0.0);
        assert_eq!(job.params().enable_3.y, 0.0);
        assert_eq!(job.params().enable_3.z, 1.0);
        assert_eq!(job.params().enable_0.w, 1.0);
    }
}
