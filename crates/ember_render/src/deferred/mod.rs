//! Deferred Renderer
//!
//! [`RenderDeferredTask::build`] adds the jobs of the deferred pipeline to a
//! [`TaskBuilder`]. Each job records its own batches against the shared
//! context; data flows between jobs through [`Varying`] slots.
//!
//! ```text
//! AntialiasingSetup ─► PreparePrimaryBuffer ─► DeferredFrameTransform ─► LightingModel
//!   ─► [opaque]     PrepareDeferred ─► DrawOpaqueDeferred
//!   ─► LinearDepth ─► SurfaceGeometry ─► AmbientOcclusion ─► LightClustering
//!   ─► RenderDeferred ─► Background ─► Haze ─► DrawTransparentDeferred
//!   ─► [highlight]  DrawHighlight
//!   ─► [overlays]   DrawOverlayInFront (opaque, transparent)
//!   ─► Antialiasing ─► Bloom ─► ToneMapping
//!   ─► [post]       debug ─► PrimaryBufferUpscale ─► HUD ─► DrawOverlayHUD
//!   ─► Blit
//! ```
//!
//! Bracketed phases are timed by GPU range timers.

pub mod antialiasing;
pub mod draw;
pub mod frame_transform;
pub mod framebuffer;
pub mod lighting;
pub mod post;
pub mod timer;

use std::sync::Arc;

use ember_gpu::{Batch, Framebuffer, Pipeline, Primitive, Shader, State};
use glam::UVec2;

pub use antialiasing::{Antialiasing, AntialiasingInputs, AntialiasingSetup, TaaParams, halton, jitter_sequence};
pub use draw::{
    DrawBackgroundStage, DrawDeferred, DrawHaze, DrawHighlight, DrawInputs, DrawOverlay3D, DrawStateSortDeferred,
    ObjectBuffer,
};
pub use frame_transform::{DeferredFrameTransform, FrameTransformParams, GenerateDeferredFrameTransform};
pub use framebuffer::{
    DeferredFramebuffer, DeferredFramebufferType, PrepareDeferred, PreparePrimaryFramebuffer, ScaledPrimary,
    SetDeferredFramebuffer,
};
pub use lighting::{
    AmbientOcclusion, LightClustering, LightingModel, LinearDepth, MakeLightingModel, RenderDeferred,
    RenderDeferredInputs, SurfaceGeometry,
};
pub use post::{Blit, Bloom, CompositeHud, DebugDeferredBuffer, DebugInputs, ToneCurve, ToneMapping, Upsample};
pub use timer::{BeginGpuRangeTimer, EndGpuRangeTimer, GpuTimings};

use crate::args::{ItemLayer, RenderItems};
use crate::settings::DeferredSettings;
use crate::task::{TaskBuilder, Varying};

/// Saved transform slot holding the main view of the frame.
pub const MAIN_VIEW_SLOT: u32 = 0;
/// Saved transform slot holding the skybox view.
pub const BACKGROUND_VIEW_SLOT: u32 = 1;

/// Binding slots shared by the deferred shaders.
pub mod slot {
    pub mod uniform {
        pub const DEFERRED_FRAME_TRANSFORM: u32 = 0;
        pub const LIGHTING_MODEL: u32 = 1;
        pub const TAA_PARAMS: u32 = 2;
        pub const HAZE_PARAMS: u32 = 3;
        pub const BLOOM_PARAMS: u32 = 4;
        pub const TONE_MAPPING_PARAMS: u32 = 5;
        pub const AMBIENT_OCCLUSION_PARAMS: u32 = 6;
        pub const HIGHLIGHT_PARAMS: u32 = 7;
        /// The antialiasing blend runs with nothing else bound.
        pub const BLEND_PARAMS: u32 = 0;
    }

    pub mod buffer {
        pub const OBJECTS: u32 = 0;
        pub const LIGHT_CLUSTER_GRID: u32 = 1;
    }

    pub mod texture {
        pub const SOURCE: u32 = 0;
        pub const DEFERRED_COLOR: u32 = 0;
        pub const DEFERRED_NORMAL: u32 = 1;
        pub const DEFERRED_SPECULAR: u32 = 2;
        pub const DEPTH: u32 = 3;
        pub const LINEAR_DEPTH: u32 = 4;
        pub const CURVATURE: u32 = 5;
        pub const AMBIENT_OCCLUSION: u32 = 6;
        pub const BLEND_SOURCE: u32 = 0;
        pub const TAA_HISTORY: u32 = 10;
        pub const TAA_SOURCE: u32 = 11;
        pub const TAA_VELOCITY: u32 = 12;
        pub const TAA_INTENSITY: u32 = 13;
        pub const TAA_DEPTH: u32 = 14;
        pub const TAA_NEXT: u32 = 15;
    }
}

/// Pipeline of a full-screen pass: `shader` with the default state, then
/// whatever `configure` sets.
pub(crate) fn fullscreen_pipeline(shader: &str, configure: impl FnOnce(&mut State)) -> Arc<Pipeline> {
    let mut state = State::new();
    configure(&mut state);
    Pipeline::create(Shader::named(shader), Arc::new(state))
}

/// Draws the full-screen quad.
#[inline]
pub(crate) fn draw_fullscreen(batch: &mut Batch) {
    batch.draw(Primitive::TriangleStrip, 4);
}

/// Returns the framebuffer in `slot`, reallocating it when its size is not
/// `size`.
pub(crate) fn resize_framebuffer(
    slot: &mut Option<Arc<Framebuffer>>,
    label: &str,
    size: UVec2,
    formats: &[wgpu::TextureFormat],
) -> Arc<Framebuffer> {
    if let Some(fb) = slot.as_ref().filter(|fb| fb.size() == size) {
        return fb.clone();
    }
    log::debug!("{label}: allocating {}x{}", size.x, size.y);
    let fb = Framebuffer::create(label, size.x, size.y, formats, None);
    *slot = Some(fb.clone());
    fb
}

/// Inputs of the deferred task.
#[derive(Clone, Default)]
pub struct DeferredInputs {
    pub items: Varying<RenderItems>,
}

/// Timings of the profiled phases.
#[derive(Clone, Default)]
pub struct PhaseTimings {
    pub opaque: Varying<GpuTimings>,
    pub highlight: Varying<GpuTimings>,
    pub overlays_in_front: Varying<GpuTimings>,
    pub tone_and_post: Varying<GpuTimings>,
}

/// Slots written by the deferred task that callers may read after a run.
#[derive(Clone, Default)]
pub struct DeferredOutputs {
    pub primary: Varying<ScaledPrimary>,
    pub frame_transform: Varying<DeferredFrameTransform>,
    pub deferred: Varying<Arc<DeferredFramebuffer>>,
    /// Final image at display resolution, the source of the blit.
    pub output: Varying<Arc<Framebuffer>>,
    pub timings: PhaseTimings,
}

/// Builder of the deferred task.
pub struct RenderDeferredTask;

impl RenderDeferredTask {
    pub fn build(builder: &mut TaskBuilder, inputs: DeferredInputs, settings: &DeferredSettings) -> DeferredOutputs {
        let outputs = DeferredOutputs::default();
        let items = inputs.items;

        builder.add_job("AntialiasingSetup", AntialiasingSetup::new(settings.antialiasing_setup));
        builder.add_job(
            "PreparePrimaryBuffer",
            PreparePrimaryFramebuffer::new(settings.resolution_scale, outputs.primary.clone()),
        );
        builder.add_job(
            "DeferredFrameTransform",
            GenerateDeferredFrameTransform::new(outputs.frame_transform.clone()),
        );
        let lighting_model = Varying::new();
        builder.add_job("LightingModel", MakeLightingModel::new(settings, lighting_model.clone()));

        let draw_inputs = DrawInputs {
            frame_transform: outputs.frame_transform.clone(),
            items: items.clone(),
            lighting_model: lighting_model.clone(),
        };

        // Opaque G-buffer fill.
        let opaque_timer = Varying::new();
        builder.add_job("BeginOpaqueRangeTimer", BeginGpuRangeTimer::new("DrawOpaques", opaque_timer.clone()));
        builder.add_job(
            "PrepareDeferred",
            PrepareDeferred::new(outputs.primary.clone(), outputs.deferred.clone(), Varying::new()),
        );
        builder.add_job("DrawOpaqueDeferred", DrawStateSortDeferred::new(draw_inputs.clone()));
        builder.add_job(
            "OpaqueRangeTimer",
            EndGpuRangeTimer::new(opaque_timer, outputs.timings.opaque.clone()),
        );

        // Screen-space inputs of the lighting pass.
        let linear_depth = Varying::new();
        builder.add_job(
            "LinearDepth",
            LinearDepth::new(outputs.frame_transform.clone(), outputs.deferred.clone(), linear_depth.clone()),
        );
        let curvature = Varying::new();
        builder.add_job(
            "SurfaceGeometry",
            SurfaceGeometry::new(
                outputs.frame_transform.clone(),
                outputs.deferred.clone(),
                linear_depth.clone(),
                curvature.clone(),
            ),
        );
        let ambient_occlusion = Varying::new();
        builder.add_job(
            "AmbientOcclusion",
            AmbientOcclusion::new(
                outputs.frame_transform.clone(),
                outputs.deferred.clone(),
                linear_depth.clone(),
                ambient_occlusion.clone(),
            ),
        );
        let light_clusters = Varying::new();
        builder.add_job(
            "LightClustering",
            LightClustering::new(outputs.frame_transform.clone(), light_clusters.clone()),
        );
        builder.add_job(
            "RenderDeferred",
            RenderDeferred::new(
                RenderDeferredInputs {
                    frame_transform: outputs.frame_transform.clone(),
                    deferred: outputs.deferred.clone(),
                    lighting_model: lighting_model.clone(),
                    linear_depth: linear_depth.clone(),
                    curvature: curvature.clone(),
                    ambient_occlusion: ambient_occlusion.clone(),
                    light_clusters: light_clusters.clone(),
                },
                settings.render_shadows,
            ),
        );

        builder.add_job(
            "SetDeferredFramebufferBackground",
            SetDeferredFramebuffer::new(DeferredFramebufferType::Full, outputs.deferred.clone()),
        );
        builder.add_job(
            "DrawBackgroundDeferred",
            DrawBackgroundStage::new(items.clone(), lighting_model.clone()),
        );
        builder.add_job(
            "SetDeferredFramebufferHaze",
            SetDeferredFramebuffer::new(DeferredFramebufferType::Lighting, outputs.deferred.clone()),
        );
        builder.add_job(
            "DrawHazeDeferred",
            DrawHaze::new(outputs.frame_transform.clone(), lighting_model.clone(), linear_depth.clone()),
        );
        builder.add_job(
            "DrawTransparentDeferred",
            DrawDeferred::new(draw_inputs.clone(), light_clusters),
        );

        let highlight_timer = Varying::new();
        builder.add_job(
            "BeginHighlightRangeTimer",
            BeginGpuRangeTimer::new("Highlight", highlight_timer.clone()),
        );
        builder.add_job(
            "DrawHighlight",
            DrawHighlight::new(outputs.frame_transform.clone(), items.clone(), outputs.deferred.clone()),
        );
        builder.add_job(
            "HighlightRangeTimer",
            EndGpuRangeTimer::new(highlight_timer, outputs.timings.highlight.clone()),
        );

        let overlays_timer = Varying::new();
        builder.add_job(
            "BeginOverlaysInFrontRangeTimer",
            BeginGpuRangeTimer::new("BeginOverlaysInFrontRangeTimer", overlays_timer.clone()),
        );
        builder.add_job(
            "SetOpaqueOverlayFramebuffer",
            SetDeferredFramebuffer::new(DeferredFramebufferType::LightingVelocity, outputs.deferred.clone()),
        );
        builder.add_job(
            "DrawOverlayInFrontOpaque",
            DrawOverlay3D::new(draw_inputs.clone(), ItemLayer::InFront, true, true),
        );
        builder.add_job(
            "SetTranslucentOverlayFramebuffer",
            SetDeferredFramebuffer::new(DeferredFramebufferType::Lighting, outputs.deferred.clone()),
        );
        builder.add_job(
            "DrawOverlayInFrontTransparent",
            DrawOverlay3D::new(draw_inputs.clone(), ItemLayer::InFront, false, false),
        );
        builder.add_job(
            "OverlaysInFrontRangeTimer",
            EndGpuRangeTimer::new(overlays_timer, outputs.timings.overlays_in_front.clone()),
        );

        builder.add_job(
            "Antialiasing",
            Antialiasing::new(
                AntialiasingInputs {
                    frame_transform: outputs.frame_transform.clone(),
                    deferred: outputs.deferred.clone(),
                    linear_depth: linear_depth.clone(),
                },
                &settings.antialiasing,
                Varying::new(),
            ),
        );
        builder.add_job("Bloom", Bloom::new(outputs.deferred.clone(), lighting_model));
        builder.add_job(
            "ToneMapping",
            ToneMapping::new(outputs.deferred.clone(), outputs.primary.clone()),
        );

        let post_timer = Varying::new();
        builder.add_job(
            "BeginToneAndPostRangeTimer",
            BeginGpuRangeTimer::new("PostToneOverlaysAntialiasing", post_timer.clone()),
        );
        if settings.debug_enabled {
            builder.add_job(
                "DebugDeferredBuffer",
                DebugDeferredBuffer::new(
                    DebugInputs {
                        deferred: outputs.deferred.clone(),
                        primary: outputs.primary.clone(),
                        linear_depth,
                        curvature,
                        ambient_occlusion,
                    },
                    settings.debug_mode,
                ),
            );
        }
        builder.add_job(
            "PrimaryBufferUpscale",
            Upsample::new(outputs.primary.clone(), outputs.output.clone()),
        );
        builder.add_job("HUD", CompositeHud::default());
        builder.add_job(
            "DrawOverlayHUDOpaque",
            DrawOverlay3D::new(draw_inputs.clone(), ItemLayer::Hud, true, false),
        );
        builder.add_job(
            "DrawOverlayHUDTransparent",
            DrawOverlay3D::new(draw_inputs, ItemLayer::Hud, false, false),
        );
        builder.add_job(
            "ToneAndPostRangeTimer",
            EndGpuRangeTimer::new(post_timer, outputs.timings.tone_and_post.clone()),
        );
        builder.add_job("Blit", Blit::new(outputs.output.clone()));

        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_fit_default_limits() {
        let settings = ember_gpu::BackendSettings::default();
        let uniforms = [
            slot::uniform::DEFERRED_FRAME_TRANSFORM,
            slot::uniform::LIGHTING_MODEL,
            slot::uniform::TAA_PARAMS,
            slot::uniform::HAZE_PARAMS,
            slot::uniform::BLOOM_PARAMS,
            slot::uniform::TONE_MAPPING_PARAMS,
            slot::uniform::AMBIENT_OCCLUSION_PARAMS,
            slot::uniform::HIGHLIGHT_PARAMS,
        ];
        assert!(uniforms.iter().all(|&s| s < settings.max_uniform_buffers));
        assert!(slot::buffer::LIGHT_CLUSTER_GRID < settings.max_resource_buffers);
        assert!(slot::texture::TAA_NEXT < settings.max_resource_textures);
    }

    #[test]
    fn build_adds_jobs_in_pipeline_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut builder = TaskBuilder::new("RenderDeferredTask");
        RenderDeferredTask::build(&mut builder, DeferredInputs::default(), &DeferredSettings::default());
        let task = builder.build();
        let names: Vec<_> = task.job_names().collect();

        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert_eq!(names.first(), Some(&"AntialiasingSetup"));
        assert_eq!(names.last(), Some(&"Blit"));
        assert!(position("PrepareDeferred") < position("DrawOpaqueDeferred"));
        assert!(position("RenderDeferred") < position("DrawTransparentDeferred"));
        assert!(position("Antialiasing") < position("ToneMapping"));
        assert!(position("PrimaryBufferUpscale") < position("HUD"));
        assert!(!names.contains(&"DebugDeferredBuffer"));
    }

    #[test]
    fn debug_passes_follow_settings() {
        let mut builder = TaskBuilder::new("RenderDeferredTask");
        let settings = DeferredSettings {
            debug_enabled: true,
            ..Default::default()
        };
        RenderDeferredTask::build(&mut builder, DeferredInputs::default(), &settings);
        let task = builder.build();
        assert_eq!(task.is_enabled("DebugDeferredBuffer"), Some(true));
    }
}
