//! Post-processing and output: bloom, tone mapping, debug views, upscale,
//! HUD composite and the final blit.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_gpu::pipeline::BlendFunction;
use ember_gpu::{Framebuffer, Pipeline, State, StructBuffer, Texture, do_in_batch};
use glam::{IVec4, UVec2, Vec4};
use smallvec::{SmallVec, smallvec};

use super::framebuffer::{DeferredFramebuffer, ScaledPrimary};
use super::lighting::LightingModel;
use super::{MAIN_VIEW_SLOT, draw_fullscreen, fullscreen_pipeline, resize_framebuffer, slot};
use crate::args::{RenderContext, RenderMode};
use crate::settings::DebugMode;
use crate::task::{Job, Varying};

const BLOOM_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const OUTPUT_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const OUTPUT_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BloomParams {
    /// `(threshold, intensity, size, 0)`.
    pub params: Vec4,
    /// Blur direction in texels, `(x, y, 0, 0)`.
    pub direction: Vec4,
}

impl Default for BloomParams {
    fn default() -> Self {
        Self {
            params: Vec4::new(0.9, 0.25, 0.7, 0.0),
            direction: Vec4::ZERO,
        }
    }
}

/// Extracts the bright parts of the lighting buffer at half resolution,
/// blurs them and adds them back.
pub struct Bloom {
    deferred: Varying<Arc<DeferredFramebuffer>>,
    lighting_model: Varying<LightingModel>,
    params: [StructBuffer<BloomParams>; 3],
    threshold_pipeline: Arc<Pipeline>,
    blur_pipeline: Arc<Pipeline>,
    apply_pipeline: Arc<Pipeline>,
    threshold: Option<Arc<Framebuffer>>,
    blur: [Option<Arc<Framebuffer>>; 2],
}

impl Bloom {
    #[must_use]
    pub fn new(deferred: Varying<Arc<DeferredFramebuffer>>, lighting_model: Varying<LightingModel>) -> Self {
        let pass_params = |label: &str, direction: Vec4| {
            StructBuffer::new(
                label,
                BloomParams {
                    direction,
                    ..BloomParams::default()
                },
            )
        };
        Self {
            deferred,
            lighting_model,
            params: [
                pass_params("BloomThresholdParams", Vec4::ZERO),
                pass_params("BloomBlurXParams", Vec4::X),
                pass_params("BloomBlurYParams", Vec4::Y),
            ],
            threshold_pipeline: fullscreen_pipeline("bloom_threshold", |_| {}),
            blur_pipeline: fullscreen_pipeline("bloom_blur", |_| {}),
            apply_pipeline: fullscreen_pipeline("bloom_apply", |state| {
                state.set_blend_function(BlendFunction::additive());
            }),
            threshold: None,
            blur: [None, None],
        }
    }
}

impl Job for Bloom {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(deferred), Some(lighting_model)) = (self.deferred.get(), self.lighting_model.get()) else {
            return;
        };
        if !lighting_model.bloom_enabled {
            return;
        }

        let size = (deferred.size() / 2).max(UVec2::ONE);
        let threshold = resize_framebuffer(&mut self.threshold, "BloomThreshold", size, &[BLOOM_FORMAT]);
        let blur_x = resize_framebuffer(&mut self.blur[0], "BloomBlurX", size, &[BLOOM_FORMAT]);
        let blur_y = resize_framebuffer(&mut self.blur[1], "BloomBlurY", size, &[BLOOM_FORMAT]);
        let half_viewport = IVec4::new(0, 0, size.x as i32, size.y as i32);
        let viewport = ctx.args.viewport;

        do_in_batch("Bloom::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(half_viewport);

            let passes = [
                (&threshold, &self.threshold_pipeline, deferred.lighting_texture()),
                (&blur_x, &self.blur_pipeline, threshold.render_buffer(0)),
                (&blur_y, &self.blur_pipeline, blur_x.render_buffer(0)),
            ];
            for ((target, pipeline, source), params) in passes.into_iter().zip(&self.params) {
                batch.set_framebuffer(Some(target));
                batch.set_uniform_buffer_view(slot::uniform::BLOOM_PARAMS, &params.view());
                batch.set_resource_texture(slot::texture::SOURCE, source);
                batch.set_pipeline(Some(pipeline));
                draw_fullscreen(batch);
            }

            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(deferred.lighting_framebuffer()));
            batch.set_resource_texture(slot::texture::SOURCE, blur_y.render_buffer(0));
            batch.set_pipeline(Some(&self.apply_pipeline));
            draw_fullscreen(batch);

            batch.set_resource_texture(slot::texture::SOURCE, None);
            batch.set_uniform_buffer(slot::uniform::BLOOM_PARAMS, None, 0, 0);
        });
    }
}

/// Curve mapping HDR lighting into display range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ToneCurve {
    None = 0,
    #[default]
    Gamma22 = 1,
    Reinhard = 2,
    Filmic = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ToneMappingParams {
    /// `(exposure, 2^exposure, 0, 0)`.
    pub exposure: Vec4,
    pub curve: u32,
    pub _pad: [u32; 3],
}

impl ToneMappingParams {
    #[must_use]
    pub fn new(exposure: f32, curve: ToneCurve) -> Self {
        Self {
            exposure: Vec4::new(exposure, exposure.exp2(), 0.0, 0.0),
            curve: curve as u32,
            _pad: [0; 3],
        }
    }
}

impl Default for ToneMappingParams {
    fn default() -> Self {
        Self::new(0.0, ToneCurve::default())
    }
}

/// Maps the lighting buffer into the primary framebuffer.
pub struct ToneMapping {
    deferred: Varying<Arc<DeferredFramebuffer>>,
    primary: Varying<ScaledPrimary>,
    params: StructBuffer<ToneMappingParams>,
    pipeline: Arc<Pipeline>,
}

impl ToneMapping {
    #[must_use]
    pub fn new(deferred: Varying<Arc<DeferredFramebuffer>>, primary: Varying<ScaledPrimary>) -> Self {
        Self {
            deferred,
            primary,
            params: StructBuffer::new("ToneMappingParams", ToneMappingParams::default()),
            pipeline: fullscreen_pipeline("tone_mapping", |_| {}),
        }
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.params.edit().exposure = Vec4::new(exposure, exposure.exp2(), 0.0, 0.0);
    }

    pub fn set_curve(&mut self, curve: ToneCurve) {
        self.params.edit().curve = curve as u32;
    }

    #[must_use]
    pub fn params(&self) -> &ToneMappingParams {
        self.params.get()
    }
}

impl Job for ToneMapping {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(deferred), Some(primary)) = (self.deferred.get(), self.primary.get()) else {
            return;
        };
        let viewport = ctx.args.viewport;
        do_in_batch("ToneMapping::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(&primary.framebuffer));
            batch.set_uniform_buffer_view(slot::uniform::TONE_MAPPING_PARAMS, &self.params.view());
            batch.set_resource_texture(slot::texture::SOURCE, deferred.lighting_texture());
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);
            batch.set_resource_texture(slot::texture::SOURCE, None);
        });
    }
}

/// Inputs of [`DebugDeferredBuffer`].
#[derive(Clone, Default)]
pub struct DebugInputs {
    pub deferred: Varying<Arc<DeferredFramebuffer>>,
    pub primary: Varying<ScaledPrimary>,
    pub linear_depth: Varying<Arc<Framebuffer>>,
    pub curvature: Varying<Arc<Framebuffer>>,
    pub ambient_occlusion: Varying<Arc<Framebuffer>>,
}

/// Shows one of the intermediate buffers over the primary framebuffer.
pub struct DebugDeferredBuffer {
    inputs: DebugInputs,
    mode: DebugMode,
    pipeline: Arc<Pipeline>,
}

impl DebugDeferredBuffer {
    #[must_use]
    pub fn new(inputs: DebugInputs, mode: DebugMode) -> Self {
        Self {
            inputs,
            mode,
            pipeline: fullscreen_pipeline("debug_deferred_buffer", |_| {}),
        }
    }

    pub fn set_mode(&mut self, mode: DebugMode) {
        self.mode = mode;
    }

    fn source(&self, deferred: &DeferredFramebuffer) -> Option<Arc<Texture>> {
        let first = |fb: Option<Arc<Framebuffer>>| fb.and_then(|fb| fb.render_buffer(0).cloned());
        match self.mode {
            DebugMode::Albedo => deferred.color_texture().cloned(),
            DebugMode::Normal => deferred.normal_texture().cloned(),
            DebugMode::Specular => deferred.specular_texture().cloned(),
            DebugMode::Velocity => deferred.velocity_texture().cloned(),
            DebugMode::Lighting => deferred.lighting_texture().cloned(),
            DebugMode::LinearDepth => first(self.inputs.linear_depth.get()),
            DebugMode::Curvature => first(self.inputs.curvature.get()),
            DebugMode::AmbientOcclusion => first(self.inputs.ambient_occlusion.get()),
        }
    }
}

impl Job for DebugDeferredBuffer {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(deferred), Some(primary)) = (self.inputs.deferred.get(), self.inputs.primary.get()) else {
            return;
        };
        let Some(source) = self.source(&deferred) else {
            log::debug!("DebugDeferredBuffer: {:?} is not available", self.mode);
            return;
        };
        let viewport = ctx.args.viewport;
        do_in_batch("DebugDeferredBuffer::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_framebuffer(Some(&primary.framebuffer));
            batch.set_resource_texture(slot::texture::SOURCE, Some(&source));
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);
            batch.set_resource_texture(slot::texture::SOURCE, None);
        });
    }
}

/// Scales the primary framebuffer up to the display viewport and restores
/// that viewport for the remaining jobs. The output stays bound.
pub struct Upsample {
    primary: Varying<ScaledPrimary>,
    pipeline: Arc<Pipeline>,
    target: Option<Arc<Framebuffer>>,
    output: Varying<Arc<Framebuffer>>,
}

impl Upsample {
    #[must_use]
    pub fn new(primary: Varying<ScaledPrimary>, output: Varying<Arc<Framebuffer>>) -> Self {
        Self {
            primary,
            pipeline: fullscreen_pipeline("upsample", |_| {}),
            target: None,
            output,
        }
    }

    fn target(&mut self, size: UVec2) -> Arc<Framebuffer> {
        match &self.target {
            Some(fb) if fb.size() == size => fb.clone(),
            _ => {
                log::debug!("Upsample: allocating {}x{}", size.x, size.y);
                let fb = Framebuffer::create(
                    "UpsampledFramebuffer",
                    size.x,
                    size.y,
                    &[OUTPUT_COLOR_FORMAT],
                    Some(OUTPUT_DEPTH_FORMAT),
                );
                self.target = Some(fb.clone());
                fb
            }
        }
    }
}

impl Job for Upsample {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some(primary) = self.primary.get() else {
            return;
        };
        let display = primary.display_viewport;
        ctx.args.viewport = display;
        let display_size = ctx.args.viewport_size();

        if primary.framebuffer.size() == display_size {
            self.target = None;
            self.output.set(primary.framebuffer.clone());
            return;
        }

        let target = self.target(display_size);
        self.output.set(target.clone());
        do_in_batch("Upsample::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(display);
            batch.set_state_scissor_rect(display);
            batch.set_framebuffer(Some(&target));
            batch.set_resource_texture(slot::texture::SOURCE, primary.framebuffer.render_buffer(0));
            batch.set_pipeline(Some(&self.pipeline));
            draw_fullscreen(batch);
            batch.set_resource_texture(slot::texture::SOURCE, None);
        });
    }
}

/// Composites the HUD texture over the bound framebuffer.
pub struct CompositeHud {
    pipeline: Arc<Pipeline>,
    mirrored_pipeline: Arc<Pipeline>,
}

impl Default for CompositeHud {
    fn default() -> Self {
        let blend = |state: &mut State| state.set_blend_function(BlendFunction::alpha_blending());
        Self {
            pipeline: fullscreen_pipeline("hud", blend),
            mirrored_pipeline: fullscreen_pipeline("hud_mirror", blend),
        }
    }
}

impl Job for CompositeHud {
    fn run(&mut self, ctx: &mut RenderContext) {
        // Secondary cameras never show the HUD.
        if ctx.args.render_mode == RenderMode::SecondaryCamera {
            return;
        }
        let hud = ctx.args.hud_texture.clone();
        let pipeline = if ctx.args.render_mode == RenderMode::Mirror {
            &self.mirrored_pipeline
        } else {
            &self.pipeline
        };
        do_in_batch("CompositeHUD", &ctx.context, |batch| {
            batch.set_saved_view_projection_transform(MAIN_VIEW_SLOT);
            if let Some(hud) = &hud {
                batch.set_resource_texture(slot::texture::SOURCE, Some(hud));
                batch.set_pipeline(Some(pipeline));
                draw_fullscreen(batch);
                batch.set_resource_texture(slot::texture::SOURCE, None);
            }
        });
    }
}

/// Source and destination rectangles of the final blit, as
/// `(x0, y0, x1, y1)` corners.
#[must_use]
pub fn blit_rects(width: i32, height: i32, mode: RenderMode, stereo: bool) -> SmallVec<[(IVec4, IVec4); 2]> {
    let full = IVec4::new(0, 0, width, height);
    if mode != RenderMode::Mirror {
        return smallvec![(full, full)];
    }
    if !stereo {
        return smallvec![(full, IVec4::new(width, 0, 0, height))];
    }
    // Mirrored stereo swaps the eyes as well as flipping each one.
    let half = width / 2;
    let left = IVec4::new(0, 0, half, height);
    let right = IVec4::new(half, 0, width, height);
    let flip = |rect: IVec4| IVec4::new(rect.z, rect.y, rect.x, rect.w);
    smallvec![(right, flip(left)), (left, flip(right))]
}

/// Copies the final image into the display framebuffer.
pub struct Blit {
    source: Varying<Arc<Framebuffer>>,
}

impl Blit {
    #[must_use]
    pub fn new(source: Varying<Arc<Framebuffer>>) -> Self {
        Self { source }
    }
}

impl Job for Blit {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some(destination) = ctx.args.blit_framebuffer.clone() else {
            log::warn!("Blit::run - no blit framebuffer");
            return;
        };
        let Some(source) = self.source.get() else {
            return;
        };
        let rects = blit_rects(
            ctx.args.viewport.z,
            ctx.args.viewport.w,
            ctx.args.render_mode,
            ctx.is_stereo(),
        );
        do_in_batch("Blit", &ctx.context, |batch| {
            batch.set_framebuffer(Some(&destination));
            for (source_rect, destination_rect) in rects {
                batch.blit(&source, source_rect, destination_rect);
            }
        });
    }
}
