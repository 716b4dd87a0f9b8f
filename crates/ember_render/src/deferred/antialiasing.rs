//! Temporal antialiasing.
//!
//! [`AntialiasingSetup`] records the sub-pixel jitter sequence at the start
//! of the frame. Every draw with jitter enabled offsets its projection by
//! the sample of the current frame, and [`Antialiasing`] resolves the
//! jittered image against the history kept in a two-framebuffer swap chain:
//!
//! ```text
//!   history = chain[0]  ──┐
//!   source (lighting)   ──┼─► TAA ─► chain[1] ─► blend ─► lighting
//!   velocity, intensity ──┘
//!   advance(chain): chain[1] becomes next frame's chain[0]
//! ```

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use ember_gpu::pipeline::{StencilFace, StencilTest};
use ember_gpu::{
    Buffer, ClearFlags, Framebuffer, FramebufferSwapChain, Pipeline, StructBuffer, Texture, TextureDesc,
    do_in_batch,
};
use glam::{IVec4, UVec2, Vec2, Vec4};

use super::frame_transform::DeferredFrameTransform;
use super::framebuffer::DeferredFramebuffer;
use super::{draw_fullscreen, fullscreen_pipeline, slot};
use crate::args::RenderContext;
use crate::settings::{AntialiasingConfig, AntialiasingSetupConfig, JITTER_SEQUENCE_LENGTH};
use crate::task::{Job, Varying};

/// Stencil bit of pixels excluded from antialiasing.
pub const STENCIL_NO_AA: u8 = 0x02;

/// Element `index` of the Halton low-discrepancy sequence in `base`.
/// Indices start at 1 internally, so element 0 is `1 / base`.
#[must_use]
pub fn halton(base: u32, index: u32) -> f32 {
    let inv_base = 1.0 / base as f32;
    let mut f = 1.0;
    let mut r = 0.0;
    let mut i = index + 1;
    while i > 0 {
        f *= inv_base;
        r += f * (i % base) as f32;
        i /= base;
    }
    r
}

/// The Halton(2, 3) jitter sequence centered on zero.
#[must_use]
pub fn jitter_sequence() -> Vec<Vec2> {
    (0..JITTER_SEQUENCE_LENGTH as u32)
        .map(|i| Vec2::new(halton(2, i), halton(3, i)) - Vec2::splat(0.5))
        .collect()
}

/// Records the jitter sequence and scale for the frame.
pub struct AntialiasingSetup {
    sequence: Vec<Vec2>,
    config: AntialiasingSetupConfig,
}

impl AntialiasingSetup {
    #[must_use]
    pub fn new(config: AntialiasingSetupConfig) -> Self {
        Self {
            sequence: jitter_sequence(),
            config,
        }
    }

    pub fn configure(&mut self, config: AntialiasingSetupConfig) {
        self.config = config;
    }

    /// Samples recorded for the frame: the whole sequence, or the frozen
    /// sample alone.
    #[must_use]
    pub fn samples(&self) -> &[Vec2] {
        if self.config.freeze {
            let index = self.config.index % self.sequence.len();
            &self.sequence[index..=index]
        } else {
            &self.sequence
        }
    }
}

impl Job for AntialiasingSetup {
    fn run(&mut self, ctx: &mut RenderContext) {
        if self.config.stop {
            return;
        }
        let samples = self.samples();
        let scale = self.config.scale;
        do_in_batch("AntialiasingSetup::run", &ctx.context, |batch| {
            batch.set_projection_jitter_sequence(samples);
            batch.set_projection_jitter_scale(scale);
        });
    }
}

mod taa_flags {
    pub const DEBUG: u32 = 1 << 0;
    pub const BICUBIC_HISTORY_FETCH: u32 = 1 << 8;
    pub const CONSTRAIN_COLOR: u32 = 1 << 9;
    pub const FEEDBACK_COLOR: u32 = 1 << 12;
}

/// Parameters of the resolve shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TaaParams {
    /// `(0, blend, covariance_gamma, debug_show_velocity_threshold)`.
    pub params: Vec4,
    /// Bit flags, see the `taa_flags` constants.
    pub flags: u32,
    pub _pad: [u32; 3],
    /// `(cursor.x, cursor.y, orb_zoom, 0)`.
    pub pixel_info: Vec4,
    /// `(debug_x, 0, fxaa_x, 0)`.
    pub region_info: Vec4,
}

impl Default for TaaParams {
    fn default() -> Self {
        Self {
            params: Vec4::new(0.0, 0.15, 0.9, 1.0),
            flags: 0,
            _pad: [0; 3],
            pixel_info: Vec4::new(0.5, 0.5, 2.0, 0.0),
            region_info: Vec4::new(0.0, 0.0, 1.0, 0.0),
        }
    }
}

impl TaaParams {
    fn set_flag(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.flags & taa_flags::DEBUG != 0
    }

    #[must_use]
    pub fn blend(&self) -> f32 {
        self.params.y
    }
}

/// Inputs of [`Antialiasing`].
#[derive(Clone, Default)]
pub struct AntialiasingInputs {
    pub frame_transform: Varying<DeferredFrameTransform>,
    pub deferred: Varying<Arc<DeferredFramebuffer>>,
    pub linear_depth: Varying<Arc<Framebuffer>>,
}

/// History targets, reallocated when the source size changes.
struct TaaTargets {
    size: UVec2,
    history: Arc<FramebufferSwapChain>,
    intensity: Arc<Framebuffer>,
}

/// Resolves the jittered lighting buffer against its history.
pub struct Antialiasing {
    inputs: AntialiasingInputs,
    params: StructBuffer<TaaParams>,
    blend_params: Arc<Buffer>,
    sharpen: f32,
    targets: Option<TaaTargets>,
    intensity_pipeline: Arc<Pipeline>,
    taa_pipeline: Arc<Pipeline>,
    blend_pipeline: Arc<Pipeline>,
    debug_blend_pipeline: Arc<Pipeline>,
    output: Varying<Arc<Texture>>,
}

impl Antialiasing {
    #[must_use]
    pub fn new(inputs: AntialiasingInputs, config: &AntialiasingConfig, output: Varying<Arc<Texture>>) -> Self {
        let mut taa = Self {
            inputs,
            params: StructBuffer::new("TaaParams", TaaParams::default()),
            blend_params: Buffer::new("TaaBlendParams", std::mem::size_of::<Vec4>()),
            sharpen: 0.0,
            targets: None,
            intensity_pipeline: fullscreen_pipeline("draw_white", |state| {
                // Pixels tagged no-AA keep the cleared intensity of zero.
                state.set_stencil_test(StencilTest::both(StencilFace::test_equal(0, STENCIL_NO_AA)));
            }),
            taa_pipeline: fullscreen_pipeline("taa", |_| {}),
            blend_pipeline: fullscreen_pipeline("aa_blend", |_| {}),
            debug_blend_pipeline: fullscreen_pipeline("taa_blend", |_| {}),
            output,
        };
        taa.configure(config);
        taa
    }

    pub fn configure(&mut self, config: &AntialiasingConfig) {
        self.sharpen = config.sharpen * 0.25;
        let mut params = self.params.edit();
        params.params.y = config.blend * config.blend;
        params.params.z = config.covariance_gamma;
        params.params.w = config.debug_show_velocity_threshold;
        params.set_flag(taa_flags::CONSTRAIN_COLOR, config.constrain_color);
        params.set_flag(taa_flags::FEEDBACK_COLOR, config.feedback_color);
        params.set_flag(taa_flags::BICUBIC_HISTORY_FETCH, config.bicubic_history_fetch);
        params.set_flag(taa_flags::DEBUG, config.debug);
    }

    #[must_use]
    pub fn params(&self) -> &TaaParams {
        self.params.get()
    }

    /// The history swap chain, once allocated.
    #[must_use]
    pub fn history(&self) -> Option<&Arc<FramebufferSwapChain>> {
        self.targets.as_ref().map(|targets| &targets.history)
    }

    fn targets(&mut self, size: UVec2, deferred: &DeferredFramebuffer) -> &TaaTargets {
        if self.targets.as_ref().is_some_and(|targets| targets.size != size) {
            self.targets = None;
        }
        self.targets.get_or_insert_with(|| {
            log::debug!("Antialiasing: allocating history {}x{}", size.x, size.y);
            let history = (0..2)
                .map(|i| {
                    Framebuffer::create(
                        &format!("Antialiasing[{i}]"),
                        size.x,
                        size.y,
                        &[wgpu::TextureFormat::Rgba16Float],
                        None,
                    )
                })
                .collect();
            let intensity = Texture::new(TextureDesc::render_buffer(
                "TaaIntensity",
                wgpu::TextureFormat::R8Unorm,
                size.x,
                size.y,
            ));
            TaaTargets {
                size,
                history: FramebufferSwapChain::new(history),
                intensity: Framebuffer::from_textures(
                    "TaaIntensity",
                    vec![intensity],
                    Some(deferred.primary_depth_texture().clone()),
                ),
            }
        })
    }
}

impl Job for Antialiasing {
    fn run(&mut self, ctx: &mut RenderContext) {
        let (Some(frame_transform), Some(deferred)) =
            (self.inputs.frame_transform.get(), self.inputs.deferred.get())
        else {
            return;
        };
        let linear_depth = self.inputs.linear_depth.get();
        let source = deferred.lighting_framebuffer().clone();
        let viewport: IVec4 = ctx.args.viewport;

        let sharpen = self.sharpen * self.params.get().region_info.z;
        self.blend_params
            .set_sub_data(0, bytemuck::bytes_of(&Vec4::new(sharpen, 0.0, 0.0, 0.0)));

        let (history, intensity) = {
            let targets = self.targets(source.size(), &deferred);
            (targets.history.clone(), targets.intensity.clone())
        };
        if let Some(texture) = intensity.render_buffer(0) {
            self.output.set(texture.clone());
        }

        let debug = self.params.get().is_debug();
        do_in_batch("Antialiasing::run", &ctx.context, |batch| {
            batch.push_profile_range("TAA");
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);

            // Intensity is 1 except where the stencil marks no-AA pixels.
            batch.set_framebuffer(Some(&intensity));
            batch.clear_color_framebuffer(ClearFlags::COLOR0, Vec4::ZERO);
            batch.set_resource_texture(0, None);
            batch.set_pipeline(Some(&self.intensity_pipeline));
            draw_fullscreen(batch);

            // Resolve into chain[1] from the history in chain[0].
            batch.set_resource_framebuffer_swap_chain_texture(slot::texture::TAA_HISTORY, &history, 0);
            batch.set_resource_texture(slot::texture::TAA_SOURCE, source.render_buffer(0));
            batch.set_resource_texture(slot::texture::TAA_VELOCITY, deferred.velocity_texture());
            batch.set_resource_texture(slot::texture::TAA_INTENSITY, intensity.render_buffer(0));
            batch.set_resource_texture(
                slot::texture::TAA_DEPTH,
                linear_depth.as_ref().and_then(|fb| fb.render_buffer(0)),
            );
            batch.set_uniform_buffer_view(slot::uniform::TAA_PARAMS, &self.params.view());
            batch.set_uniform_buffer_view(slot::uniform::DEFERRED_FRAME_TRANSFORM, &frame_transform.view());
            batch.set_framebuffer_swap_chain(&history, 1);
            batch.set_pipeline(Some(&self.taa_pipeline));
            draw_fullscreen(batch);

            // Blend the resolved image back into the source.
            batch.set_resource_texture(slot::texture::TAA_SOURCE, None);
            batch.set_framebuffer(Some(&source));
            if debug {
                batch.set_pipeline(Some(&self.debug_blend_pipeline));
                batch.set_resource_framebuffer_swap_chain_texture(slot::texture::TAA_NEXT, &history, 1);
            } else {
                batch.set_pipeline(Some(&self.blend_pipeline));
                batch.set_resource_framebuffer_swap_chain_texture(slot::texture::BLEND_SOURCE, &history, 1);
                batch.set_uniform_buffer(slot::uniform::BLEND_PARAMS, Some(&self.blend_params), 0, 0);
            }
            draw_fullscreen(batch);
            batch.advance(&history);

            batch.set_uniform_buffer(slot::uniform::TAA_PARAMS, None, 0, 0);
            batch.set_uniform_buffer(slot::uniform::DEFERRED_FRAME_TRANSFORM, None, 0, 0);
            for texture_slot in [
                slot::texture::TAA_DEPTH,
                slot::texture::TAA_HISTORY,
                slot::texture::TAA_VELOCITY,
                slot::texture::TAA_NEXT,
            ] {
                batch.set_resource_texture(texture_slot, None);
            }

            batch.set_projection_jitter_sequence(&[]);
            batch.pop_profile_range();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halton_matches_radical_inverse() {
        assert!((halton(2, 0) - 0.5).abs() < 1e-6);
        assert!((halton(2, 1) - 0.25).abs() < 1e-6);
        assert!((halton(2, 2) - 0.75).abs() < 1e-6);
        assert!((halton(3, 0) - 1.0 / 3.0).abs() < 1e-6);
        assert!((halton(3, 1) - 2.0 / 3.0).abs() < 1e-6);
        assert!((halton(3, 2) - 1.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn jitter_sequence_is_centered() {
        let sequence = jitter_sequence();
        assert_eq!(sequence.len(), JITTER_SEQUENCE_LENGTH);
        assert!(sequence.iter().all(|s| s.abs().max_element() < 0.5));
        assert_eq!(sequence[0], Vec2::new(0.0, 1.0 / 3.0 - 0.5));
    }

    #[test]
    fn frozen_setup_uses_one_sample() {
        let setup = AntialiasingSetup::new(AntialiasingSetupConfig::paused(5));
        assert_eq!(setup.samples(), &jitter_sequence()[5..6]);
        let playing = AntialiasingSetup::new(AntialiasingSetupConfig::default());
        assert_eq!(playing.samples().len(), JITTER_SEQUENCE_LENGTH);
    }

    #[test]
    fn configure_squares_blend_and_sets_flags() {
        let config = AntialiasingConfig {
            blend: 0.5,
            debug: true,
            constrain_color: false,
            ..Default::default()
        };
        let taa = Antialiasing::new(AntialiasingInputs::default(), &config, Varying::new());
        assert!((taa.params().blend() - 0.25).abs() < 1e-6);
        assert!(taa.params().is_debug());
        assert_eq!(taa.params().flags & taa_flags::CONSTRAIN_COLOR, 0);
        assert_ne!(taa.params().flags & taa_flags::BICUBIC_HISTORY_FETCH, 0);
    }
}
