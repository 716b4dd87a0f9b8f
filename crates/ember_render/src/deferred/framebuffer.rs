//! G-buffer and lighting targets of the deferred renderer.

use std::sync::Arc;

use ember_gpu::{ClearFlags, Framebuffer, Texture, TextureDesc, do_in_batch};
use glam::{IVec4, UVec2, Vec4};

use crate::args::RenderContext;
use crate::task::{Job, Varying};

const DEPTH_STENCIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
const PRIMARY_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const LIGHTING_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Framebuffer combinations of a [`DeferredFramebuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredFramebufferType {
    /// Color, normal, specular and velocity buffers with depth.
    Full,
    /// Color buffer with depth.
    ColorDepth,
    /// Lighting buffer with depth.
    Lighting,
    /// Lighting and velocity buffers with depth.
    LightingVelocity,
}

/// The G-buffer and lighting framebuffer, all sharing the primary depth
/// buffer. Allocation follows the size of that depth buffer.
#[derive(Debug)]
pub struct DeferredFramebuffer {
    size: UVec2,
    primary_depth: Arc<Texture>,
    deferred: Arc<Framebuffer>,
    deferred_color_depth: Arc<Framebuffer>,
    lighting: Arc<Framebuffer>,
    lighting_velocity: Arc<Framebuffer>,
}

impl DeferredFramebuffer {
    #[must_use]
    pub fn new(primary_depth: Arc<Texture>) -> Self {
        let width = primary_depth.width();
        let height = primary_depth.height();
        let render_buffer = |label: &str, format| Texture::new(TextureDesc::render_buffer(label, format, width, height));

        let color = render_buffer("Deferred.color", wgpu::TextureFormat::Rgba8UnormSrgb);
        let normal = render_buffer("Deferred.normal", wgpu::TextureFormat::Rgba8Unorm);
        let specular = render_buffer("Deferred.specular", wgpu::TextureFormat::Rgba8Unorm);
        let velocity = render_buffer("Deferred.velocity", wgpu::TextureFormat::Rg16Float);
        let lighting = render_buffer("Deferred.lighting", LIGHTING_FORMAT);
        let depth = Some(primary_depth.clone());

        Self {
            size: UVec2::new(width, height),
            deferred: Framebuffer::from_textures(
                "Deferred",
                vec![color.clone(), normal, specular, velocity.clone()],
                depth.clone(),
            ),
            deferred_color_depth: Framebuffer::from_textures("DeferredColorDepth", vec![color], depth.clone()),
            lighting: Framebuffer::from_textures("Lighting", vec![lighting.clone()], depth.clone()),
            lighting_velocity: Framebuffer::from_textures("LightingVelocity", vec![lighting, velocity], depth),
            primary_depth,
        }
    }

    #[must_use]
    pub fn framebuffer(&self, ty: DeferredFramebufferType) -> &Arc<Framebuffer> {
        match ty {
            DeferredFramebufferType::Full => &self.deferred,
            DeferredFramebufferType::ColorDepth => &self.deferred_color_depth,
            DeferredFramebufferType::Lighting => &self.lighting,
            DeferredFramebufferType::LightingVelocity => &self.lighting_velocity,
        }
    }

    #[must_use]
    pub fn deferred_framebuffer(&self) -> &Arc<Framebuffer> {
        &self.deferred
    }

    #[must_use]
    pub fn lighting_framebuffer(&self) -> &Arc<Framebuffer> {
        &self.lighting
    }

    fn deferred_buffer(&self, index: usize) -> Option<&Arc<Texture>> {
        self.deferred.render_buffer(index)
    }

    #[must_use]
    pub fn color_texture(&self) -> Option<&Arc<Texture>> {
        self.deferred_buffer(0)
    }

    #[must_use]
    pub fn normal_texture(&self) -> Option<&Arc<Texture>> {
        self.deferred_buffer(1)
    }

    #[must_use]
    pub fn specular_texture(&self) -> Option<&Arc<Texture>> {
        self.deferred_buffer(2)
    }

    #[must_use]
    pub fn velocity_texture(&self) -> Option<&Arc<Texture>> {
        self.deferred_buffer(3)
    }

    #[must_use]
    pub fn lighting_texture(&self) -> Option<&Arc<Texture>> {
        self.lighting.render_buffer(0)
    }

    #[must_use]
    pub fn primary_depth_texture(&self) -> &Arc<Texture> {
        &self.primary_depth
    }

    #[must_use]
    pub fn size(&self) -> UVec2 {
        self.size
    }
}

/// The primary framebuffer at the internal render resolution.
#[derive(Debug, Clone)]
pub struct ScaledPrimary {
    pub framebuffer: Arc<Framebuffer>,
    /// Viewport of the display before scaling.
    pub display_viewport: IVec4,
}

/// Sizes the primary framebuffer to the scaled viewport and makes the
/// scaled viewport current for the rest of the run.
pub struct PreparePrimaryFramebuffer {
    resolution_scale: f32,
    framebuffer: Option<Arc<Framebuffer>>,
    output: Varying<ScaledPrimary>,
}

impl PreparePrimaryFramebuffer {
    #[must_use]
    pub fn new(resolution_scale: f32, output: Varying<ScaledPrimary>) -> Self {
        Self {
            resolution_scale: resolution_scale.clamp(0.1, 2.0),
            framebuffer: None,
            output,
        }
    }

    fn scaled_size(&self, size: UVec2) -> UVec2 {
        (size.as_vec2() * self.resolution_scale).as_uvec2().max(UVec2::ONE)
    }
}

impl Job for PreparePrimaryFramebuffer {
    fn run(&mut self, ctx: &mut RenderContext) {
        let display_viewport = ctx.args.viewport;
        let size = self.scaled_size(ctx.args.viewport_size());

        let framebuffer = match &self.framebuffer {
            Some(fb) if fb.size() == size => fb.clone(),
            _ => {
                log::debug!("PreparePrimaryFramebuffer: allocating {}x{}", size.x, size.y);
                let fb = Framebuffer::create(
                    "PrimaryFramebuffer",
                    size.x,
                    size.y,
                    &[PRIMARY_COLOR_FORMAT],
                    Some(DEPTH_STENCIL_FORMAT),
                );
                self.framebuffer = Some(fb.clone());
                fb
            }
        };

        ctx.args.viewport = IVec4::new(0, 0, size.x as i32, size.y as i32);
        self.output.set(ScaledPrimary {
            framebuffer,
            display_viewport,
        });
    }
}

/// Allocates the deferred framebuffer around the primary depth buffer and
/// clears it. Leaves the G-buffer bound.
pub struct PrepareDeferred {
    primary: Varying<ScaledPrimary>,
    deferred: Option<Arc<DeferredFramebuffer>>,
    output: Varying<Arc<DeferredFramebuffer>>,
    lighting_output: Varying<Arc<Framebuffer>>,
}

impl PrepareDeferred {
    #[must_use]
    pub fn new(
        primary: Varying<ScaledPrimary>,
        output: Varying<Arc<DeferredFramebuffer>>,
        lighting_output: Varying<Arc<Framebuffer>>,
    ) -> Self {
        Self {
            primary,
            deferred: None,
            output,
            lighting_output,
        }
    }
}

impl Job for PrepareDeferred {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some(depth) = self
            .primary
            .with(|primary| primary.framebuffer.depth_stencil_buffer().cloned())
            .flatten()
        else {
            log::warn!("PrepareDeferred: no primary depth buffer");
            return;
        };

        let deferred = match &self.deferred {
            Some(deferred) if Arc::ptr_eq(deferred.primary_depth_texture(), &depth) => deferred.clone(),
            _ => {
                let deferred = Arc::new(DeferredFramebuffer::new(depth));
                self.deferred = Some(deferred.clone());
                deferred
            }
        };
        self.output.set(deferred.clone());
        self.lighting_output.set(deferred.lighting_framebuffer().clone());

        let viewport = ctx.args.viewport;
        do_in_batch("PrepareDeferred::run", &ctx.context, |batch| {
            batch.enable_stereo(false);
            batch.set_viewport_transform(viewport);
            batch.set_state_scissor_rect(viewport);

            batch.set_framebuffer(Some(deferred.lighting_framebuffer()));
            batch.clear_color_framebuffer(ClearFlags::COLOR0, Vec4::ZERO);

            batch.set_framebuffer(Some(deferred.deferred_framebuffer()));
            batch.clear_framebuffer(
                ClearFlags::COLORS | ClearFlags::DEPTH_STENCIL,
                Vec4::ZERO,
                1.0,
                0,
                true,
            );
        });
    }
}

/// Binds one of the deferred framebuffer combinations.
pub struct SetDeferredFramebuffer {
    ty: DeferredFramebufferType,
    deferred: Varying<Arc<DeferredFramebuffer>>,
}

impl SetDeferredFramebuffer {
    #[must_use]
    pub fn new(ty: DeferredFramebufferType, deferred: Varying<Arc<DeferredFramebuffer>>) -> Self {
        Self { ty, deferred }
    }
}

impl Job for SetDeferredFramebuffer {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some(deferred) = self.deferred.get() else {
            return;
        };
        do_in_batch("SetDeferredFramebuffer::run", &ctx.context, |batch| {
            batch.set_framebuffer(Some(deferred.framebuffer(self.ty)));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffers_share_primary_depth() {
        let depth = Texture::new(TextureDesc::render_buffer("depth", DEPTH_STENCIL_FORMAT, 64, 32));
        let deferred = DeferredFramebuffer::new(depth.clone());
        assert_eq!(deferred.size(), UVec2::new(64, 32));
        for ty in [
            DeferredFramebufferType::Full,
            DeferredFramebufferType::ColorDepth,
            DeferredFramebufferType::Lighting,
            DeferredFramebufferType::LightingVelocity,
        ] {
            let fb = deferred.framebuffer(ty);
            assert!(Arc::ptr_eq(fb.depth_stencil_buffer().unwrap(), &depth));
        }
        assert_eq!(deferred.framebuffer(DeferredFramebufferType::Full).render_buffers().len(), 4);
        assert!(Arc::ptr_eq(
            deferred.velocity_texture().unwrap(),
            deferred
                .framebuffer(DeferredFramebufferType::LightingVelocity)
                .render_buffer(1)
                .unwrap()
        ));
    }
}
