//! Render arguments shared by every job of a task run.

use std::sync::Arc;

use ember_gpu::{Context, Framebuffer, Pipeline, Primitive, Texture};
use glam::{IVec4, Mat4, UVec2};

/// What the current task run renders for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Default,
    /// Rendered image is mirrored horizontally when blitted.
    Mirror,
    /// Off-screen camera; the HUD is not composited.
    SecondaryCamera,
}

/// Layer an item is drawn in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ItemLayer {
    /// The 3D scene, lit by the deferred pass.
    #[default]
    Main,
    /// 3D overlays drawn on top of the scene after a depth clear.
    InFront,
    /// 3D overlays drawn on top of everything, in the upscaled output.
    Hud,
}

/// One drawable.
///
/// The model matrix is uploaded into the pass's object buffer; the draw
/// reads it back through its instance index.
#[derive(Debug, Clone)]
pub struct RenderItem {
    pub pipeline: Arc<Pipeline>,
    pub model: Mat4,
    pub vertex_count: u32,
    pub primitive: Primitive,
    pub layer: ItemLayer,
}

impl RenderItem {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, primitive: Primitive, vertex_count: u32) -> Self {
        Self {
            pipeline,
            model: Mat4::IDENTITY,
            vertex_count,
            primitive,
            layer: ItemLayer::Main,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Mat4) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_layer(mut self, layer: ItemLayer) -> Self {
        self.layer = layer;
        self
    }
}

/// The items of one frame, as provided to the deferred task.
#[derive(Debug, Clone, Default)]
pub struct RenderItems {
    pub opaque: Vec<RenderItem>,
    pub transparent: Vec<RenderItem>,
    /// Items outlined by the highlight pass.
    pub highlighted: Vec<RenderItem>,
    /// Skybox drawn behind the scene, if any.
    pub background: Option<RenderItem>,
}

impl RenderItems {
    /// Opaque items of `layer`.
    pub fn opaque_in(&self, layer: ItemLayer) -> impl Iterator<Item = &RenderItem> {
        self.opaque.iter().filter(move |item| item.layer == layer)
    }

    /// Transparent items of `layer`.
    pub fn transparent_in(&self, layer: ItemLayer) -> impl Iterator<Item = &RenderItem> {
        self.transparent.iter().filter(move |item| item.layer == layer)
    }
}

/// Per-run camera and output parameters.
#[derive(Debug, Clone)]
pub struct RenderArgs {
    /// `(x, y, width, height)` in pixels of the current output.
    pub viewport: IVec4,
    /// Eye-to-world transform of the camera.
    pub view: Mat4,
    pub projection: Mat4,
    pub near_clip: f32,
    pub far_clip: f32,
    pub render_mode: RenderMode,
    /// Display framebuffer the final image is blitted to.
    pub blit_framebuffer: Option<Arc<Framebuffer>>,
    /// HUD texture composited over the upscaled image.
    pub hud_texture: Option<Arc<Texture>>,
}

impl Default for RenderArgs {
    fn default() -> Self {
        Self {
            viewport: IVec4::new(0, 0, 1, 1),
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            near_clip: 0.1,
            far_clip: 1000.0,
            render_mode: RenderMode::Default,
            blit_framebuffer: None,
            hud_texture: None,
        }
    }
}

impl RenderArgs {
    /// Size of the viewport in pixels, at least one pixel wide and high.
    #[must_use]
    pub fn viewport_size(&self) -> UVec2 {
        UVec2::new(self.viewport.z.max(1) as u32, self.viewport.w.max(1) as u32)
    }
}

/// Everything a job can reach while it runs.
pub struct RenderContext {
    pub context: Arc<Context>,
    pub args: RenderArgs,
}

impl RenderContext {
    #[must_use]
    pub fn new(context: Arc<Context>, args: RenderArgs) -> Self {
        Self { context, args }
    }

    #[inline]
    #[must_use]
    pub fn is_stereo(&self) -> bool {
        self.context.is_stereo()
    }
}
