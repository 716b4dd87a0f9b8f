//! Command Batches
//!
//! A [`Batch`] is an ordered list of [`Command`]s plus identity-deduplicated
//! pools of the objects those commands reference. Commands refer to pooled
//! objects through typed [`PoolIndex`] values, so a batch that binds the same
//! texture a hundred times stores it once.
//!
//! ```text
//!  Batch "opaque"
//!  ├── commands: [SetPipeline(p0), SetResourceTexture{0, t0}, Draw{..}, ...]
//!  ├── pipelines: [p0]          (deduplicated by ResourceId)
//!  ├── textures:  [t0]
//!  └── buffers:   [...]
//! ```
//!
//! Batches are recorded on the client side, appended to a
//! [`Frame`](crate::frame::Frame), and replayed by a
//! [`Backend`](crate::backend::Backend). Once appended they are read-only.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use glam::{IVec4, Mat4, Vec2, Vec4};
use rustc_hash::FxHashMap;

use crate::pipeline::Pipeline;
use crate::query::Query;
use crate::resources::{
    Buffer, BufferView, Framebuffer, FramebufferSwapChain, GpuObject, ResourceId, Texture,
    TextureTable,
};

// ─── Pool Index ───────────────────────────────────────────────────────────────

/// Index of an object inside one of a batch's pools.
pub struct PoolIndex<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolIndex<T> {
    const fn new(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for PoolIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PoolIndex<T> {}

impl<T> PartialEq for PoolIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for PoolIndex<T> {}

impl<T> Hash for PoolIndex<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for PoolIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolIndex({})", self.index)
    }
}

// ─── Resource Pool ────────────────────────────────────────────────────────────

/// Objects referenced by a batch, deduplicated by identity.
#[derive(Debug)]
pub struct ResourcePool<T> {
    items: Vec<Arc<T>>,
    lookup: FxHashMap<ResourceId, u32>,
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            lookup: FxHashMap::default(),
        }
    }
}

impl<T: GpuObject> ResourcePool<T> {
    /// Returns the index of `item`, adding it on first use.
    pub fn cache(&mut self, item: &Arc<T>) -> PoolIndex<T> {
        let next = self.items.len() as u32;
        let index = *self.lookup.entry(item.id()).or_insert_with(|| {
            self.items.push(item.clone());
            next
        });
        PoolIndex::new(index)
    }

    #[must_use]
    pub fn get(&self, index: PoolIndex<T>) -> &Arc<T> {
        &self.items[index.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.lookup.clear();
    }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

/// Primitive topology of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
}

impl Primitive {
    /// Number of triangles rasterized for `count` vertices.
    #[must_use]
    pub fn triangle_count(self, count: u32) -> u32 {
        match self {
            Self::Triangles => count / 3,
            Self::TriangleStrip => count.saturating_sub(2),
            Self::Points | Self::Lines | Self::LineStrip => 0,
        }
    }
}

bitflags::bitflags! {
    /// Attachments cleared by a clear command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const COLOR0  = 1 << 0;
        const COLOR1  = 1 << 1;
        const COLOR2  = 1 << 2;
        const COLOR3  = 1 << 3;
        const DEPTH   = 1 << 4;
        const STENCIL = 1 << 5;
        const COLORS = Self::COLOR0.bits() | Self::COLOR1.bits() | Self::COLOR2.bits() | Self::COLOR3.bits();
        const DEPTH_STENCIL = Self::DEPTH.bits() | Self::STENCIL.bits();
    }
}

/// A recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // Draws
    Draw {
        primitive: Primitive,
        vertex_count: u32,
        start_vertex: u32,
    },
    DrawIndexed {
        primitive: Primitive,
        index_count: u32,
        start_index: u32,
    },
    DrawInstanced {
        instance_count: u32,
        primitive: Primitive,
        vertex_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        instance_count: u32,
        primitive: Primitive,
        index_count: u32,
        start_index: u32,
        start_instance: u32,
    },

    // Output
    ClearFramebuffer {
        flags: ClearFlags,
        color: Vec4,
        depth: f32,
        stencil: i32,
        enable_scissor: bool,
    },
    Blit {
        source: PoolIndex<Framebuffer>,
        source_rect: IVec4,
        destination_rect: IVec4,
    },
    SetFramebuffer(Option<PoolIndex<Framebuffer>>),
    SetFramebufferSwapChain {
        swap_chain: PoolIndex<FramebufferSwapChain>,
        index: u32,
    },
    AdvanceSwapChain(PoolIndex<FramebufferSwapChain>),

    // Transform
    SetViewTransform {
        view: Mat4,
        camera: bool,
    },
    SetProjectionTransform(Mat4),
    SetProjectionJitterEnabled(bool),
    SetProjectionJitterSequence(Vec<Vec2>),
    SetProjectionJitterScale(f32),
    SetViewportTransform(IVec4),
    SetDepthRangeTransform {
        near: f32,
        far: f32,
    },
    SaveViewProjectionTransform(u32),
    SetSavedViewProjectionTransform(u32),
    SetViewCorrectionEnabled(bool),

    // Pipeline
    SetPipeline(Option<PoolIndex<Pipeline>>),
    SetStateScissorRect(IVec4),

    // Uniforms & resources
    SetUniformBuffer {
        slot: u32,
        buffer: Option<PoolIndex<Buffer>>,
        offset: usize,
        size: usize,
    },
    SetResourceBuffer {
        slot: u32,
        buffer: Option<PoolIndex<Buffer>>,
    },
    SetResourceTexture {
        slot: u32,
        texture: Option<PoolIndex<Texture>>,
    },
    SetResourceTextureTable {
        first_slot: u32,
        table: Option<PoolIndex<TextureTable>>,
    },
    SetResourceFramebufferSwapChainTexture {
        slot: u32,
        swap_chain: PoolIndex<FramebufferSwapChain>,
        index: u32,
        render_buffer: u32,
    },

    // Queries & profiling
    BeginQuery(PoolIndex<Query>),
    EndQuery(PoolIndex<Query>),
    PushProfileRange(String),
    PopProfileRange,
}

impl Command {
    #[must_use]
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            Self::Draw { .. }
                | Self::DrawIndexed { .. }
                | Self::DrawInstanced { .. }
                | Self::DrawIndexedInstanced { .. }
        )
    }

    /// Commands fully consumed by the transfer pass. Their effect reaches the
    /// draw pass only through the camera buffer.
    #[must_use]
    pub fn is_camera_only(&self) -> bool {
        matches!(
            self,
            Self::SetViewTransform { .. }
                | Self::SetProjectionTransform(_)
                | Self::SetProjectionJitterEnabled(_)
                | Self::SetProjectionJitterSequence(_)
                | Self::SetProjectionJitterScale(_)
                | Self::SaveViewProjectionTransform(_)
                | Self::SetSavedViewProjectionTransform(_)
        )
    }
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// A recorded, replayable sequence of GPU commands.
#[derive(Debug)]
pub struct Batch {
    name: String,
    commands: Vec<Command>,
    buffers: ResourcePool<Buffer>,
    textures: ResourcePool<Texture>,
    texture_tables: ResourcePool<TextureTable>,
    framebuffers: ResourcePool<Framebuffer>,
    swap_chains: ResourcePool<FramebufferSwapChain>,
    pipelines: ResourcePool<Pipeline>,
    queries: ResourcePool<Query>,
    stereo_enabled: bool,
    skybox_enabled: bool,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new("")
    }
}

impl Batch {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: Vec::new(),
            buffers: ResourcePool::default(),
            textures: ResourcePool::default(),
            texture_tables: ResourcePool::default(),
            framebuffers: ResourcePool::default(),
            swap_chains: ResourcePool::default(),
            pipelines: ResourcePool::default(),
            queries: ResourcePool::default(),
            stereo_enabled: true,
            skybox_enabled: false,
        }
    }

    /// Diagnostic name. Has no effect on replay.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub fn draw_call_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    #[must_use]
    pub fn buffers(&self) -> &ResourcePool<Buffer> {
        &self.buffers
    }

    #[must_use]
    pub fn textures(&self) -> &ResourcePool<Texture> {
        &self.textures
    }

    #[must_use]
    pub fn texture_tables(&self) -> &ResourcePool<TextureTable> {
        &self.texture_tables
    }

    #[must_use]
    pub fn framebuffers(&self) -> &ResourcePool<Framebuffer> {
        &self.framebuffers
    }

    #[must_use]
    pub fn swap_chains(&self) -> &ResourcePool<FramebufferSwapChain> {
        &self.swap_chains
    }

    #[must_use]
    pub fn pipelines(&self) -> &ResourcePool<Pipeline> {
        &self.pipelines
    }

    #[must_use]
    pub fn queries(&self) -> &ResourcePool<Query> {
        &self.queries
    }

    #[must_use]
    pub fn is_stereo_enabled(&self) -> bool {
        self.stereo_enabled
    }

    #[must_use]
    pub fn is_skybox_enabled(&self) -> bool {
        self.skybox_enabled
    }

    /// Empties the batch for reuse, keeping allocations.
    pub fn clear(&mut self) {
        self.name.clear();
        self.commands.clear();
        self.buffers.clear();
        self.textures.clear();
        self.texture_tables.clear();
        self.framebuffers.clear();
        self.swap_chains.clear();
        self.pipelines.clear();
        self.queries.clear();
        self.stereo_enabled = true;
        self.skybox_enabled = false;
    }

    /// Stereo batches are rendered once per eye.
    pub fn enable_stereo(&mut self, enable: bool) {
        self.stereo_enabled = enable;
    }

    /// Skybox batches drop the view translation when correcting the view.
    pub fn enable_skybox(&mut self, enable: bool) {
        self.skybox_enabled = enable;
    }

    // ─── Draws ────────────────────────────────────────────────────────────────

    pub fn draw(&mut self, primitive: Primitive, vertex_count: u32) {
        self.draw_range(primitive, vertex_count, 0);
    }

    pub fn draw_range(&mut self, primitive: Primitive, vertex_count: u32, start_vertex: u32) {
        self.commands.push(Command::Draw {
            primitive,
            vertex_count,
            start_vertex,
        });
    }

    pub fn draw_indexed(&mut self, primitive: Primitive, index_count: u32, start_index: u32) {
        self.commands.push(Command::DrawIndexed {
            primitive,
            index_count,
            start_index,
        });
    }

    pub fn draw_instanced(
        &mut self,
        instance_count: u32,
        primitive: Primitive,
        vertex_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.commands.push(Command::DrawInstanced {
            instance_count,
            primitive,
            vertex_count,
            start_vertex,
            start_instance,
        });
    }

    pub fn draw_indexed_instanced(
        &mut self,
        instance_count: u32,
        primitive: Primitive,
        index_count: u32,
        start_index: u32,
        start_instance: u32,
    ) {
        self.commands.push(Command::DrawIndexedInstanced {
            instance_count,
            primitive,
            index_count,
            start_index,
            start_instance,
        });
    }

    // ─── Output ───────────────────────────────────────────────────────────────

    pub fn clear_framebuffer(
        &mut self,
        flags: ClearFlags,
        color: Vec4,
        depth: f32,
        stencil: i32,
        enable_scissor: bool,
    ) {
        self.commands.push(Command::ClearFramebuffer {
            flags,
            color,
            depth,
            stencil,
            enable_scissor,
        });
    }

    pub fn clear_color_framebuffer(&mut self, flags: ClearFlags, color: Vec4) {
        self.clear_framebuffer(flags & ClearFlags::COLORS, color, 1.0, 0, false);
    }

    pub fn clear_depth_stencil_framebuffer(&mut self, depth: f32, stencil: i32) {
        self.clear_framebuffer(ClearFlags::DEPTH_STENCIL, Vec4::ZERO, depth, stencil, false);
    }

    /// Copies `source_rect` of `source` into `destination_rect` of the bound
    /// framebuffer.
    pub fn blit(&mut self, source: &Arc<Framebuffer>, source_rect: IVec4, destination_rect: IVec4) {
        let source = self.framebuffers.cache(source);
        self.commands.push(Command::Blit {
            source,
            source_rect,
            destination_rect,
        });
    }

    /// Binds `framebuffer` as the render target, `None` for the default one.
    pub fn set_framebuffer(&mut self, framebuffer: Option<&Arc<Framebuffer>>) {
        let framebuffer = framebuffer.map(|fb| self.framebuffers.cache(fb));
        self.commands.push(Command::SetFramebuffer(framebuffer));
    }

    /// Binds the framebuffer `index` steps after the chain's front, resolved
    /// at replay time.
    pub fn set_framebuffer_swap_chain(&mut self, swap_chain: &Arc<FramebufferSwapChain>, index: u32) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.commands
            .push(Command::SetFramebufferSwapChain { swap_chain, index });
    }

    /// Rotates the swap chain when the batch is replayed.
    pub fn advance(&mut self, swap_chain: &Arc<FramebufferSwapChain>) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.commands.push(Command::AdvanceSwapChain(swap_chain));
    }

    // ─── Transform ────────────────────────────────────────────────────────────

    /// Sets the eye-to-world transform. `camera` marks it as the main camera,
    /// which makes it subject to view correction.
    pub fn set_view_transform(&mut self, view: Mat4, camera: bool) {
        self.commands
            .push(Command::SetViewTransform { view, camera });
    }

    pub fn set_projection_transform(&mut self, projection: Mat4) {
        self.commands
            .push(Command::SetProjectionTransform(projection));
    }

    pub fn set_projection_jitter_enabled(&mut self, enabled: bool) {
        self.commands
            .push(Command::SetProjectionJitterEnabled(enabled));
    }

    /// Sub-pixel offsets cycled through one per frame. An empty sequence
    /// removes the jitter.
    pub fn set_projection_jitter_sequence(&mut self, sequence: &[Vec2]) {
        self.commands
            .push(Command::SetProjectionJitterSequence(sequence.to_vec()));
    }

    pub fn set_projection_jitter_scale(&mut self, scale: f32) {
        self.commands
            .push(Command::SetProjectionJitterScale(scale));
    }

    /// Viewport as `(x, y, width, height)`.
    pub fn set_viewport_transform(&mut self, viewport: IVec4) {
        self.commands
            .push(Command::SetViewportTransform(viewport));
    }

    pub fn set_depth_range_transform(&mut self, near: f32, far: f32) {
        self.commands
            .push(Command::SetDepthRangeTransform { near, far });
    }

    /// Stores the current view/projection in a saved slot. Slots past
    /// [`MAX_TRANSFORM_SAVE_SLOT_COUNT`](crate::settings::MAX_TRANSFORM_SAVE_SLOT_COUNT)
    /// are clamped to the last one at replay.
    pub fn save_view_projection_transform(&mut self, slot: u32) {
        self.commands
            .push(Command::SaveViewProjectionTransform(slot));
    }

    pub fn set_saved_view_projection_transform(&mut self, slot: u32) {
        self.commands
            .push(Command::SetSavedViewProjectionTransform(slot));
    }

    pub fn set_view_correction_enabled(&mut self, enabled: bool) {
        self.commands
            .push(Command::SetViewCorrectionEnabled(enabled));
    }

    // ─── Pipeline ─────────────────────────────────────────────────────────────

    pub fn set_pipeline(&mut self, pipeline: Option<&Arc<Pipeline>>) {
        let pipeline = pipeline.map(|p| self.pipelines.cache(p));
        self.commands.push(Command::SetPipeline(pipeline));
    }

    pub fn set_state_scissor_rect(&mut self, rect: IVec4) {
        self.commands.push(Command::SetStateScissorRect(rect));
    }

    // ─── Uniforms & Resources ─────────────────────────────────────────────────

    /// Binds `size` bytes of `buffer` from `offset`. A size of zero binds
    /// the rest of the buffer.
    pub fn set_uniform_buffer(&mut self, slot: u32, buffer: Option<&Arc<Buffer>>, offset: usize, size: usize) {
        let (buffer, size) = match buffer {
            Some(b) => {
                let size = if size == 0 {
                    b.size().saturating_sub(offset)
                } else {
                    size
                };
                (Some(self.buffers.cache(b)), size)
            }
            None => (None, 0),
        };
        self.commands.push(Command::SetUniformBuffer {
            slot,
            buffer,
            offset,
            size,
        });
    }

    pub fn set_uniform_buffer_view(&mut self, slot: u32, view: &BufferView) {
        self.set_uniform_buffer(slot, Some(&view.buffer), view.offset, view.size);
    }

    pub fn set_resource_buffer(&mut self, slot: u32, buffer: Option<&Arc<Buffer>>) {
        let buffer = buffer.map(|b| self.buffers.cache(b));
        self.commands
            .push(Command::SetResourceBuffer { slot, buffer });
    }

    pub fn set_resource_texture(&mut self, slot: u32, texture: Option<&Arc<Texture>>) {
        let texture = texture.map(|t| self.textures.cache(t));
        self.commands
            .push(Command::SetResourceTexture { slot, texture });
    }

    pub fn set_resource_texture_table(&mut self, table: Option<&Arc<TextureTable>>, first_slot: u32) {
        let table = table.map(|t| self.texture_tables.cache(t));
        self.commands
            .push(Command::SetResourceTextureTable { first_slot, table });
    }

    /// Binds render buffer 0 of the swap chain's framebuffer `index`, with
    /// the framebuffer resolved when the batch is replayed.
    pub fn set_resource_framebuffer_swap_chain_texture(
        &mut self,
        slot: u32,
        swap_chain: &Arc<FramebufferSwapChain>,
        index: u32,
    ) {
        self.set_resource_framebuffer_swap_chain_render_buffer(slot, swap_chain, index, 0);
    }

    pub fn set_resource_framebuffer_swap_chain_render_buffer(
        &mut self,
        slot: u32,
        swap_chain: &Arc<FramebufferSwapChain>,
        index: u32,
        render_buffer: u32,
    ) {
        let swap_chain = self.swap_chains.cache(swap_chain);
        self.commands
            .push(Command::SetResourceFramebufferSwapChainTexture {
                slot,
                swap_chain,
                index,
                render_buffer,
            });
    }

    // ─── Queries & Profiling ──────────────────────────────────────────────────

    pub fn begin_query(&mut self, query: &Arc<Query>) {
        let query = self.queries.cache(query);
        self.commands.push(Command::BeginQuery(query));
    }

    pub fn end_query(&mut self, query: &Arc<Query>) {
        let query = self.queries.cache(query);
        self.commands.push(Command::EndQuery(query));
    }

    pub fn push_profile_range(&mut self, name: &str) {
        self.commands
            .push(Command::PushProfileRange(name.to_string()));
    }

    pub fn pop_profile_range(&mut self) {
        self.commands.push(Command::PopProfileRange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Shader, State};

    #[test]
    fn pools_deduplicate_by_identity() {
        let texture = Texture::new(crate::resources::TextureDesc::resource(
            "t",
            wgpu::TextureFormat::Rgba8Unorm,
            1,
            1,
        ));
        let mut batch = Batch::new("dedup");
        batch.set_resource_texture(0, Some(&texture));
        batch.set_resource_texture(1, Some(&texture));
        assert_eq!(batch.textures().len(), 1);
        assert_eq!(batch.commands().len(), 2);
    }

    #[test]
    fn equal_pipelines_are_pooled_separately() {
        let shader = Shader::named("s");
        let state = Arc::new(State::new());
        let a = Pipeline::create(shader.clone(), state.clone());
        let b = Pipeline::create(shader, state);
        let mut batch = Batch::new("pipelines");
        batch.set_pipeline(Some(&a));
        batch.set_pipeline(Some(&b));
        assert_eq!(batch.pipelines().len(), 2);
    }

    #[test]
    fn uniform_buffer_size_zero_binds_rest_of_buffer() {
        let buffer = Buffer::new("ubo", 64);
        let mut batch = Batch::new("ubo");
        batch.set_uniform_buffer(3, Some(&buffer), 16, 0);
        assert!(matches!(
            batch.commands()[0],
            Command::SetUniformBuffer { slot: 3, offset: 16, size: 48, buffer: Some(_) }
        ));
    }

    #[test]
    fn clear_resets_everything() {
        let mut batch = Batch::new("reuse");
        batch.enable_stereo(false);
        batch.enable_skybox(true);
        batch.draw(Primitive::Triangles, 3);
        batch.set_resource_buffer(0, Some(&Buffer::new("b", 4)));
        batch.clear();

        assert!(batch.is_empty());
        assert!(batch.buffers().is_empty());
        assert!(batch.name().is_empty());
        assert!(batch.is_stereo_enabled());
        assert!(!batch.is_skybox_enabled());
    }

    #[test]
    fn triangle_counts() {
        assert_eq!(Primitive::TriangleStrip.triangle_count(4), 2);
        assert_eq!(Primitive::Triangles.triangle_count(9), 3);
        assert_eq!(Primitive::Lines.triangle_count(9), 0);
    }
}
