use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::UVec2;
use smallvec::SmallVec;

use super::texture::{Texture, TextureDesc};
use super::tracked::{GpuObject, ResourceId};

/// A render target: up to a handful of color render buffers and an optional
/// depth-stencil buffer, all of the same size.
#[derive(Debug)]
pub struct Framebuffer {
    id: ResourceId,
    label: String,
    size: UVec2,
    render_buffers: SmallVec<[Arc<Texture>; 4]>,
    depth_stencil: Option<Arc<Texture>>,
}

impl GpuObject for Framebuffer {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Framebuffer {
    /// Creates a framebuffer allocating one render buffer per color format.
    #[must_use]
    pub fn create(
        label: &str,
        width: u32,
        height: u32,
        color_formats: &[wgpu::TextureFormat],
        depth_stencil_format: Option<wgpu::TextureFormat>,
    ) -> Arc<Self> {
        let render_buffers = color_formats
            .iter()
            .enumerate()
            .map(|(i, format)| {
                Texture::new(TextureDesc::render_buffer(
                    &format!("{label}.color{i}"),
                    *format,
                    width,
                    height,
                ))
            })
            .collect();
        let depth_stencil = depth_stencil_format.map(|format| {
            Texture::new(TextureDesc::render_buffer(
                &format!("{label}.depth"),
                format,
                width,
                height,
            ))
        });
        Self::from_textures(label, render_buffers, depth_stencil)
    }

    /// Creates a framebuffer around existing textures. The size is taken
    /// from the first attachment.
    #[must_use]
    pub fn from_textures(
        label: &str,
        render_buffers: Vec<Arc<Texture>>,
        depth_stencil: Option<Arc<Texture>>,
    ) -> Arc<Self> {
        let size = render_buffers
            .first()
            .or(depth_stencil.as_ref())
            .map_or(UVec2::ZERO, |t| UVec2::new(t.width(), t.height()));
        Arc::new(Self {
            id: ResourceId::next(),
            label: label.to_string(),
            size,
            render_buffers: render_buffers.into_iter().collect(),
            depth_stencil,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn size(&self) -> UVec2 {
        self.size
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.size.x
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.size.y
    }

    #[must_use]
    pub fn render_buffer(&self, index: usize) -> Option<&Arc<Texture>> {
        self.render_buffers.get(index)
    }

    #[must_use]
    pub fn render_buffers(&self) -> &[Arc<Texture>] {
        &self.render_buffers
    }

    #[must_use]
    pub fn depth_stencil_buffer(&self) -> Option<&Arc<Texture>> {
        self.depth_stencil.as_ref()
    }
}

/// A ring of framebuffers used for ping-pong rendering.
///
/// `get(i)` resolves to the framebuffer `i` steps after the current front.
/// The front only moves when [`advance`](Self::advance) runs, which the
/// backend does when it replays an `advance` command, so a batch recorded
/// against index 0 always reads whichever framebuffer is the front at replay
/// time.
#[derive(Debug)]
pub struct FramebufferSwapChain {
    id: ResourceId,
    framebuffers: Vec<Arc<Framebuffer>>,
    front: AtomicUsize,
}

impl GpuObject for FramebufferSwapChain {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl FramebufferSwapChain {
    /// # Panics
    /// Panics when `framebuffers` is empty.
    #[must_use]
    pub fn new(framebuffers: Vec<Arc<Framebuffer>>) -> Arc<Self> {
        assert!(!framebuffers.is_empty(), "a swap chain needs at least one framebuffer");
        Arc::new(Self {
            id: ResourceId::next(),
            framebuffers,
            front: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    #[must_use]
    pub fn front_index(&self) -> usize {
        self.front.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> &Arc<Framebuffer> {
        &self.framebuffers[(self.front_index() + index) % self.framebuffers.len()]
    }

    pub fn advance(&self) {
        let len = self.framebuffers.len();
        // Single rendering thread advances; the load/store pair only needs
        // to be visible to readers on other threads.
        let next = (self.front.load(Ordering::Acquire) + 1) % len;
        self.front.store(next, Ordering::Release);
    }

    #[must_use]
    pub fn size(&self) -> UVec2 {
        self.framebuffers[0].size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Arc<FramebufferSwapChain> {
        let a = Framebuffer::create("a", 4, 4, &[wgpu::TextureFormat::Rgba8Unorm], None);
        let b = Framebuffer::create("b", 4, 4, &[wgpu::TextureFormat::Rgba8Unorm], None);
        FramebufferSwapChain::new(vec![a, b])
    }

    #[test]
    fn get_is_relative_to_front() {
        let chain = chain();
        let first = chain.get(0).id();
        let second = chain.get(1).id();
        assert_ne!(first, second);

        chain.advance();
        assert_eq!(chain.get(0).id(), second);
        assert_eq!(chain.get(1).id(), first);

        chain.advance();
        assert_eq!(chain.get(0).id(), first);
    }

    #[test]
    fn create_allocates_attachments() {
        let fb = Framebuffer::create(
            "gbuffer",
            16,
            8,
            &[wgpu::TextureFormat::Rgba8Unorm, wgpu::TextureFormat::Rgba16Float],
            Some(wgpu::TextureFormat::Depth24PlusStencil8),
        );
        assert_eq!(fb.size(), UVec2::new(16, 8));
        assert_eq!(fb.render_buffers().len(), 2);
        assert!(fb.depth_stencil_buffer().is_some());
        assert!(fb.render_buffer(2).is_none());
    }
}
