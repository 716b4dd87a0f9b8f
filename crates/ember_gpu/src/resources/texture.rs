use std::sync::Arc;

use super::tracked::{GpuObject, ResourceId};

/// How a texture is used, which decides the GPU metric bucket it counts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureUsageKind {
    /// Sampled texture uploaded from client data.
    Resource,
    /// Render target attached to a framebuffer.
    Framebuffer,
    /// Texture owned by an external producer (video, compositor).
    External,
}

/// Description of a 2D texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub mip_levels: u32,
    pub usage: TextureUsageKind,
}

impl TextureDesc {
    #[must_use]
    pub fn render_buffer(label: &str, format: wgpu::TextureFormat, width: u32, height: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            format,
            mip_levels: 1,
            usage: TextureUsageKind::Framebuffer,
        }
    }

    #[must_use]
    pub fn resource(label: &str, format: wgpu::TextureFormat, width: u32, height: u32) -> Self {
        Self {
            usage: TextureUsageKind::Resource,
            ..Self::render_buffer(label, format, width, height)
        }
    }

    #[must_use]
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    /// Estimated GPU memory footprint of all mips in bytes.
    ///
    /// Formats without a fixed texel size (depth/stencil combinations) are
    /// counted as 4 bytes per texel.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let texel = u64::from(self.format.block_copy_size(None).unwrap_or(4));
        let (block_w, block_h) = self.format.block_dimensions();
        (0..self.mip_levels)
            .map(|mip| {
                let w = (self.width >> mip).max(1).div_ceil(block_w);
                let h = (self.height >> mip).max(1).div_ceil(block_h);
                u64::from(w) * u64::from(h) * texel
            })
            .sum()
    }
}

/// A 2D texture.
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    desc: TextureDesc,
}

impl GpuObject for Texture {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Texture {
    #[must_use]
    pub fn new(desc: TextureDesc) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            desc,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    #[must_use]
    pub fn format(&self) -> wgpu::TextureFormat {
        self.desc.format
    }

    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.desc.estimated_size()
    }
}

/// A table of textures bound to consecutive slots in one command.
#[derive(Debug)]
pub struct TextureTable {
    id: ResourceId,
    textures: Vec<Option<Arc<Texture>>>,
}

impl GpuObject for TextureTable {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl TextureTable {
    #[must_use]
    pub fn new(textures: Vec<Option<Arc<Texture>>>) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            textures,
        })
    }

    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn textures(&self) -> &[Option<Arc<Texture>>] {
        &self.textures
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}
