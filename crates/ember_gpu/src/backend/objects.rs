//! Native object registry
//!
//! Maps logical resources to the native objects created for them. Entries
//! hold a [`Weak`] reference to their owner: a native object lives until
//! [`NativeObjects::recycle`] finds its logical resource gone.
//!
//! Every creation and deletion is reported to [`GPU_METRICS`].

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::native::{NativeApi, NativeHandle};
use crate::query::Query;
use crate::resources::{Buffer, Framebuffer, ResourceId, Texture, TextureUsageKind};
use crate::stats::GPU_METRICS;

#[derive(Debug)]
struct NativeBuffer {
    owner: Weak<Buffer>,
    handle: NativeHandle,
    size: usize,
    synced_version: u64,
}

#[derive(Debug)]
struct NativeTexture {
    owner: Weak<Texture>,
    handle: NativeHandle,
    usage: TextureUsageKind,
    size: u64,
}

#[derive(Debug)]
struct NativeFramebuffer {
    owner: Weak<Framebuffer>,
    handle: NativeHandle,
}

#[derive(Debug)]
struct NativeQuery {
    owner: Weak<Query>,
    handle: NativeHandle,
}

/// Native objects owned by one backend.
#[derive(Debug, Default)]
pub(crate) struct NativeObjects {
    buffers: FxHashMap<ResourceId, NativeBuffer>,
    textures: FxHashMap<ResourceId, NativeTexture>,
    framebuffers: FxHashMap<ResourceId, NativeFramebuffer>,
    queries: FxHashMap<ResourceId, NativeQuery>,
}

impl NativeObjects {
    /// Returns the native buffer of `buffer`, creating it or uploading the
    /// shadow copy when the shadow changed since the last sync.
    pub fn sync_buffer<A: NativeApi>(&mut self, api: &mut A, buffer: &Arc<Buffer>) -> NativeHandle {
        let version = buffer.shadow_version();
        if let Some(native) = self.buffers.get_mut(&buffer.id()) {
            if native.synced_version == version {
                return native.handle;
            }
            buffer.read_shadow(|bytes| {
                if bytes.len() > native.size {
                    api.delete_buffer(native.handle);
                    GPU_METRICS.buffer_destroyed(native.size as u64);
                    native.handle = api.create_buffer(bytes.len());
                    native.size = bytes.len();
                    GPU_METRICS.buffer_created(native.size as u64);
                }
                api.upload_buffer(native.handle, 0, bytes);
            });
            native.synced_version = version;
            return native.handle;
        }

        let (handle, size) = buffer.read_shadow(|bytes| {
            let handle = api.create_buffer(bytes.len());
            if !bytes.is_empty() {
                api.upload_buffer(handle, 0, bytes);
            }
            (handle, bytes.len())
        });
        GPU_METRICS.buffer_created(size as u64);
        log::trace!("Created native buffer {:?} for '{}'", handle, buffer.label());
        self.buffers.insert(
            buffer.id(),
            NativeBuffer {
                owner: Arc::downgrade(buffer),
                handle,
                size,
                synced_version: version,
            },
        );
        handle
    }

    pub fn sync_texture<A: NativeApi>(&mut self, api: &mut A, texture: &Arc<Texture>) -> NativeHandle {
        if let Some(native) = self.textures.get(&texture.id()) {
            return native.handle;
        }
        let desc = texture.desc();
        let handle = api.create_texture(desc);
        let size = desc.estimated_size();
        GPU_METRICS.texture_created(desc.usage, size);
        self.textures.insert(
            texture.id(),
            NativeTexture {
                owner: Arc::downgrade(texture),
                handle,
                usage: desc.usage,
                size,
            },
        );
        handle
    }

    /// Creates the framebuffer and its attachments on first use.
    pub fn sync_framebuffer<A: NativeApi>(&mut self, api: &mut A, framebuffer: &Arc<Framebuffer>) -> NativeHandle {
        if let Some(native) = self.framebuffers.get(&framebuffer.id()) {
            return native.handle;
        }
        let colors: SmallVec<[NativeHandle; 4]> = framebuffer
            .render_buffers()
            .iter()
            .map(|texture| self.sync_texture(api, texture))
            .collect();
        let depth_stencil = framebuffer
            .depth_stencil_buffer()
            .map(|texture| self.sync_texture(api, texture));
        let handle = api.create_framebuffer(&colors, depth_stencil);
        log::trace!("Created native framebuffer {:?} for '{}'", handle, framebuffer.label());
        self.framebuffers.insert(
            framebuffer.id(),
            NativeFramebuffer {
                owner: Arc::downgrade(framebuffer),
                handle,
            },
        );
        handle
    }

    pub fn sync_query<A: NativeApi>(&mut self, api: &mut A, query: &Arc<Query>) -> NativeHandle {
        if let Some(native) = self.queries.get(&query.id()) {
            return native.handle;
        }
        let handle = api.create_query();
        self.queries.insert(
            query.id(),
            NativeQuery {
                owner: Arc::downgrade(query),
                handle,
            },
        );
        handle
    }

    /// Size in bytes of the native texture of `id`, zero if none exists.
    pub fn texture_size(&self, id: ResourceId) -> u64 {
        self.textures.get(&id).map_or(0, |native| native.size)
    }

    /// Deletes the native objects whose logical resource was dropped.
    /// Returns the number of objects deleted.
    pub fn recycle<A: NativeApi>(&mut self, api: &mut A) -> usize {
        let mut deleted = 0;

        self.framebuffers.retain(|_, native| {
            let alive = native.owner.strong_count() > 0;
            if !alive {
                api.delete_framebuffer(native.handle);
                deleted += 1;
            }
            alive
        });
        self.buffers.retain(|_, native| {
            let alive = native.owner.strong_count() > 0;
            if !alive {
                api.delete_buffer(native.handle);
                GPU_METRICS.buffer_destroyed(native.size as u64);
                deleted += 1;
            }
            alive
        });
        self.textures.retain(|_, native| {
            let alive = native.owner.strong_count() > 0;
            if !alive {
                api.delete_texture(native.handle);
                GPU_METRICS.texture_destroyed(native.usage, native.size);
                deleted += 1;
            }
            alive
        });
        self.queries.retain(|_, native| {
            let alive = native.owner.strong_count() > 0;
            if !alive {
                api.delete_query(native.handle);
                deleted += 1;
            }
            alive
        });

        if deleted > 0 {
            log::debug!("Recycled {deleted} native objects");
        }
        deleted
    }

    /// Deletes every native object.
    pub fn release_all<A: NativeApi>(&mut self, api: &mut A) {
        for (_, native) in self.framebuffers.drain() {
            api.delete_framebuffer(native.handle);
        }
        for (_, native) in self.buffers.drain() {
            api.delete_buffer(native.handle);
            GPU_METRICS.buffer_destroyed(native.size as u64);
        }
        for (_, native) in self.textures.drain() {
            api.delete_texture(native.handle);
            GPU_METRICS.texture_destroyed(native.usage, native.size);
        }
        for (_, native) in self.queries.drain() {
            api.delete_query(native.handle);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.framebuffers.len() + self.queries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeCall, RecordingApi};

    #[test]
    fn buffer_uploads_only_when_shadow_changes() {
        let mut api = RecordingApi::new();
        let log = api.log();
        let mut objects = NativeObjects::default();
        let buffer = Buffer::from_bytes("b", &[1, 2, 3, 4]);

        let first = objects.sync_buffer(&mut api, &buffer);
        let again = objects.sync_buffer(&mut api, &buffer);
        assert_eq!(first, again);
        assert_eq!(log.count(|c| matches!(c, NativeCall::UploadBuffer { .. })), 1);

        buffer.set_sub_data(0, &[9]);
        buffer.apply_updates(&buffer.take_pending_updates());
        objects.sync_buffer(&mut api, &buffer);
        assert_eq!(log.count(|c| matches!(c, NativeCall::UploadBuffer { .. })), 2);
        assert_eq!(log.count(|c| matches!(c, NativeCall::CreateBuffer { .. })), 1);
    }

    #[test]
    fn growing_buffer_recreates_native_object() {
        let mut api = RecordingApi::new();
        let log = api.log();
        let mut objects = NativeObjects::default();
        let buffer = Buffer::new("grow", 4);
        objects.sync_buffer(&mut api, &buffer);

        buffer.set_sub_data(4, &[0; 12]);
        buffer.apply_updates(&buffer.take_pending_updates());
        objects.sync_buffer(&mut api, &buffer);

        assert_eq!(log.count(|c| matches!(c, NativeCall::DeleteBuffer(_))), 1);
        assert!(log.calls().contains(&NativeCall::CreateBuffer {
            handle: NativeHandle(2),
            size: 16
        }));
    }

    #[test]
    fn recycle_deletes_dropped_resources_only() {
        let mut api = RecordingApi::new();
        let log = api.log();
        let mut objects = NativeObjects::default();
        let kept = Buffer::new("kept", 4);
        let dropped = Buffer::new("dropped", 4);
        objects.sync_buffer(&mut api, &kept);
        let handle = objects.sync_buffer(&mut api, &dropped);
        drop(dropped);

        assert_eq!(objects.recycle(&mut api), 1);
        assert_eq!(log.count(|c| *c == NativeCall::DeleteBuffer(handle)), 1);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn framebuffer_sync_creates_attachments() {
        let mut api = RecordingApi::new();
        let log = api.log();
        let mut objects = NativeObjects::default();
        let fb = Framebuffer::create(
            "fb",
            4,
            4,
            &[wgpu::TextureFormat::Rgba8Unorm, wgpu::TextureFormat::Rgba16Float],
            Some(wgpu::TextureFormat::Depth24PlusStencil8),
        );
        objects.sync_framebuffer(&mut api, &fb);
        objects.sync_framebuffer(&mut api, &fb);
        assert_eq!(log.count(|c| matches!(c, NativeCall::CreateTexture { .. })), 3);
        assert_eq!(log.count(|c| matches!(c, NativeCall::CreateFramebuffer(_))), 1);
    }
}
