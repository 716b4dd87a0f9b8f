//! Resource stage
//!
//! Uniform buffers, read-only storage buffers and textures. Every bind goes
//! through the [`StateCache`](super::StateCache): the native call is issued
//! only when the slot holds something else.
//!
//! Buffers are synced before the cache lookup, so an updated shadow copy is
//! uploaded even when the binding itself is unchanged.

use std::sync::Arc;

use super::StateBackend;
use super::cache::{BoundObject, UniformBinding};
use crate::errors::{GpuError, Result};
use crate::native::{NativeApi, NativeHandle};
use crate::resources::{Buffer, FramebufferSwapChain, ResourceId, Texture, TextureTable};

fn check_slot(stage: &'static str, slot: u32, max: u32) -> Result<()> {
    if slot < max {
        Ok(())
    } else {
        Err(GpuError::SlotOutOfRange { stage, slot, max })
    }
}

impl<A: NativeApi> StateBackend<A> {
    pub(super) fn do_set_uniform_buffer(&mut self, slot: u32, buffer: Option<&Arc<Buffer>>, offset: usize, size: usize) {
        if let Err(err) = check_slot("uniform buffer", slot, self.settings.max_uniform_buffers) {
            log::debug!("set_uniform_buffer: {err}");
            return;
        }
        match buffer {
            Some(buffer) => self.bind_uniform_buffer(slot, buffer, offset, size),
            None => self.release_uniform_buffer(slot),
        }
    }

    /// Binds a range of `buffer` without checking `slot` against the user
    /// range, for the internal camera slots.
    pub(super) fn bind_uniform_buffer(&mut self, slot: u32, buffer: &Arc<Buffer>, offset: usize, size: usize) {
        let handle = self.objects.sync_buffer(&mut self.api, buffer);
        self.bind_uniform_native(slot, buffer.id(), handle, offset, size);
    }

    pub(super) fn bind_uniform_native(
        &mut self,
        slot: u32,
        buffer: ResourceId,
        handle: NativeHandle,
        offset: usize,
        size: usize,
    ) {
        let binding = UniformBinding {
            buffer,
            handle,
            offset,
            size,
        };
        if self.cache.uniform_buffers.is_bound(slot, &binding) {
            return;
        }
        self.api.bind_uniform_buffer(slot, handle, offset, size);
        self.cache.uniform_buffers.set(slot, Some(binding));
        self.stats.uniform_buffers_bound += 1;
    }

    pub(super) fn release_uniform_buffer(&mut self, slot: u32) {
        if self.cache.uniform_buffers.set(slot, None).is_some() {
            self.api.unbind_uniform_buffer(slot);
        }
    }

    pub(super) fn reset_uniform_stage(&mut self) {
        let bound: Vec<u32> = self.cache.uniform_buffers.iter().map(|(slot, _)| slot).collect();
        for slot in bound {
            self.api.unbind_uniform_buffer(slot);
        }
        self.cache.uniform_buffers.clear();
    }

    pub(super) fn do_set_resource_buffer(&mut self, slot: u32, buffer: Option<&Arc<Buffer>>) {
        if let Err(err) = check_slot("resource buffer", slot, self.settings.max_resource_buffers) {
            log::debug!("set_resource_buffer: {err}");
            return;
        }
        let Some(buffer) = buffer else {
            self.release_resource_buffer(slot);
            return;
        };

        let handle = self.objects.sync_buffer(&mut self.api, buffer);
        let bound = BoundObject {
            id: buffer.id(),
            handle,
        };
        if self.cache.resource_buffers.is_bound(slot, &bound) {
            return;
        }
        self.api.bind_resource_buffer(slot, handle);
        self.cache.resource_buffers.set(slot, Some(bound));
        self.stats.resource_buffers_bound += 1;
    }

    fn release_resource_buffer(&mut self, slot: u32) {
        if self.cache.resource_buffers.set(slot, None).is_some() {
            self.api.unbind_resource_buffer(slot);
        }
    }

    pub(super) fn do_set_resource_texture(&mut self, slot: u32, texture: Option<&Arc<Texture>>) {
        if let Err(err) = check_slot("texture", slot, self.settings.max_resource_textures) {
            log::debug!("set_resource_texture: {err}");
            return;
        }
        match texture {
            Some(texture) => self.bind_resource_texture(slot, texture),
            None => self.release_resource_texture(slot),
        }
    }

    fn bind_resource_texture(&mut self, slot: u32, texture: &Arc<Texture>) {
        let handle = self.objects.sync_texture(&mut self.api, texture);
        if handle.is_null() {
            let err = GpuError::NativeObject(format!("texture '{}' has no native handle", texture.desc().label));
            log::warn!("{err}, slot {slot} released");
            self.release_resource_texture(slot);
            return;
        }

        let bound = BoundObject {
            id: texture.id(),
            handle,
        };
        if self.cache.textures.is_bound(slot, &bound) {
            return;
        }
        self.api.bind_texture(slot, handle);
        self.cache.textures.set(slot, Some(bound));
        self.stats.textures_bound += 1;
        self.stats.texture_memory_bound += self.objects.texture_size(texture.id());
    }

    fn release_resource_texture(&mut self, slot: u32) {
        if self.cache.textures.set(slot, None).is_some() {
            self.api.unbind_texture(slot);
        }
    }

    pub(super) fn do_set_resource_texture_table(&mut self, first_slot: u32, table: Option<&Arc<TextureTable>>) {
        let Some(table) = table else {
            return;
        };
        for (offset, texture) in table.textures().iter().enumerate() {
            let slot = first_slot + offset as u32;
            if slot >= self.settings.max_resource_textures {
                break;
            }
            match texture {
                Some(texture) => self.bind_resource_texture(slot, texture),
                None => self.release_resource_texture(slot),
            }
        }
    }

    /// Binds a render buffer of the swap chain framebuffer at `index` as it
    /// is at replay time.
    pub(super) fn do_set_resource_framebuffer_swap_chain_texture(
        &mut self,
        slot: u32,
        swap_chain: &Arc<FramebufferSwapChain>,
        index: u32,
        render_buffer: u32,
    ) {
        if let Err(err) = check_slot("texture", slot, self.settings.max_resource_textures) {
            log::debug!("set_resource_framebuffer_swap_chain_texture: {err}");
            return;
        }
        let framebuffer = swap_chain.get(index as usize).clone();
        match framebuffer.render_buffer(render_buffer as usize) {
            Some(texture) => self.bind_resource_texture(slot, texture),
            None => {
                log::debug!(
                    "Framebuffer '{}' has no render buffer {render_buffer}",
                    framebuffer.label()
                );
                self.release_resource_texture(slot);
            }
        }
    }

    pub(super) fn reset_resource_stage(&mut self) {
        let buffers: Vec<u32> = self.cache.resource_buffers.iter().map(|(slot, _)| slot).collect();
        for slot in buffers {
            self.api.unbind_resource_buffer(slot);
        }
        self.cache.resource_buffers.clear();

        let textures: Vec<u32> = self.cache.textures.iter().map(|(slot, _)| slot).collect();
        for slot in textures {
            self.api.unbind_texture(slot);
        }
        self.cache.textures.clear();
    }

    /// Highest texture slot with nothing bound.
    #[must_use]
    pub fn find_empty_texture_slot(&self) -> Option<u32> {
        self.cache.textures.find_empty_from_top()
    }
}
