//! Binding state cache
//!
//! Mirrors what is currently bound natively, per binding point, so that the
//! stages can skip redundant native calls. The cache never issues native
//! calls itself.

use crate::native::NativeHandle;
use crate::pipeline::StateSignature;
use crate::resources::ResourceId;

/// A uniform buffer range bound to a slot.
///
/// The native handle is part of the key: a buffer that outgrew its native
/// object is bound again even though its identity did not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub buffer: ResourceId,
    pub handle: NativeHandle,
    pub offset: usize,
    pub size: usize,
}

/// A whole object bound to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundObject {
    pub id: ResourceId,
    pub handle: NativeHandle,
}

/// Fixed-size array of optional bindings indexed by slot.
#[derive(Debug, Clone)]
pub struct SlotCache<T> {
    slots: Vec<Option<T>>,
}

impl<T: Copy + PartialEq> SlotCache<T> {
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            slots: vec![None; len as usize],
        }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn get(&self, slot: u32) -> Option<T> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// True when `value` is what `slot` already holds.
    #[must_use]
    pub fn is_bound(&self, slot: u32, value: &T) -> bool {
        self.get(slot).as_ref() == Some(value)
    }

    /// Stores `value` and returns the previous entry.
    pub fn set(&mut self, slot: u32, value: Option<T>) -> Option<T> {
        match self.slots.get_mut(slot as usize) {
            Some(entry) => std::mem::replace(entry, value),
            None => None,
        }
    }

    pub fn clear(&mut self) {
        self.slots.fill(None);
    }

    /// Occupied slots with their values.
    pub fn iter(&self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, value)| value.map(|v| (slot as u32, v)))
    }

    /// Highest free slot, if any.
    #[must_use]
    pub fn find_empty_from_top(&self) -> Option<u32> {
        self.slots
            .iter()
            .rposition(Option::is_none)
            .map(|slot| slot as u32)
    }
}

/// Everything the backend believes is bound natively.
#[derive(Debug, Clone)]
pub struct StateCache {
    /// Logical pipeline last bound, `None` after a reset.
    pub pipeline: Option<ResourceId>,
    /// Native program in use.
    pub program: NativeHandle,
    /// Fixed-function fields set away from their defaults since the last
    /// full reset.
    pub touched: StateSignature,
    pub uniform_buffers: SlotCache<UniformBinding>,
    pub resource_buffers: SlotCache<BoundObject>,
    pub textures: SlotCache<BoundObject>,
    pub framebuffer: Option<ResourceId>,
}

impl StateCache {
    #[must_use]
    pub fn new(uniform_slots: u32, resource_buffer_slots: u32, texture_slots: u32) -> Self {
        Self {
            pipeline: None,
            program: NativeHandle::NULL,
            touched: StateSignature::empty(),
            uniform_buffers: SlotCache::new(uniform_slots),
            resource_buffers: SlotCache::new(resource_buffer_slots),
            textures: SlotCache::new(texture_slots),
            framebuffer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_out_of_range_is_ignored() {
        let mut cache = SlotCache::<u32>::new(2);
        assert_eq!(cache.set(5, Some(1)), None);
        assert_eq!(cache.iter().count(), 0);
    }

    #[test]
    fn is_bound_compares_values() {
        let mut cache = SlotCache::new(4);
        cache.set(1, Some(7u32));
        assert!(cache.is_bound(1, &7));
        assert!(!cache.is_bound(1, &8));
        assert!(!cache.is_bound(0, &7));
    }

    #[test]
    fn find_empty_scans_from_top() {
        let mut cache = SlotCache::new(3);
        cache.set(2, Some(1u8));
        assert_eq!(cache.find_empty_from_top(), Some(1));
        cache.set(1, Some(1));
        cache.set(0, Some(1));
        assert_eq!(cache.find_empty_from_top(), None);
    }
}
