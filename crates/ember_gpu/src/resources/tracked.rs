use std::sync::atomic::{AtomicU64, Ordering};

/// Global unique id generator
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a GPU object.
///
/// Every buffer, texture, framebuffer, swap chain, texture table, shader,
/// state, pipeline and query receives a fresh id on construction. The
/// backend keys all of its caches on these ids: two objects built from equal
/// descriptors still compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocates the next id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Objects that can be cached in a batch pool and tracked by the backend.
pub trait GpuObject {
    fn id(&self) -> ResourceId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }
}
