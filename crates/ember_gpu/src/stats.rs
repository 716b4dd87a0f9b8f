//! Statistics
//!
//! Two kinds of counters live here:
//!
//! - [`ContextStats`]: per-backend counters of replay work (pipelines set,
//!   textures bound, draw calls). The context snapshots them around a frame
//!   and stores the difference as the frame's stats.
//! - [`GpuMetrics`]: process-wide atomic counters of native GPU objects and
//!   their memory, updated whenever the backend creates or deletes a native
//!   buffer or texture.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::resources::TextureUsageKind;

/// Counters of the work a backend did while replaying batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub pipelines_set: u64,
    pub textures_bound: u64,
    pub texture_memory_bound: u64,
    pub resource_buffers_bound: u64,
    pub uniform_buffers_bound: u64,
    pub framebuffers_bound: u64,
    pub draw_calls: u64,
    pub api_draw_calls: u64,
    pub vertices: u64,
    pub triangles: u64,
}

impl ContextStats {
    /// Difference `end - begin`, field by field.
    #[must_use]
    pub fn eval_delta(begin: &Self, end: &Self) -> Self {
        Self {
            pipelines_set: end.pipelines_set.wrapping_sub(begin.pipelines_set),
            textures_bound: end.textures_bound.wrapping_sub(begin.textures_bound),
            texture_memory_bound: end.texture_memory_bound.wrapping_sub(begin.texture_memory_bound),
            resource_buffers_bound: end.resource_buffers_bound.wrapping_sub(begin.resource_buffers_bound),
            uniform_buffers_bound: end.uniform_buffers_bound.wrapping_sub(begin.uniform_buffers_bound),
            framebuffers_bound: end.framebuffers_bound.wrapping_sub(begin.framebuffers_bound),
            draw_calls: end.draw_calls.wrapping_sub(begin.draw_calls),
            api_draw_calls: end.api_draw_calls.wrapping_sub(begin.api_draw_calls),
            vertices: end.vertices.wrapping_sub(begin.vertices),
            triangles: end.triangles.wrapping_sub(begin.triangles),
        }
    }
}

// ─── Process-wide Metrics ─────────────────────────────────────────────────────

/// An atomic counter with add/subtract semantics.
#[derive(Debug, Default)]
pub struct MetricCounter(AtomicU64);

impl MetricCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.sub(1);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn sub(&self, value: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(value)));
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Native GPU object counters shared by every backend in the process.
#[derive(Debug, Default)]
pub struct GpuMetrics {
    pub free_memory: MetricCounter,

    pub buffer_count: MetricCounter,
    pub buffer_memory: MetricCounter,

    pub texture_resident_count: MetricCounter,
    pub texture_framebuffer_count: MetricCounter,
    pub texture_resource_count: MetricCounter,
    pub texture_external_count: MetricCounter,

    pub texture_resident_memory: MetricCounter,
    pub texture_framebuffer_memory: MetricCounter,
    pub texture_resource_memory: MetricCounter,
    pub texture_external_memory: MetricCounter,

    pub texture_pending_transfer_count: MetricCounter,
    pub texture_pending_transfer_memory: MetricCounter,
}

/// The process-wide metrics instance.
pub static GPU_METRICS: GpuMetrics = GpuMetrics::new();

impl GpuMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_memory: MetricCounter::new(),
            buffer_count: MetricCounter::new(),
            buffer_memory: MetricCounter::new(),
            texture_resident_count: MetricCounter::new(),
            texture_framebuffer_count: MetricCounter::new(),
            texture_resource_count: MetricCounter::new(),
            texture_external_count: MetricCounter::new(),
            texture_resident_memory: MetricCounter::new(),
            texture_framebuffer_memory: MetricCounter::new(),
            texture_resource_memory: MetricCounter::new(),
            texture_external_memory: MetricCounter::new(),
            texture_pending_transfer_count: MetricCounter::new(),
            texture_pending_transfer_memory: MetricCounter::new(),
        }
    }

    pub(crate) fn buffer_created(&self, size: u64) {
        self.buffer_count.increment();
        self.buffer_memory.add(size);
    }

    pub(crate) fn buffer_destroyed(&self, size: u64) {
        self.buffer_count.decrement();
        self.buffer_memory.sub(size);
    }

    fn texture_counters(&self, usage: TextureUsageKind) -> (&MetricCounter, &MetricCounter) {
        match usage {
            TextureUsageKind::Resource => (&self.texture_resource_count, &self.texture_resource_memory),
            TextureUsageKind::Framebuffer => {
                (&self.texture_framebuffer_count, &self.texture_framebuffer_memory)
            }
            TextureUsageKind::External => (&self.texture_external_count, &self.texture_external_memory),
        }
    }

    pub(crate) fn texture_created(&self, usage: TextureUsageKind, size: u64) {
        let (count, memory) = self.texture_counters(usage);
        count.increment();
        memory.add(size);
        self.texture_resident_count.increment();
        self.texture_resident_memory.add(size);
    }

    pub(crate) fn texture_destroyed(&self, usage: TextureUsageKind, size: u64) {
        let (count, memory) = self.texture_counters(usage);
        count.decrement();
        memory.sub(size);
        self.texture_resident_count.decrement();
        self.texture_resident_memory.sub(size);
    }

    /// Textures allocated on the GPU, all usages.
    #[must_use]
    pub fn texture_count(&self) -> u64 {
        self.texture_resource_count.value()
            + self.texture_framebuffer_count.value()
            + self.texture_external_count.value()
    }

    #[must_use]
    pub fn texture_memory(&self) -> u64 {
        self.texture_resource_memory.value()
            + self.texture_framebuffer_memory.value()
            + self.texture_external_memory.value()
    }

    /// Texture plus buffer memory.
    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.texture_memory() + self.buffer_memory.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_delta_subtracts_fields() {
        let begin = ContextStats {
            draw_calls: 3,
            textures_bound: 1,
            ..Default::default()
        };
        let end = ContextStats {
            draw_calls: 10,
            textures_bound: 4,
            pipelines_set: 2,
            ..Default::default()
        };
        let delta = ContextStats::eval_delta(&begin, &end);
        assert_eq!(delta.draw_calls, 7);
        assert_eq!(delta.textures_bound, 3);
        assert_eq!(delta.pipelines_set, 2);
    }

    #[test]
    fn metric_counter_saturates_at_zero() {
        let counter = MetricCounter::new();
        counter.add(5);
        counter.sub(7);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn local_metrics_track_textures_by_usage() {
        let metrics = GpuMetrics::new();
        metrics.texture_created(TextureUsageKind::Framebuffer, 64);
        metrics.texture_created(TextureUsageKind::Resource, 16);
        assert_eq!(metrics.texture_count(), 2);
        assert_eq!(metrics.texture_memory(), 80);
        assert_eq!(metrics.texture_resident_count.value(), 2);

        metrics.texture_destroyed(TextureUsageKind::Framebuffer, 64);
        assert_eq!(metrics.texture_framebuffer_count.value(), 0);
        assert_eq!(metrics.used_memory(), 16);
    }
}
