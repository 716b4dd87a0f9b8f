//! Buffers
//!
//! A [`Buffer`] keeps two byte copies:
//!
//! ```text
//!   recording thread                     rendering thread
//!  ┌──────────────────┐   Frame::finish  ┌──────────────────┐
//!  │ recording copy   │ ───────────────► │ pending updates  │
//!  │ + dirty regions  │   (drained)      │ inside the Frame │
//!  └──────────────────┘                  └────────┬─────────┘
//!                                                 │ consume_frame_updates
//!                                                 ▼
//!                                        ┌──────────────────┐
//!                                        │ shadow copy      │──► native buffer
//!                                        │ + shadow version │    (synced lazily)
//!                                        └──────────────────┘
//! ```
//!
//! Writes only touch the recording copy and queue a dirty region. The shadow
//! copy read by the backend changes only when a frame carrying those regions
//! is consumed.

use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use super::tracked::{GpuObject, ResourceId};

/// A region of a buffer written on the recording side and not yet applied to
/// the shadow copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferUpdate {
    /// Byte offset of the region.
    pub offset: usize,
    /// New bytes of the region.
    pub bytes: Vec<u8>,
    /// Size of the whole buffer after the write.
    pub buffer_size: usize,
}

#[derive(Debug, Default)]
struct RecordingCopy {
    data: Vec<u8>,
    pending: Vec<BufferUpdate>,
}

#[derive(Debug, Default)]
struct ShadowCopy {
    data: Vec<u8>,
    version: u64,
}

/// A GPU buffer with a recording-side copy and a rendering-side shadow.
#[derive(Debug)]
pub struct Buffer {
    id: ResourceId,
    label: String,
    recording: Mutex<RecordingCopy>,
    rendering: RwLock<ShadowCopy>,
}

impl GpuObject for Buffer {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Buffer {
    /// Creates a zero-filled buffer of `size` bytes.
    #[must_use]
    pub fn new(label: &str, size: usize) -> Arc<Self> {
        Self::from_bytes(label, &vec![0u8; size])
    }

    /// Creates a buffer whose both copies start with `bytes`.
    #[must_use]
    pub fn from_bytes(label: &str, bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            label: label.to_string(),
            recording: Mutex::new(RecordingCopy {
                data: bytes.to_vec(),
                pending: Vec::new(),
            }),
            rendering: RwLock::new(ShadowCopy {
                data: bytes.to_vec(),
                version: 1,
            }),
        })
    }

    #[must_use]
    pub fn from_slice<T: Pod>(label: &str, data: &[T]) -> Arc<Self> {
        Self::from_bytes(label, bytemuck::cast_slice(data))
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

    /// Size of the recording copy in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.recording.lock().data.len()
    }

    /// Writes `bytes` at `offset`, growing the buffer when the region ends
    /// past its current size.
    pub fn set_sub_data(&self, offset: usize, bytes: &[u8]) {
        let mut recording = self.recording.lock();
        let end = offset + bytes.len();
        if end > recording.data.len() {
            recording.data.resize(end, 0);
        }
        recording.data[offset..end].copy_from_slice(bytes);
        let buffer_size = recording.data.len();
        recording.pending.push(BufferUpdate {
            offset,
            bytes: bytes.to_vec(),
            buffer_size,
        });
    }

    pub fn set_sub_slice<T: Pod>(&self, offset: usize, data: &[T]) {
        self.set_sub_data(offset, bytemuck::cast_slice(data));
    }

    /// Replaces the whole content, resizing the buffer to `bytes.len()`.
    pub fn set_data(&self, bytes: &[u8]) {
        let mut recording = self.recording.lock();
        recording.data.clear();
        recording.data.extend_from_slice(bytes);
        recording.pending.push(BufferUpdate {
            offset: 0,
            bytes: bytes.to_vec(),
            buffer_size: bytes.len(),
        });
    }

    /// Appends `bytes` and returns the offset they were written at.
    pub fn append(&self, bytes: &[u8]) -> usize {
        let offset = self.size();
        self.set_sub_data(offset, bytes);
        offset
    }

    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        !self.recording.lock().pending.is_empty()
    }

    /// Copy of the recording-side bytes.
    #[must_use]
    pub fn recording_bytes(&self) -> Vec<u8> {
        self.recording.lock().data.clone()
    }

    /// Copy of the rendering-side shadow bytes.
    #[must_use]
    pub fn shadow_bytes(&self) -> Vec<u8> {
        self.rendering.read().data.clone()
    }

    /// Reads the shadow bytes without copying them.
    pub fn read_shadow<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.rendering.read().data)
    }

    /// Version of the shadow copy, bumped by every applied update batch.
    #[must_use]
    pub fn shadow_version(&self) -> u64 {
        self.rendering.read().version
    }

    /// Drains the dirty regions queued on the recording side.
    pub(crate) fn take_pending_updates(&self) -> Vec<BufferUpdate> {
        std::mem::take(&mut self.recording.lock().pending)
    }

    /// Applies drained regions to the shadow copy.
    pub(crate) fn apply_updates(&self, updates: &[BufferUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut shadow = self.rendering.write();
        for update in updates {
            shadow.data.resize(update.buffer_size, 0);
            let end = (update.offset + update.bytes.len()).min(update.buffer_size);
            if update.offset < end {
                shadow.data[update.offset..end]
                    .copy_from_slice(&update.bytes[..end - update.offset]);
            }
        }
        shadow.version = shadow.version.wrapping_add(1);
    }
}

/// A sub-range of a buffer.
#[derive(Debug, Clone)]
pub struct BufferView {
    pub buffer: Arc<Buffer>,
    pub offset: usize,
    pub size: usize,
}

impl BufferView {
    #[must_use]
    pub fn new(buffer: Arc<Buffer>, offset: usize, size: usize) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }

    /// A view over the whole buffer as it is sized right now.
    #[must_use]
    pub fn whole(buffer: Arc<Buffer>) -> Self {
        let size = buffer.size();
        Self::new(buffer, 0, size)
    }
}

/// A buffer holding a single POD value, kept in sync with a typed copy.
///
/// ```rust,ignore
/// let mut params = StructBuffer::new("params", TaaParams::default());
/// params.edit().blend = 0.04;   // written through when the guard drops
/// ```
#[derive(Debug)]
pub struct StructBuffer<T: Pod> {
    buffer: Arc<Buffer>,
    value: T,
}

impl<T: Pod> StructBuffer<T> {
    #[must_use]
    pub fn new(label: &str, value: T) -> Self {
        Self {
            buffer: Buffer::from_bytes(label, bytemuck::bytes_of(&value)),
            value,
        }
    }

    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Returns a guard that writes the value through to the buffer on drop.
    pub fn edit(&mut self) -> StructEdit<'_, T> {
        StructEdit {
            value: &mut self.value,
            buffer: &self.buffer,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    #[must_use]
    pub fn view(&self) -> BufferView {
        BufferView::new(self.buffer.clone(), 0, std::mem::size_of::<T>())
    }
}

/// Mutable guard returned by [`StructBuffer::edit`].
pub struct StructEdit<'a, T: Pod> {
    value: &'a mut T,
    buffer: &'a Arc<Buffer>,
}

impl<T: Pod> std::ops::Deref for StructEdit<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<T: Pod> std::ops::DerefMut for StructEdit<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

impl<T: Pod> Drop for StructEdit<'_, T> {
    fn drop(&mut self) {
        self.buffer.set_sub_data(0, bytemuck::bytes_of(self.value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_stay_on_recording_side_until_applied() {
        let buffer = Buffer::from_slice("b", &[1u32, 2, 3]);
        buffer.set_sub_slice(4, &[9u32]);

        assert_eq!(buffer.recording_bytes(), bytemuck::cast_slice::<u32, u8>(&[1, 9, 3]));
        assert_eq!(buffer.shadow_bytes(), bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));

        let updates = buffer.take_pending_updates();
        buffer.apply_updates(&updates);
        assert_eq!(buffer.shadow_bytes(), buffer.recording_bytes());
        assert!(!buffer.has_pending_updates());
    }

    #[test]
    fn set_sub_data_grows_buffer() {
        let buffer = Buffer::new("grow", 4);
        buffer.set_sub_data(6, &[7, 7]);
        assert_eq!(buffer.size(), 8);

        let version = buffer.shadow_version();
        buffer.apply_updates(&buffer.take_pending_updates());
        assert_eq!(buffer.shadow_bytes(), vec![0, 0, 0, 0, 0, 0, 7, 7]);
        assert_eq!(buffer.shadow_version(), version + 1);
    }

    #[test]
    fn applying_nothing_keeps_version() {
        let buffer = Buffer::new("idle", 16);
        let version = buffer.shadow_version();
        buffer.apply_updates(&buffer.take_pending_updates());
        assert_eq!(buffer.shadow_version(), version);
    }

    #[test]
    fn struct_buffer_edit_writes_through_on_drop() {
        let mut params = StructBuffer::new("params", [0.0f32; 4]);
        {
            let mut edit = params.edit();
            edit[2] = 5.0;
        }
        assert!((params.get()[2] - 5.0).abs() < f32::EPSILON);
        let bytes = params.buffer().recording_bytes();
        let values: &[f32] = bytemuck::cast_slice(&bytes);
        assert!((values[2] - 5.0).abs() < f32::EPSILON);
        assert!(params.buffer().has_pending_updates());
    }
}
