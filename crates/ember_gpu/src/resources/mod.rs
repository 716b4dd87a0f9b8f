//! GPU Resources
//!
//! Logical GPU objects referenced by batches. Every object carries a
//! [`ResourceId`]; the backend lazily creates the matching native object the
//! first time a replayed command needs it and deletes it during
//! [`recycle`](crate::backend::Backend::recycle) once the logical object has
//! been dropped.

pub mod buffer;
pub mod framebuffer;
pub mod texture;
pub mod tracked;

pub use buffer::{Buffer, BufferUpdate, BufferView, StructBuffer, StructEdit};
pub use framebuffer::{Framebuffer, FramebufferSwapChain};
pub use texture::{Texture, TextureDesc, TextureTable, TextureUsageKind};
pub use tracked::{GpuObject, ResourceId};
