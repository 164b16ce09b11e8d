/// GraphicsDevice trait - GPU buffer and descriptor view factory

use std::ptr::NonNull;
use slotmap::new_key_type;
use crate::error::Result;
use crate::graphics_device::{BufferDesc, ViewFormat, ViewKind};

new_key_type! {
    /// Handle to a GPU buffer owned by a GraphicsDevice
    pub struct BufferKey;

    /// Handle to a descriptor view owned by a GraphicsDevice
    pub struct ViewKey;
}

/// Factory for GPU buffers and the descriptor views over them
///
/// Implemented by backend devices (e.g., VulkanGraphicsDevice). Handles are
/// plain keys: the device owns the objects and frees them on `destroy_*`.
/// All methods take `&self`, backends synchronize internally.
pub trait GraphicsDevice: Send + Sync {
    /// Create a buffer of `desc.capacity` bytes in `desc.location`
    ///
    /// # Errors
    ///
    /// `OutOfMemory` / `AllocationFailed` when the allocation cannot be served.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey>;

    /// Destroy a buffer. Unknown keys are ignored.
    ///
    /// The key is invalid on return. A buffer still referenced by a submitted
    /// transfer that has not completed keeps its memory until that transfer
    /// completes; a non-blocking staged write followed by a resize relies on it.
    fn destroy_buffer(&self, buffer: BufferKey);

    /// Map `[offset, offset + size)` of a host-visible buffer
    ///
    /// The pointer stays valid until `unmap_buffer` or `destroy_buffer`.
    fn map_buffer(&self, buffer: BufferKey, offset: u64, size: u64) -> Result<NonNull<u8>>;

    /// Release the mapping of a buffer
    fn unmap_buffer(&self, buffer: BufferKey);

    /// Create a descriptor view over a buffer
    fn create_view(&self, kind: ViewKind, buffer: BufferKey, format: ViewFormat) -> Result<ViewKey>;

    /// Destroy a descriptor view. Unknown keys are ignored.
    fn destroy_view(&self, view: ViewKey);
}
