/// Resizable GPU buffer with host-side write and mapping support.
///
/// A ManagedBuffer owns one GPU buffer, up to three descriptor views over
/// it and at most one host-mapped window. Host-visible buffers are written
/// through a mapped window; device-local buffers are written through a
/// scratch buffer taken from the TransferContext pool and copied on the GPU.
///
/// Ownership:
/// - views reference the resource and are always destroyed first
/// - `teardown` is the only place that releases GPU objects, in the order
///   unmap → constant view → shader resource view → unordered access view → buffer
/// - `Drop` calls `teardown`

use std::ptr::NonNull;
use std::sync::Arc;
use crate::error::{Error, Result};
use crate::{engine_debug, engine_error, engine_trace, engine_warn};
use crate::graphics_device::{
    BufferDesc, BufferKey, BufferRange, CommandStream, CompletionToken, GraphicsDevice,
    MemoryLocation, ResourceState, ScopedTransferBuffer, TransferContext, ViewKey, ViewKind,
};

const LOG_SOURCE: &str = "galaxy3d::ManagedBuffer";

// ===== MAPPING MODE =====

/// When a host-upload buffer holds a mapped window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingMode {
    /// Map the whole buffer at creation/resize and keep it mapped until teardown
    AlwaysMap,
    /// Map only the range touched by each write or explicit `map` call
    MapWhenNeeded,
}

// ===== BUFFER WRITE =====

/// Data appended to a buffer, with the state the buffer is left in
#[derive(Debug, Clone, Copy)]
pub struct BufferWrite<'a> {
    /// Bytes to write
    pub data: &'a [u8],
    /// State of the destination after a staged copy
    pub post_state: ResourceState,
    /// Wait for GPU completion before returning (staged copies only)
    pub blocking: bool,
}

impl<'a> BufferWrite<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            post_state: ResourceState::Common,
            blocking: false,
        }
    }

    pub fn with_post_state(mut self, post_state: ResourceState) -> Self {
        self.post_state = post_state;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

// ===== MAPPED WINDOW =====

#[derive(Debug, Clone, Copy)]
struct MappedWindow {
    ptr: NonNull<u8>,
    offset: u64,
    size: u64,
    persistent: bool,
}

/// Resource, views and window built for a new capacity, not yet installed
struct FreshResource {
    resource: BufferKey,
    views: [Option<ViewKey>; 3],
    window: Option<MappedWindow>,
}

impl FreshResource {
    fn destroy(self, device: &dyn GraphicsDevice) {
        if self.window.is_some() {
            device.unmap_buffer(self.resource);
        }
        for view in self.views.into_iter().flatten() {
            device.destroy_view(view);
        }
        device.destroy_buffer(self.resource);
    }
}

// ===== MANAGED BUFFER =====

pub struct ManagedBuffer {
    device: Arc<dyn GraphicsDevice>,
    descriptor: BufferDesc,
    resource: Option<BufferKey>,
    /// Indexed by `ViewKind::index()`
    views: [Option<ViewKey>; 3],
    length: u64,
    mapped_window: Option<MappedWindow>,
}

// SAFETY: the mapped window pointer is exclusive to this buffer and only
// dereferenced through `&mut self`.
unsafe impl Send for ManagedBuffer {}

impl ManagedBuffer {
    /// Create a buffer of `descriptor.capacity` bytes
    ///
    /// The buffer starts empty (capacity 0) and is resized to the requested
    /// capacity, so creation and resize share one allocation path.
    ///
    /// # Errors
    ///
    /// Propagates the device allocation error.
    pub fn create(
        device: Arc<dyn GraphicsDevice>,
        descriptor: BufferDesc,
        mapping_mode: MappingMode,
    ) -> Result<Self> {
        let capacity = descriptor.capacity;
        let mut buffer = Self {
            device,
            descriptor: BufferDesc { capacity: 0, ..descriptor },
            resource: None,
            views: [None; 3],
            length: 0,
            mapped_window: None,
        };
        buffer.resize(capacity, mapping_mode)?;
        Ok(buffer)
    }

    // ===== ACCESSORS =====

    pub fn descriptor(&self) -> &BufferDesc {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn capacity(&self) -> u64 {
        self.descriptor.capacity
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn unused_capacity(&self) -> u64 {
        self.descriptor.capacity - self.length
    }

    /// GPU buffer handle, None once torn down
    pub fn resource(&self) -> Option<BufferKey> {
        self.resource
    }

    pub fn view(&self, kind: ViewKind) -> Option<ViewKey> {
        self.views[kind.index()]
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_window.is_some()
    }

    pub fn is_persistently_mapped(&self) -> bool {
        self.mapped_window.map(|w| w.persistent).unwrap_or(false)
    }

    /// Forget written contents without touching GPU memory
    pub fn clear(&mut self) {
        self.length = 0;
    }

    // ===== TEARDOWN =====

    /// Release every GPU object held by the buffer
    ///
    /// Safe to call repeatedly. Capacity drops to 0; the rest of the
    /// descriptor is kept so `resize` can bring the buffer back.
    pub fn teardown(&mut self) {
        if self.mapped_window.take().is_some() {
            if let Some(resource) = self.resource {
                self.device.unmap_buffer(resource);
            }
        }
        for view in self.views.iter_mut() {
            if let Some(view) = view.take() {
                self.device.destroy_view(view);
            }
        }
        if let Some(resource) = self.resource.take() {
            self.device.destroy_buffer(resource);
            engine_trace!(LOG_SOURCE, "'{}': destroyed GPU resource", self.descriptor.name);
        }
        self.length = 0;
        self.descriptor.capacity = 0;
    }

    // ===== RESIZE =====

    /// Reallocate the buffer with `new_capacity` bytes
    ///
    /// Contents are not migrated: the new resource starts zeroed or
    /// undefined depending on the backend, while `len()` is kept (clamped to
    /// the new capacity). Use `resize_preserving` to carry the data over.
    ///
    /// # Errors
    ///
    /// On allocation failure the buffer is left exactly as it was.
    pub fn resize(&mut self, new_capacity: u64, mapping_mode: MappingMode) -> Result<()> {
        if new_capacity == self.descriptor.capacity {
            return Ok(());
        }
        let previous = self.descriptor.capacity;
        self.descriptor.capacity = new_capacity;

        if new_capacity == 0 {
            self.teardown();
            return Ok(());
        }

        let fresh = match self.allocate(mapping_mode) {
            Ok(fresh) => fresh,
            Err(e) => {
                self.descriptor.capacity = previous;
                return Err(e);
            }
        };
        self.install(fresh);
        engine_debug!(
            LOG_SOURCE,
            "'{}': resized {} -> {} bytes ({:?})",
            self.descriptor.name, previous, new_capacity, self.descriptor.location
        );
        Ok(())
    }

    /// Reallocate and copy the written bytes into the new resource on the GPU
    ///
    /// Copies `min(len(), new_capacity)` bytes through the transfer stream,
    /// waits for the copy, then releases the old resource. The new resource
    /// is left in `post_state`.
    pub fn resize_preserving(
        &mut self,
        context: &mut dyn TransferContext,
        new_capacity: u64,
        mapping_mode: MappingMode,
        post_state: ResourceState,
    ) -> Result<()> {
        let old = match self.resource {
            Some(old) if self.length > 0 && new_capacity > 0 => old,
            _ => return self.resize(new_capacity, mapping_mode),
        };
        if new_capacity == self.descriptor.capacity {
            return Ok(());
        }
        let previous = self.descriptor.capacity;
        self.descriptor.capacity = new_capacity;

        let fresh = match self.allocate(mapping_mode) {
            Ok(fresh) => fresh,
            Err(e) => {
                self.descriptor.capacity = previous;
                return Err(e);
            }
        };
        let preserved = self.length.min(new_capacity);
        if let Err(e) = Self::migrate(context, old, fresh.resource, preserved, post_state) {
            engine_error!(
                LOG_SOURCE,
                "'{}': copy during resize failed, keeping {} bytes: {}",
                self.descriptor.name, previous, e
            );
            fresh.destroy(self.device.as_ref());
            self.descriptor.capacity = previous;
            return Err(e);
        }
        self.install(fresh);
        engine_debug!(
            LOG_SOURCE,
            "'{}': resized {} -> {} bytes, {} bytes preserved",
            self.descriptor.name, previous, new_capacity, preserved
        );
        Ok(())
    }

    fn migrate(
        context: &mut dyn TransferContext,
        src: BufferKey,
        dst: BufferKey,
        size: u64,
        post_state: ResourceState,
    ) -> Result<()> {
        let stream = context.transfer_command_stream();
        stream.ensure_state(src, ResourceState::CopySource)?;
        stream.ensure_state(dst, ResourceState::CopyDestination)?;
        stream.copy_buffer_range(dst, 0, src, 0, size)?;
        stream.ensure_state(dst, post_state)?;
        let token = context.flush_transfer()?;
        context.wait_transfer(token)
    }

    /// Create resource, persistent window and views for the current capacity
    ///
    /// Everything created here is destroyed again if a later step fails.
    fn allocate(&self, mapping_mode: MappingMode) -> Result<FreshResource> {
        let device = self.device.as_ref();
        let resource = device.create_buffer(&self.descriptor).map_err(|e| {
            engine_error!(
                LOG_SOURCE,
                "'{}': failed to allocate {} bytes: {}",
                self.descriptor.name, self.descriptor.capacity, e
            );
            e
        })?;
        let mut fresh = FreshResource {
            resource,
            views: [None; 3],
            window: None,
        };

        if mapping_mode == MappingMode::AlwaysMap {
            if self.descriptor.location == MemoryLocation::HostUpload {
                match device.map_buffer(resource, 0, self.descriptor.capacity) {
                    Ok(ptr) => {
                        fresh.window = Some(MappedWindow {
                            ptr,
                            offset: 0,
                            size: self.descriptor.capacity,
                            persistent: true,
                        });
                    }
                    Err(e) => {
                        fresh.destroy(device);
                        return Err(e);
                    }
                }
            } else {
                engine_warn!(
                    LOG_SOURCE,
                    "'{}': AlwaysMap requested on a {:?} buffer, mapping skipped",
                    self.descriptor.name, self.descriptor.location
                );
            }
        }

        let format = self.descriptor.view_format();
        for kind in self.descriptor.view_kinds() {
            match device.create_view(kind, resource, format) {
                Ok(view) => fresh.views[kind.index()] = Some(view),
                Err(e) => {
                    engine_error!(
                        LOG_SOURCE,
                        "'{}': failed to create {:?} view: {}",
                        self.descriptor.name, kind, e
                    );
                    fresh.destroy(device);
                    return Err(e);
                }
            }
        }
        Ok(fresh)
    }

    /// Swap in a new resource, keeping the logical length
    fn install(&mut self, fresh: FreshResource) {
        let length = self.length;
        let capacity = self.descriptor.capacity;
        self.teardown();
        self.descriptor.capacity = capacity;
        self.length = length.min(capacity);
        self.resource = Some(fresh.resource);
        self.views = fresh.views;
        self.mapped_window = fresh.window;
    }

    // ===== APPEND =====

    /// Write at the end of the written range
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the data does not fit; nothing is written.
    /// Otherwise, see `append_unchecked`.
    pub fn append(
        &mut self,
        context: &mut dyn TransferContext,
        write: BufferWrite<'_>,
    ) -> Result<Option<CompletionToken>> {
        let requested = write.data.len() as u64;
        let fits = self
            .length
            .checked_add(requested)
            .map(|end| end <= self.descriptor.capacity)
            .unwrap_or(false);
        if !fits {
            return Err(Error::CapacityExceeded {
                requested,
                available: self.unused_capacity(),
            });
        }
        Ok(self.append_unchecked(context, write))
    }

    /// Append a slice of plain-old-data values
    pub fn append_pod<T: bytemuck::Pod>(
        &mut self,
        context: &mut dyn TransferContext,
        values: &[T],
    ) -> Result<Option<CompletionToken>> {
        self.append(context, BufferWrite::new(bytemuck::cast_slice(values)))
    }

    /// Write at the end of the written range without a capacity check
    ///
    /// # Panics
    ///
    /// The caller guarantees `write.data` fits in `unused_capacity()`. Any
    /// failure of the underlying write breaks that guarantee and aborts.
    pub fn append_unchecked(
        &mut self,
        context: &mut dyn TransferContext,
        write: BufferWrite<'_>,
    ) -> Option<CompletionToken> {
        let offset = self.length;
        let size = write.data.len() as u64;
        match self.write_at(context, offset, write.data, write.post_state, write.blocking) {
            Ok(token) => {
                self.length += size;
                token
            }
            Err(e) => {
                engine_error!(
                    LOG_SOURCE,
                    "'{}': append of {} bytes at offset {} failed: {}",
                    self.descriptor.name, size, offset, e
                );
                panic!(
                    "ManagedBuffer '{}': append of {} bytes at offset {} failed: {}",
                    self.descriptor.name, size, offset, e
                );
            }
        }
    }

    // ===== OFFSET WRITE =====

    /// Write `data` at `offset`
    ///
    /// Host-visible buffers are written through a mapped window and return
    /// `None`. Device-local buffers are staged through a pool scratch buffer
    /// and a GPU copy; the destination ends in `post_state` and the token of
    /// the submission is returned. With `blocking`, the call only returns once
    /// that token has completed.
    ///
    /// `len()` is not modified.
    pub fn write_at(
        &mut self,
        context: &mut dyn TransferContext,
        offset: u64,
        data: &[u8],
        post_state: ResourceState,
        blocking: bool,
    ) -> Result<Option<CompletionToken>> {
        if data.is_empty() {
            return Ok(None);
        }
        let size = data.len() as u64;
        if BufferRange::new(offset, size).resolve(self.descriptor.capacity).is_none() {
            return Err(self.precondition(format!(
                "write of {} bytes at offset {} exceeds capacity {}",
                size, offset, self.descriptor.capacity
            )));
        }

        if self.descriptor.location == MemoryLocation::DeviceLocal {
            self.write_staged(context, offset, data, post_state, blocking).map(Some)
        } else {
            self.write_mapped(offset, data).map(|_| None)
        }
    }

    fn write_mapped(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let persistent = self.is_persistently_mapped();
        let window = self.map(BufferRange::new(offset, data.len() as u64))?;
        window.copy_from_slice(data);
        if !persistent {
            self.unmap();
        }
        Ok(())
    }

    fn write_staged(
        &mut self,
        context: &mut dyn TransferContext,
        offset: u64,
        data: &[u8],
        post_state: ResourceState,
        blocking: bool,
    ) -> Result<CompletionToken> {
        let dst = self.resource.ok_or_else(|| self.precondition("write to a torn-down buffer".to_string()))?;
        let size = data.len() as u64;

        let mut scratch = ScopedTransferBuffer::acquire(context, size)?;
        let (context, staging) = scratch.parts();
        if !staging.descriptor().location.is_host_visible() {
            return Err(self.precondition(format!(
                "transfer pool returned a {:?} scratch buffer",
                staging.descriptor().location
            )));
        }
        let src_offset = staging.len();
        staging.append(context, BufferWrite::new(data))?;
        let src = staging
            .resource()
            .ok_or_else(|| Error::InvalidResource("scratch buffer has no GPU resource".to_string()))?;

        let stream: &mut dyn CommandStream = context.transfer_command_stream();
        stream.ensure_state(dst, ResourceState::CopyDestination)?;
        stream.copy_buffer_range(dst, offset, src, src_offset, size)?;
        stream.ensure_state(dst, post_state)?;

        let token = context.flush_transfer()?;
        engine_trace!(
            LOG_SOURCE,
            "'{}': staged {} bytes at offset {} (token {})",
            self.descriptor.name, size, offset, token.value()
        );
        if blocking {
            context.wait_transfer(token)?;
        }
        Ok(token)
    }

    // ===== MAPPING =====

    /// Map a byte range for host access
    ///
    /// With a persistent window the sub-range of it is returned without a
    /// device call. Otherwise the range is freshly mapped and stays mapped
    /// until `unmap`.
    ///
    /// # Errors
    ///
    /// `PreconditionViolation` if the buffer has no resource, the range is
    /// outside capacity or the buffer is device-local.
    pub fn map(&mut self, range: BufferRange) -> Result<&mut [u8]> {
        let resource = self
            .resource
            .ok_or_else(|| self.precondition("map on a buffer without GPU resource".to_string()))?;
        let (offset, size) = range.resolve(self.descriptor.capacity).ok_or_else(|| {
            self.precondition(format!(
                "map range {:?} outside capacity {}",
                range, self.descriptor.capacity
            ))
        })?;

        if let Some(window) = self.mapped_window.filter(|w| w.persistent) {
            let start = (offset - window.offset) as usize;
            // SAFETY: the persistent window covers the whole capacity and the
            // range was checked against it
            return Ok(unsafe {
                std::slice::from_raw_parts_mut(window.ptr.as_ptr().add(start), size as usize)
            });
        }

        if !self.descriptor.location.is_host_visible() {
            return Err(self.precondition(format!(
                "cannot map a {:?} buffer",
                self.descriptor.location
            )));
        }
        if self.mapped_window.take().is_some() {
            self.device.unmap_buffer(resource);
        }
        let ptr = self.device.map_buffer(resource, offset, size)?;
        self.mapped_window = Some(MappedWindow {
            ptr,
            offset,
            size,
            persistent: false,
        });
        engine_trace!(LOG_SOURCE, "'{}': mapped [{}, +{})", self.descriptor.name, offset, size);
        // SAFETY: the device mapped exactly `size` bytes at `ptr`
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size as usize) })
    }

    /// Map a byte range as a slice of `T`
    ///
    /// The range length must be a whole number of `T`. The slice borrows the
    /// mapped memory directly, so the window must also be aligned for `T`:
    /// an unaligned offset such as `BufferRange::new(2, 8)` for `u32` fails
    /// with `MappingFailed`. Use `read_typed` to copy unaligned elements out.
    pub fn map_typed<T: bytemuck::Pod>(&mut self, range: BufferRange) -> Result<&mut [T]> {
        self.check_element_size::<T>(range)?;
        let bytes = self.map(range)?;
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| Error::MappingFailed(format!("typed view of mapped range: {:?}", e)))
    }

    /// Close a transient mapping; persistent windows stay open
    pub fn unmap(&mut self) {
        if self.is_persistently_mapped() {
            return;
        }
        if self.mapped_window.take().is_some() {
            if let Some(resource) = self.resource {
                self.device.unmap_buffer(resource);
            }
        }
    }

    /// Copy a byte range out of a host-visible buffer
    pub fn read_back(&mut self, range: BufferRange) -> Result<Vec<u8>> {
        let persistent = self.is_persistently_mapped();
        let bytes = self.map(range)?.to_vec();
        if !persistent {
            self.unmap();
        }
        Ok(bytes)
    }

    /// Copy a range out as values of `T`, whatever its alignment
    pub fn read_typed<T: bytemuck::Pod>(&mut self, range: BufferRange) -> Result<Vec<T>> {
        self.check_element_size::<T>(range)?;
        let bytes = self.read_back(range)?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn check_element_size<T>(&self, range: BufferRange) -> Result<()> {
        let element = std::mem::size_of::<T>() as u64;
        if let Some((_, size)) = range.resolve(self.descriptor.capacity) {
            if element == 0 || size % element != 0 {
                return Err(self.precondition(format!(
                    "mapped size {} is not a multiple of element size {}",
                    size, element
                )));
            }
        }
        Ok(())
    }

    fn precondition(&self, message: String) -> Error {
        engine_error!(LOG_SOURCE, "'{}': {}", self.descriptor.name, message);
        Error::PreconditionViolation(format!("'{}': {}", self.descriptor.name, message))
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("descriptor", &self.descriptor)
            .field("resource", &self.resource)
            .field("views", &self.views)
            .field("length", &self.length)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
#[path = "managed_buffer_tests.rs"]
mod tests;
