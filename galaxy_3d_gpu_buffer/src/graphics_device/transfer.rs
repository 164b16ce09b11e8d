/// Transfer command stream and rendering context contracts

use crate::error::Result;
use crate::graphics_device::BufferKey;
use crate::resource::ManagedBuffer;

/// State a buffer must be in for the next GPU access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No pending access, any stage may use it after a full barrier
    Common,
    /// Source of a copy command
    CopySource,
    /// Destination of a copy command
    CopyDestination,
    /// Read as vertex or constant buffer
    VertexAndConstantBuffer,
    /// Read as index buffer
    IndexBuffer,
    /// Read by shaders through a shader resource view
    ShaderResource,
    /// Read and written by shaders through an unordered access view
    UnorderedAccess,
    /// Read by the host after GPU writes (readback)
    HostRead,
}

/// Point in a transfer stream that can be waited upon
///
/// Tokens increase monotonically per context; waiting on a token also
/// waits on every earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompletionToken(u64);

impl CompletionToken {
    /// Token that is complete before anything was submitted
    pub const NONE: CompletionToken = CompletionToken(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Token issued by the submission following this one
    pub fn next(&self) -> CompletionToken {
        CompletionToken(self.0 + 1)
    }
}

/// Command recording interface of a transfer queue
pub trait CommandStream {
    /// Record whatever barrier brings `buffer` into `state`
    fn ensure_state(&mut self, buffer: BufferKey, state: ResourceState) -> Result<()>;

    /// Record a copy of `size` bytes from `src` to `dst`
    fn copy_buffer_range(
        &mut self,
        dst: BufferKey,
        dst_offset: u64,
        src: BufferKey,
        src_offset: u64,
        size: u64,
    ) -> Result<()>;
}

/// Rendering context owning the transfer queue and transfer-buffer pool
///
/// Passed explicitly to every write that may need a staged upload.
pub trait TransferContext {
    /// Take a host-upload scratch buffer with at least `min_size` unused bytes
    fn acquire_transfer_buffer(&mut self, min_size: u64) -> Result<ManagedBuffer>;

    /// Give a scratch buffer back to the pool
    ///
    /// The pool must not hand it out again before the GPU is done with it.
    fn release_transfer_buffer(&mut self, buffer: ManagedBuffer);

    /// Stream recording the next transfer submission
    fn transfer_command_stream(&mut self) -> &mut dyn CommandStream;

    /// Submit everything recorded so far
    fn flush_transfer(&mut self) -> Result<CompletionToken>;

    /// Block the calling thread until `token` has completed on the GPU
    fn wait_transfer(&mut self, token: CompletionToken) -> Result<()>;

    /// Latest token known to be complete
    fn completed_token(&self) -> CompletionToken;
}

/// Scratch buffer borrowed from a TransferContext pool
///
/// Releases the buffer back to the pool when dropped, on success and error
/// paths alike.
pub struct ScopedTransferBuffer<'a> {
    context: &'a mut dyn TransferContext,
    buffer: Option<ManagedBuffer>,
}

impl<'a> ScopedTransferBuffer<'a> {
    /// Acquire a scratch buffer of at least `min_size` free bytes
    pub fn acquire(context: &'a mut dyn TransferContext, min_size: u64) -> Result<Self> {
        let buffer = context.acquire_transfer_buffer(min_size)?;
        Ok(Self {
            context,
            buffer: Some(buffer),
        })
    }

    /// Split into the context and the scratch buffer
    pub fn parts(&mut self) -> (&mut (dyn TransferContext + 'a), &mut ManagedBuffer) {
        let buffer = self
            .buffer
            .as_mut()
            .expect("transfer buffer is held until the guard drops");
        (&mut *self.context, buffer)
    }
}

impl Drop for ScopedTransferBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.context.release_transfer_buffer(buffer);
        }
    }
}
