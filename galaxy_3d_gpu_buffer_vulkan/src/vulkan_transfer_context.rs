/// VulkanTransferContext - transfer queue, command stream and scratch-buffer pool
///
/// Every flush submits one primary command buffer signalling its own fence.
/// Completion tokens count submissions: token N completes when the fence of
/// the N-th submission is signalled. Scratch buffers released to the pool
/// are retired with the token of the submission that reads them and handed
/// out again only once that token has completed.

use galaxy_3d_gpu_buffer::galaxy3d::{Error, Result};
use galaxy_3d_gpu_buffer::galaxy3d::device::{
    BufferDesc, BufferKey, BufferUsage, CommandStream, CompletionToken, MemoryLocation,
    ResourceState, TransferContext,
};
use galaxy_3d_gpu_buffer::galaxy3d::resource::{ManagedBuffer, MappingMode};
use galaxy_3d_gpu_buffer::{engine_debug, engine_err, engine_trace, engine_warn};
use ash::vk;
use std::sync::Arc;

use crate::vulkan_conversion::{is_write_state, resource_state_to_vk};
use crate::vulkan_graphics_device::VulkanGraphicsDevice;

const LOG_SOURCE: &str = "galaxy3d::vulkan";

// ===== STATE JOURNAL =====

/// Tracked states overwritten by the command buffer being recorded
///
/// The device commits a state as soon as its barrier is recorded. When the
/// command buffer never reaches the queue those commits are undone.
#[derive(Debug, Default)]
pub(crate) struct StateJournal {
    entries: Vec<(BufferKey, ResourceState)>,
}

impl StateJournal {
    /// Remember the state `buffer` had before a recorded barrier
    pub(crate) fn record(&mut self, buffer: BufferKey, previous: ResourceState) {
        self.entries.push((buffer, previous));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// States to restore, newest first
    ///
    /// Applying the pairs in order leaves every buffer in the state it had
    /// before its first recorded barrier.
    pub(crate) fn rollback(&mut self) -> Vec<(BufferKey, ResourceState)> {
        let mut entries: Vec<_> = self.entries.drain(..).collect();
        entries.reverse();
        entries
    }
}

// ===== COMMAND STREAM =====

/// Records barriers and copies into a lazily begun command buffer
pub struct VulkanCommandStream {
    device: Arc<VulkanGraphicsDevice>,
    /// Command pool (TRANSIENT + RESET_COMMAND_BUFFER for reusable one-shot buffers)
    command_pool: vk::CommandPool,
    /// Command buffer being recorded, if any
    recording: Option<vk::CommandBuffer>,
    /// Executed command buffers ready to be reset and recorded again
    spare: Vec<vk::CommandBuffer>,
    /// Commands recorded into `recording`
    recorded: u32,
    /// States to restore if `recording` is never submitted
    journal: StateJournal,
    /// Buffers referenced by `recording`
    touched: Vec<BufferKey>,
}

impl VulkanCommandStream {
    fn new(device: Arc<VulkanGraphicsDevice>) -> Result<Self> {
        let ctx = device.context();
        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { ctx.device.create_command_pool(&pool_create_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create transfer command pool: {:?}", e))?;

        Ok(Self {
            device,
            command_pool,
            recording: None,
            spare: Vec::new(),
            recorded: 0,
            journal: StateJournal::default(),
            touched: Vec::new(),
        })
    }

    /// Whether commands are waiting for the next flush
    pub fn has_pending_commands(&self) -> bool {
        self.recorded > 0
    }

    /// Command buffer to record into, begun on first use
    fn begin(&mut self) -> Result<vk::CommandBuffer> {
        if let Some(command_buffer) = self.recording {
            return Ok(command_buffer);
        }
        let device = &self.device.context().device;

        let command_buffer = match self.spare.pop() {
            Some(command_buffer) => command_buffer,
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let command_buffers = unsafe { device.allocate_command_buffers(&allocate_info) }
                    .map_err(|e| engine_err!(LOG_SOURCE, "Failed to allocate transfer command buffer: {:?}", e))?;
                command_buffers[0]
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to begin transfer command buffer: {:?}", e))?;

        self.recording = Some(command_buffer);
        Ok(command_buffer)
    }

    /// End recording and hand the command buffer over for submission
    fn finish(&mut self) -> Result<Option<vk::CommandBuffer>> {
        let Some(command_buffer) = self.recording.take() else {
            return Ok(None);
        };
        self.recorded = 0;
        let device = &self.device.context().device;
        if let Err(e) = unsafe { device.end_command_buffer(command_buffer) } {
            self.recycle(command_buffer);
            self.abandon();
            return Err(engine_err!(LOG_SOURCE, "Failed to end transfer command buffer: {:?}", e));
        }
        Ok(Some(command_buffer))
    }

    fn touch(&mut self, buffer: BufferKey) {
        if !self.touched.contains(&buffer) {
            self.touched.push(buffer);
        }
    }

    /// Undo the state commits of a command buffer that was never submitted
    fn abandon(&mut self) {
        for (buffer, state) in self.journal.rollback() {
            if self.device.commit_state(buffer, state).is_err() {
                engine_warn!(LOG_SOURCE, "Could not restore tracked state of {:?}", buffer);
            }
        }
        self.touched.clear();
    }

    /// Buffers referenced by the command buffer just submitted
    fn take_submitted(&mut self) -> Vec<BufferKey> {
        self.journal.clear();
        std::mem::take(&mut self.touched)
    }

    /// Reset a command buffer the GPU no longer uses and keep it for reuse
    fn recycle(&mut self, command_buffer: vk::CommandBuffer) {
        let device = &self.device.context().device;
        let reset = unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        };
        match reset {
            Ok(()) => self.spare.push(command_buffer),
            Err(_) => unsafe { device.free_command_buffers(self.command_pool, &[command_buffer]) },
        }
    }
}

impl CommandStream for VulkanCommandStream {
    fn ensure_state(&mut self, buffer: BufferKey, state: ResourceState) -> Result<()> {
        let (raw, previous) = self.device.tracked_state(buffer)?;
        if previous == state && !is_write_state(state) {
            return Ok(());
        }
        let command_buffer = self.begin()?;

        let (src_access, src_stage) = resource_state_to_vk(previous);
        let (dst_access, dst_stage) = resource_state_to_vk(state);
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(raw)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        unsafe {
            self.device.context().device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        self.device.commit_state(buffer, state)?;
        self.journal.record(buffer, previous);
        self.touch(buffer);
        self.recorded += 1;
        Ok(())
    }

    fn copy_buffer_range(
        &mut self,
        dst: BufferKey,
        dst_offset: u64,
        src: BufferKey,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let dst_raw = self
            .device
            .raw_buffer(dst)
            .ok_or_else(|| Error::InvalidResource(format!("Unknown copy destination {:?}", dst)))?;
        let src_raw = self
            .device
            .raw_buffer(src)
            .ok_or_else(|| Error::InvalidResource(format!("Unknown copy source {:?}", src)))?;
        let command_buffer = self.begin()?;

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device
                .context()
                .device
                .cmd_copy_buffer(command_buffer, src_raw, dst_raw, &[region]);
        }
        self.touch(dst);
        self.touch(src);
        self.recorded += 1;
        Ok(())
    }
}

impl Drop for VulkanCommandStream {
    fn drop(&mut self) {
        unsafe {
            // Freeing the pool frees every command buffer allocated from it
            self.device
                .context()
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

// ===== TRANSFER CONTEXT =====

struct InFlight {
    token: CompletionToken,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
}

/// Vulkan implementation of TransferContext
pub struct VulkanTransferContext {
    device: Arc<VulkanGraphicsDevice>,
    stream: VulkanCommandStream,
    /// Submissions not yet known to be complete, oldest first
    in_flight: Vec<InFlight>,
    /// Unsignalled fences ready for the next submission
    spare_fences: Vec<vk::Fence>,
    last_submitted: CompletionToken,
    completed: CompletionToken,
    /// Scratch buffers ready for reuse
    free: Vec<ManagedBuffer>,
    /// Scratch buffers waiting for their token to complete
    retired: Vec<(CompletionToken, ManagedBuffer)>,
    min_transfer_buffer_size: u64,
    max_pooled_transfer_buffers: usize,
}

impl VulkanTransferContext {
    /// Create a transfer context on the device queue
    ///
    /// Pool sizes come from the device configuration.
    pub fn new(device: Arc<VulkanGraphicsDevice>) -> Result<Self> {
        let stream = VulkanCommandStream::new(device.clone())?;
        let config = device.config();
        Ok(Self {
            min_transfer_buffer_size: config.min_transfer_buffer_size,
            max_pooled_transfer_buffers: config.max_pooled_transfer_buffers,
            device,
            stream,
            in_flight: Vec::new(),
            spare_fences: Vec::new(),
            last_submitted: CompletionToken::NONE,
            completed: CompletionToken::NONE,
            free: Vec::new(),
            retired: Vec::new(),
        })
    }

    /// Scratch buffers currently owned by the pool
    pub fn pooled_transfer_buffers(&self) -> usize {
        self.free.len() + self.retired.len()
    }

    /// Token of the latest submission
    pub fn last_submitted_token(&self) -> CompletionToken {
        self.last_submitted
    }

    fn take_fence(&mut self) -> Result<vk::Fence> {
        if let Some(fence) = self.spare_fences.pop() {
            return Ok(fence);
        }
        unsafe {
            self.device
                .context()
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create transfer fence: {:?}", e))
        }
    }

    /// Retire every leading in-flight submission whose fence is signalled
    fn poll(&mut self) -> Result<()> {
        let device = &self.device.context().device;
        let mut done = 0;
        for submission in &self.in_flight {
            let signalled = unsafe { device.get_fence_status(submission.fence) }
                .map_err(|e| engine_err!(LOG_SOURCE, "Failed to query transfer fence: {:?}", e))?;
            if !signalled {
                break;
            }
            done += 1;
        }
        self.retire(done)
    }

    /// Recycle the first `count` in-flight submissions, known to be complete
    fn retire(&mut self, count: usize) -> Result<()> {
        let finished: Vec<InFlight> = self.in_flight.drain(..count).collect();
        for submission in finished {
            self.device.release_fence(submission.fence);
            unsafe {
                self.device
                    .context()
                    .device
                    .reset_fences(&[submission.fence])
                    .map_err(|e| engine_err!(LOG_SOURCE, "Failed to reset transfer fence: {:?}", e))?;
            }
            self.spare_fences.push(submission.fence);
            self.stream.recycle(submission.command_buffer);
            self.completed = self.completed.max(submission.token);
        }
        self.collect_scratch_buffers();
        Ok(())
    }

    /// Move retired scratch buffers whose token completed back to the free list
    fn collect_scratch_buffers(&mut self) {
        let completed = self.completed;
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|(token, _)| *token <= completed);
        self.retired = pending;
        self.free.extend(ready.into_iter().map(|(_, buffer)| buffer));

        if self.free.len() > self.max_pooled_transfer_buffers {
            // Keep the largest buffers
            self.free.sort_by_key(|buffer| std::cmp::Reverse(buffer.capacity()));
            let dropped = self.free.len() - self.max_pooled_transfer_buffers;
            self.free.truncate(self.max_pooled_transfer_buffers);
            engine_debug!(LOG_SOURCE, "Transfer pool trimmed {} scratch buffer(s)", dropped);
        }
    }
}

impl TransferContext for VulkanTransferContext {
    fn acquire_transfer_buffer(&mut self, min_size: u64) -> Result<ManagedBuffer> {
        self.poll()?;

        if let Some(index) = self.free.iter().position(|b| b.capacity() >= min_size) {
            let mut buffer = self.free.swap_remove(index);
            buffer.clear();
            return Ok(buffer);
        }

        let capacity = min_size.max(self.min_transfer_buffer_size);
        engine_trace!(LOG_SOURCE, "Allocating {} byte transfer buffer", capacity);
        ManagedBuffer::create(
            self.device.clone(),
            BufferDesc::new(capacity, MemoryLocation::HostUpload, BufferUsage::empty())
                .with_name("transfer_buffer"),
            MappingMode::AlwaysMap,
        )
    }

    fn release_transfer_buffer(&mut self, buffer: ManagedBuffer) {
        // Commands still being recorded read it in the next submission
        let retire_at = if self.stream.has_pending_commands() {
            self.last_submitted.next()
        } else {
            self.last_submitted
        };
        self.retired.push((retire_at, buffer));
        self.collect_scratch_buffers();
    }

    fn transfer_command_stream(&mut self) -> &mut dyn CommandStream {
        &mut self.stream
    }

    fn flush_transfer(&mut self) -> Result<CompletionToken> {
        let Some(command_buffer) = self.stream.finish()? else {
            return Ok(self.last_submitted);
        };
        let fence = match self.take_fence() {
            Ok(fence) => fence,
            Err(e) => {
                self.stream.recycle(command_buffer);
                self.stream.abandon();
                return Err(e);
            }
        };
        if let Err(e) = self.device.context().submit(&[command_buffer], fence) {
            self.stream.recycle(command_buffer);
            self.stream.abandon();
            self.spare_fences.push(fence);
            return Err(e);
        }
        let touched = self.stream.take_submitted();
        if let Err(e) = self.device.track_submission(&touched, fence) {
            // Already queued, buffers destroyed before completion would be unsafe
            engine_warn!(LOG_SOURCE, "Transfer submitted without buffer tracking: {:?}", e);
        }

        self.last_submitted = self.last_submitted.next();
        self.in_flight.push(InFlight {
            token: self.last_submitted,
            fence,
            command_buffer,
        });
        engine_trace!(LOG_SOURCE, "Submitted transfer {}", self.last_submitted.value());
        Ok(self.last_submitted)
    }

    fn wait_transfer(&mut self, token: CompletionToken) -> Result<()> {
        if token <= self.completed {
            return Ok(());
        }
        if token > self.last_submitted {
            return Err(Error::BackendError(format!(
                "Transfer token {} was never submitted (last: {})",
                token.value(),
                self.last_submitted.value()
            )));
        }

        let count = self.in_flight.iter().take_while(|s| s.token <= token).count();
        let fences: Vec<vk::Fence> = self.in_flight[..count].iter().map(|s| s.fence).collect();
        unsafe {
            self.device
                .context()
                .device
                .wait_for_fences(&fences, true, u64::MAX)
                .map_err(|e| engine_err!(LOG_SOURCE, "Failed to wait for transfer {}: {:?}", token.value(), e))?;
        }
        self.retire(count)
    }

    fn completed_token(&self) -> CompletionToken {
        let device = &self.device.context().device;
        self.in_flight
            .iter()
            .take_while(|s| unsafe { device.get_fence_status(s.fence) }.unwrap_or(false))
            .last()
            .map(|s| s.token)
            .unwrap_or(self.completed)
    }
}

impl Drop for VulkanTransferContext {
    fn drop(&mut self) {
        let device = &self.device.context().device;
        unsafe {
            let fences: Vec<vk::Fence> = self.in_flight.iter().map(|s| s.fence).collect();
            if !fences.is_empty() {
                device.wait_for_fences(&fences, true, u64::MAX).ok();
            }
            for &fence in &fences {
                self.device.release_fence(fence);
            }
            for fence in fences.into_iter().chain(self.spare_fences.drain(..)) {
                device.destroy_fence(fence, None);
            }
        }
        self.in_flight.clear();
    }
}

#[cfg(test)]
#[path = "vulkan_transfer_context_tests.rs"]
mod tests;
