/// Mock GraphicsDevice and TransferContext for unit tests (no GPU required)
///
/// The mock device keeps buffer memory in host vectors and records every
/// factory call as a MockEvent so tests can check ordering. The mock context
/// simulates an asynchronous queue: recorded commands only execute when the
/// token of their submission is waited upon. Buffers destroyed while a
/// submission still references them keep their memory until it completes.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use slotmap::SlotMap;

use crate::error::{Error, Result};
use crate::graphics_device::{
    BufferDesc, BufferKey, BufferUsage, CommandStream, CompletionToken, GraphicsDevice,
    MemoryLocation, ResourceState, TransferContext, ViewFormat, ViewKey, ViewKind,
};
use crate::resource::{ManagedBuffer, MappingMode};

// ============================================================================
// Mock GraphicsDevice
// ============================================================================

/// Factory call observed by the mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    CreateBuffer(BufferKey),
    DestroyBuffer(BufferKey),
    Map { buffer: BufferKey, offset: u64, size: u64 },
    Unmap(BufferKey),
    CreateView(ViewKey, ViewKind),
    DestroyView(ViewKey, ViewKind),
}

#[derive(Debug)]
pub struct MockBuffer {
    pub desc: BufferDesc,
    pub memory: Box<[u8]>,
    pub mapped: bool,
    pub state: ResourceState,
    /// Latest submitted token whose commands reference this buffer
    pub pending: Option<CompletionToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockView {
    pub kind: ViewKind,
    pub buffer: BufferKey,
    pub format: ViewFormat,
}

#[derive(Default)]
struct MockState {
    buffers: SlotMap<BufferKey, MockBuffer>,
    views: SlotMap<ViewKey, MockView>,
    /// Destroyed buffers waiting for their pending token
    deferred: Vec<(BufferKey, MockBuffer)>,
    events: Vec<MockEvent>,
    fail_buffer_allocations: u32,
    fail_view_creations: u32,
}

#[derive(Default)]
pub struct MockGraphicsDevice {
    state: Mutex<MockState>,
}

impl MockGraphicsDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make the next `count` buffer allocations fail with OutOfMemory
    pub fn fail_buffer_allocations(&self, count: u32) {
        self.lock().fail_buffer_allocations = count;
    }

    /// Make the next `count` view creations fail
    pub fn fail_view_creations(&self, count: u32) {
        self.lock().fail_view_creations = count;
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_views(&self) -> usize {
        self.lock().views.len()
    }

    pub fn contains_buffer(&self, buffer: BufferKey) -> bool {
        self.lock().buffers.contains_key(buffer)
    }

    /// Destroyed buffers whose memory is still held for a pending transfer
    pub fn deferred_buffers(&self) -> usize {
        self.lock().deferred.len()
    }

    pub fn buffer_capacity(&self, buffer: BufferKey) -> Option<u64> {
        self.lock().buffers.get(buffer).map(|b| b.memory.len() as u64)
    }

    pub fn is_mapped(&self, buffer: BufferKey) -> bool {
        self.lock().buffers.get(buffer).map(|b| b.mapped).unwrap_or(false)
    }

    pub fn state_of(&self, buffer: BufferKey) -> Option<ResourceState> {
        self.lock().buffers.get(buffer).map(|b| b.state)
    }

    pub fn view(&self, view: ViewKey) -> Option<MockView> {
        self.lock().views.get(view).copied()
    }

    /// Raw memory of a buffer, bypassing mapping rules (device-local included)
    pub fn contents(&self, buffer: BufferKey) -> Vec<u8> {
        self.lock()
            .buffers
            .get(buffer)
            .map(|b| b.memory.to_vec())
            .unwrap_or_default()
    }

    /// Mark every buffer referenced by `commands` as used by `token`
    fn track_submission(&self, token: CompletionToken, commands: &[MockCommand]) {
        let mut state = self.lock();
        for command in commands {
            let keys = match *command {
                MockCommand::EnsureState { buffer, .. } => [Some(buffer), None],
                MockCommand::Copy { dst, src, .. } => [Some(dst), Some(src)],
            };
            for key in keys.into_iter().flatten() {
                if let Some(buffer) = state.buffers.get_mut(key) {
                    buffer.pending = Some(token);
                }
            }
        }
    }

    /// Clear pending marks up to `token` and free deferred buffers
    fn complete(&self, token: CompletionToken) {
        let mut state = self.lock();
        for (_, buffer) in state.buffers.iter_mut() {
            if buffer.pending.is_some_and(|pending| pending <= token) {
                buffer.pending = None;
            }
        }
        state
            .deferred
            .retain(|(_, buffer)| buffer.pending.is_some_and(|pending| pending > token));
    }

    fn execute(&self, command: &MockCommand) {
        let mut state = self.lock();
        match *command {
            MockCommand::EnsureState { buffer, state: target } => {
                if let Some(b) = storage_of(&mut state, buffer) {
                    b.state = target;
                }
            }
            MockCommand::Copy { dst, dst_offset, src, src_offset, size } => {
                let (src_offset, dst_offset, size) =
                    (src_offset as usize, dst_offset as usize, size as usize);
                let bytes = storage_of(&mut state, src)
                    .and_then(|b| b.memory.get(src_offset..src_offset + size))
                    .map(|slice| slice.to_vec());
                let (Some(bytes), Some(target)) = (bytes, storage_of(&mut state, dst)) else {
                    return;
                };
                if let Some(slice) = target.memory.get_mut(dst_offset..dst_offset + size) {
                    slice.copy_from_slice(&bytes);
                }
            }
        }
    }
}

/// Live or deferred storage of a buffer
fn storage_of(state: &mut MockState, key: BufferKey) -> Option<&mut MockBuffer> {
    if state.buffers.contains_key(key) {
        return state.buffers.get_mut(key);
    }
    state
        .deferred
        .iter_mut()
        .find(|(deferred, _)| *deferred == key)
        .map(|(_, buffer)| buffer)
}

impl GraphicsDevice for MockGraphicsDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey> {
        let mut state = self.lock();
        if state.fail_buffer_allocations > 0 {
            state.fail_buffer_allocations -= 1;
            return Err(Error::OutOfMemory);
        }
        let key = state.buffers.insert(MockBuffer {
            desc: desc.clone(),
            memory: vec![0u8; desc.capacity as usize].into_boxed_slice(),
            mapped: false,
            state: ResourceState::Common,
            pending: None,
        });
        state.events.push(MockEvent::CreateBuffer(key));
        Ok(key)
    }

    fn destroy_buffer(&self, buffer: BufferKey) {
        let mut state = self.lock();
        if let Some(removed) = state.buffers.remove(buffer) {
            state.events.push(MockEvent::DestroyBuffer(buffer));
            if removed.pending.is_some() {
                state.deferred.push((buffer, removed));
            }
        }
    }

    fn map_buffer(&self, buffer: BufferKey, offset: u64, size: u64) -> Result<NonNull<u8>> {
        let mut state = self.lock();
        let entry = state
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| Error::InvalidResource("mock: unknown buffer".to_string()))?;
        if !entry.desc.location.is_host_visible() {
            return Err(Error::MappingFailed("mock: device-local memory".to_string()));
        }
        if offset + size > entry.memory.len() as u64 {
            return Err(Error::MappingFailed("mock: range outside buffer".to_string()));
        }
        entry.mapped = true;
        // SAFETY: offset is within the boxed slice, which never reallocates
        let ptr = unsafe { entry.memory.as_mut_ptr().add(offset as usize) };
        state.events.push(MockEvent::Map { buffer, offset, size });
        NonNull::new(ptr).ok_or_else(|| Error::MappingFailed("mock: null pointer".to_string()))
    }

    fn unmap_buffer(&self, buffer: BufferKey) {
        let mut state = self.lock();
        if let Some(entry) = state.buffers.get_mut(buffer) {
            entry.mapped = false;
            state.events.push(MockEvent::Unmap(buffer));
        }
    }

    fn create_view(&self, kind: ViewKind, buffer: BufferKey, format: ViewFormat) -> Result<ViewKey> {
        let mut state = self.lock();
        if state.fail_view_creations > 0 {
            state.fail_view_creations -= 1;
            return Err(Error::AllocationFailed(format!("mock: {:?} view", kind)));
        }
        if !state.buffers.contains_key(buffer) {
            return Err(Error::InvalidResource("mock: view over unknown buffer".to_string()));
        }
        let key = state.views.insert(MockView { kind, buffer, format });
        state.events.push(MockEvent::CreateView(key, kind));
        Ok(key)
    }

    fn destroy_view(&self, view: ViewKey) {
        let mut state = self.lock();
        if let Some(removed) = state.views.remove(view) {
            state.events.push(MockEvent::DestroyView(view, removed.kind));
        }
    }
}

// ============================================================================
// Mock CommandStream
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCommand {
    EnsureState { buffer: BufferKey, state: ResourceState },
    Copy { dst: BufferKey, dst_offset: u64, src: BufferKey, src_offset: u64, size: u64 },
}

#[derive(Debug, Default)]
pub struct MockCommandStream {
    pub commands: Vec<MockCommand>,
}

impl CommandStream for MockCommandStream {
    fn ensure_state(&mut self, buffer: BufferKey, state: ResourceState) -> Result<()> {
        self.commands.push(MockCommand::EnsureState { buffer, state });
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
        self.commands.push(MockCommand::Copy { dst, dst_offset, src, src_offset, size });
        Ok(())
    }
}

// ============================================================================
// Mock TransferContext
// ============================================================================

pub struct MockTransferContext {
    device: Arc<MockGraphicsDevice>,
    pub stream: MockCommandStream,
    submitted: Vec<(CompletionToken, Vec<MockCommand>)>,
    /// Every command ever submitted, in order
    pub history: Vec<MockCommand>,
    last_submitted: CompletionToken,
    completed: CompletionToken,
    free: Vec<ManagedBuffer>,
    retired: Vec<(CompletionToken, ManagedBuffer)>,
    pub acquired: u32,
    pub released: u32,
    pub waits: u32,
    fail_next_flush: bool,
}

impl MockTransferContext {
    pub fn new(device: Arc<MockGraphicsDevice>) -> Self {
        Self {
            device,
            stream: MockCommandStream::default(),
            submitted: Vec::new(),
            history: Vec::new(),
            last_submitted: CompletionToken::NONE,
            completed: CompletionToken::NONE,
            free: Vec::new(),
            retired: Vec::new(),
            acquired: 0,
            released: 0,
            waits: 0,
            fail_next_flush: false,
        }
    }

    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    /// Scratch buffers currently owned by the pool
    pub fn pooled(&self) -> usize {
        self.free.len() + self.retired.len()
    }

    /// Submissions not yet executed
    pub fn pending_submissions(&self) -> usize {
        self.submitted.len()
    }
}

impl TransferContext for MockTransferContext {
    fn acquire_transfer_buffer(&mut self, min_size: u64) -> Result<ManagedBuffer> {
        let completed = self.completed;
        let (ready, still_in_flight): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(token, _)| *token <= completed);
        self.retired = still_in_flight;
        self.free.extend(ready.into_iter().map(|(_, buffer)| buffer));

        self.acquired += 1;
        if let Some(index) = self.free.iter().position(|b| b.capacity() >= min_size) {
            let mut buffer = self.free.swap_remove(index);
            buffer.clear();
            return Ok(buffer);
        }
        ManagedBuffer::create(
            self.device.clone(),
            BufferDesc::new(min_size.max(64), MemoryLocation::HostUpload, BufferUsage::empty())
                .with_name("mock_transfer"),
            MappingMode::AlwaysMap,
        )
    }

    fn release_transfer_buffer(&mut self, buffer: ManagedBuffer) {
        self.released += 1;
        let retire_at = if self.stream.commands.is_empty() {
            self.last_submitted
        } else {
            self.last_submitted.next()
        };
        self.retired.push((retire_at, buffer));
    }

    fn transfer_command_stream(&mut self) -> &mut dyn CommandStream {
        &mut self.stream
    }

    fn flush_transfer(&mut self) -> Result<CompletionToken> {
        if self.fail_next_flush {
            self.fail_next_flush = false;
            self.stream.commands.clear();
            return Err(Error::BackendError("mock: queue submit failed".to_string()));
        }
        if self.stream.commands.is_empty() {
            return Ok(self.last_submitted);
        }
        self.last_submitted = self.last_submitted.next();
        let commands = std::mem::take(&mut self.stream.commands);
        self.history.extend(commands.iter().copied());
        self.device.track_submission(self.last_submitted, &commands);
        self.submitted.push((self.last_submitted, commands));
        Ok(self.last_submitted)
    }

    fn wait_transfer(&mut self, token: CompletionToken) -> Result<()> {
        if token > self.last_submitted {
            return Err(Error::BackendError(format!(
                "mock: token {} was never submitted",
                token.value()
            )));
        }
        self.waits += 1;
        let (done, pending): (Vec<_>, Vec<_>) = self
            .submitted
            .drain(..)
            .partition(|(submitted, _)| *submitted <= token);
        self.submitted = pending;
        for (_, commands) in &done {
            for command in commands {
                self.device.execute(command);
            }
        }
        self.completed = self.completed.max(token);
        self.device.complete(self.completed);
        Ok(())
    }

    fn completed_token(&self) -> CompletionToken {
        self.completed
    }
}
