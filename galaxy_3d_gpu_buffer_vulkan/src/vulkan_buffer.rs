/// Buffer and view entries stored by VulkanGraphicsDevice

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use galaxy_3d_gpu_buffer::galaxy3d::device::{BufferKey, MemoryLocation, ResourceState, ViewKind};

use crate::vulkan_context::GpuContext;

/// Vulkan buffer owned by the device
pub(crate) struct BufferEntry {
    /// Vulkan buffer
    pub(crate) buffer: vk::Buffer,
    /// GPU memory allocation
    pub(crate) allocation: Option<Allocation>,
    /// Buffer size
    pub(crate) size: u64,
    /// Memory class the allocation was made in
    pub(crate) location: MemoryLocation,
    /// State recorded by the last transition on a transfer stream
    pub(crate) state: ResourceState,
    /// Host mapping handed out and not yet released
    pub(crate) mapped: bool,
    /// Fences of submitted transfers that reference the buffer
    pub(crate) pending: Vec<vk::Fence>,
}

impl BufferEntry {
    /// Free the allocation and destroy the buffer
    pub(crate) fn destroy(mut self, ctx: &GpuContext) {
        unsafe {
            // Free GPU memory
            if let Some(allocation) = self.allocation.take() {
                // Don't panic if lock fails - we still need to destroy the buffer
                if let Ok(mut allocator) = ctx.allocator.lock() {
                    allocator.free(allocation).ok();
                }
            }

            // Destroy buffer
            ctx.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Descriptor view over a device buffer
pub(crate) struct ViewEntry {
    pub(crate) kind: ViewKind,
    pub(crate) buffer: BufferKey,
    pub(crate) descriptor: ViewDescriptor,
}

impl ViewEntry {
    pub(crate) fn destroy(self, ctx: &GpuContext) {
        if let Some(texel_view) = self.descriptor.texel_view {
            unsafe {
                ctx.device.destroy_buffer_view(texel_view, None);
            }
        }
    }
}

/// What a descriptor write needs to bind a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDescriptor {
    /// Descriptor type the view binds as
    pub descriptor_type: vk::DescriptorType,
    /// Underlying Vulkan buffer
    pub buffer: vk::Buffer,
    /// Bound range in bytes (whole buffer)
    pub range: u64,
    /// Texel buffer view for typed shader-resource and unordered-access views
    pub texel_view: Option<vk::BufferView>,
}

impl ViewDescriptor {
    /// Buffer info for `VkWriteDescriptorSet` of non-texel descriptors
    pub fn buffer_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(self.range)
    }
}
