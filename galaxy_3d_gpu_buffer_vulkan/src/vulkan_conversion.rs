/// Conversions from galaxy3d buffer types to Vulkan and gpu-allocator types
///
/// Pure functions, no GPU required.

use ash::vk;
use galaxy_3d_gpu_buffer::galaxy3d::device::{
    BufferUsage, MemoryLocation, ResourceState, ViewFormat, ViewKind,
};

/// Memory location used for the gpu-allocator request
pub(crate) fn memory_location_to_gpu_allocator(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::DeviceLocal => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::HostUpload => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::HostReadback => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

/// Vulkan usage flags for a buffer
///
/// Every buffer can be the source and destination of transfers, which staged
/// writes and preserving resizes rely on. Shader-visible views become storage
/// buffers when structured and texel buffers when typed.
pub(crate) fn buffer_usage_to_vk(usage: BufferUsage, format: ViewFormat) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    let structured = matches!(format, ViewFormat::Structured { .. });

    if usage.contains(BufferUsage::CONSTANT) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::SHADER_RESOURCE) {
        flags |= if structured {
            vk::BufferUsageFlags::STORAGE_BUFFER
        } else {
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
        };
    }
    if usage.contains(BufferUsage::UNORDERED_ACCESS) {
        flags |= if structured {
            vk::BufferUsageFlags::STORAGE_BUFFER
        } else {
            vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
        };
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    flags
}

/// Access mask and pipeline stages of a resource state
pub(crate) fn resource_state_to_vk(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ResourceState::Common => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        ResourceState::CopySource => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::CopyDestination => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ResourceState::VertexAndConstantBuffer => (
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::UNIFORM_READ,
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        ResourceState::IndexBuffer => (
            vk::AccessFlags::INDEX_READ,
            vk::PipelineStageFlags::VERTEX_INPUT,
        ),
        ResourceState::ShaderResource => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        ResourceState::UnorderedAccess => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        ResourceState::HostRead => (
            vk::AccessFlags::HOST_READ,
            vk::PipelineStageFlags::HOST,
        ),
    }
}

/// Whether leaving `state` may have written the buffer
///
/// Consecutive uses in a writing state still need a barrier between them.
pub(crate) fn is_write_state(state: ResourceState) -> bool {
    matches!(
        state,
        ResourceState::Common | ResourceState::CopyDestination | ResourceState::UnorderedAccess
    )
}

/// Descriptor type a view binds as
pub(crate) fn view_descriptor_type(kind: ViewKind, format: ViewFormat) -> vk::DescriptorType {
    let structured = matches!(format, ViewFormat::Structured { .. });
    match kind {
        ViewKind::Constant => vk::DescriptorType::UNIFORM_BUFFER,
        ViewKind::ShaderResource if structured => vk::DescriptorType::STORAGE_BUFFER,
        ViewKind::ShaderResource => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        ViewKind::UnorderedAccess if structured => vk::DescriptorType::STORAGE_BUFFER,
        ViewKind::UnorderedAccess => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    }
}

/// Texel format of a view, None when the view is not a texel buffer
pub(crate) fn view_texel_format(kind: ViewKind, format: ViewFormat) -> Option<vk::Format> {
    match (kind, format) {
        (ViewKind::Constant, _) => None,
        (_, ViewFormat::Structured { .. }) => None,
        (_, ViewFormat::R32Uint) => Some(vk::Format::R32_UINT),
    }
}

/// Device limits on the range a single descriptor may cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ViewLimits {
    pub(crate) max_uniform_buffer_range: u64,
    pub(crate) max_storage_buffer_range: u64,
    pub(crate) max_texel_buffer_elements: u64,
}

impl ViewLimits {
    pub(crate) fn from_device(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_uniform_buffer_range: limits.max_uniform_buffer_range as u64,
            max_storage_buffer_range: limits.max_storage_buffer_range as u64,
            max_texel_buffer_elements: limits.max_texel_buffer_elements as u64,
        }
    }

    /// Bytes a view of `descriptor_type` binds over a buffer of `size` bytes
    ///
    /// Clamped to the device limit; texel ranges are also rounded down to
    /// whole `R32_UINT` texels.
    pub(crate) fn view_range(&self, descriptor_type: vk::DescriptorType, size: u64) -> u64 {
        const TEXEL_SIZE: u64 = 4;
        match descriptor_type {
            vk::DescriptorType::UNIFORM_BUFFER => size.min(self.max_uniform_buffer_range),
            vk::DescriptorType::STORAGE_BUFFER => size.min(self.max_storage_buffer_range),
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                (size / TEXEL_SIZE).min(self.max_texel_buffer_elements) * TEXEL_SIZE
            }
            _ => size,
        }
    }
}

#[cfg(test)]
#[path = "vulkan_conversion_tests.rs"]
mod tests;
