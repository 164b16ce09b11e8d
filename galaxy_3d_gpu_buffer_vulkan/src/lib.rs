/*!
# Galaxy 3D GPU Buffer - Vulkan Backend

Vulkan implementation of the galaxy_3d_gpu_buffer collaborator traits.

This crate provides a headless `VulkanGraphicsDevice` (buffer and view factory)
and a `VulkanTransferContext` (transfer queue, barriers, copies and scratch
buffer pool) using the Ash library for Vulkan bindings and gpu-allocator for
memory management.

## Usage

```no_run
use std::sync::Arc;
use galaxy_3d_gpu_buffer::galaxy3d::device::{BufferDesc, BufferUsage, MemoryLocation};
use galaxy_3d_gpu_buffer::galaxy3d::resource::{BufferWrite, ManagedBuffer, MappingMode};
use galaxy_3d_gpu_buffer_vulkan::galaxy3d::{Config, VulkanGraphicsDevice, VulkanTransferContext};

# fn main() -> galaxy_3d_gpu_buffer::galaxy3d::Result<()> {
let device = Arc::new(VulkanGraphicsDevice::new(Config::default())?);
let mut transfer = VulkanTransferContext::new(device.clone())?;

let mut vertices = ManagedBuffer::create(
    device,
    BufferDesc::new(4096, MemoryLocation::DeviceLocal, BufferUsage::VERTEX),
    MappingMode::MapWhenNeeded,
)?;
vertices.append(&mut transfer, BufferWrite::new(&[0u8; 64]).blocking(true))?;
# Ok(())
# }
```
*/

// Vulkan implementation modules
mod vulkan_config;
mod vulkan_context;
mod vulkan_buffer;
mod vulkan_conversion;
mod vulkan_graphics_device;
mod vulkan_transfer_context;

#[cfg(feature = "vulkan-validation")]
mod debug;

// Main galaxy3d namespace module
pub mod galaxy3d {
    pub use crate::vulkan_config::Config;
    pub use crate::vulkan_context::GpuContext;
    pub use crate::vulkan_buffer::ViewDescriptor;
    pub use crate::vulkan_graphics_device::VulkanGraphicsDevice;
    pub use crate::vulkan_transfer_context::{VulkanCommandStream, VulkanTransferContext};

    // Validation statistics
    #[cfg(feature = "vulkan-validation")]
    pub use crate::debug::{print_validation_stats_report, validation_stats, ValidationStats};
}
