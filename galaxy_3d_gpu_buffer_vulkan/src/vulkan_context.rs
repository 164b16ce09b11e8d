/// GpuContext - Shared Vulkan objects for the buffer device and transfer contexts
///
/// Contains everything needed for GPU operations:
/// - Instance and logical device for Vulkan API calls
/// - Allocator for memory management
/// - Queue for transfer submissions
/// - Debug messenger when validation is enabled

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::{Mutex, MutexGuard};
use galaxy_3d_gpu_buffer::galaxy3d::{Error, Result};
use galaxy_3d_gpu_buffer::engine_err;

/// Shared GPU context
///
/// Shared (via `Arc`) by VulkanGraphicsDevice and every VulkanTransferContext.
/// The last owner to go away destroys the allocator, the debug messenger,
/// the device and the instance, in that order.
pub struct GpuContext {
    /// Vulkan loader, must outlive the instance
    _entry: ash::Entry,

    /// Vulkan instance
    pub(crate) instance: ash::Instance,

    /// Physical device the logical device was created on
    pub(crate) physical_device: vk::PhysicalDevice,

    /// Vulkan logical device
    pub device: ash::Device,

    /// GPU memory allocator (requires mutex for thread safety)
    /// Wrapped in ManuallyDrop to ensure it's dropped BEFORE the device is destroyed
    pub allocator: ManuallyDrop<Mutex<Allocator>>,

    /// Queue used for transfer submissions (vkQueueSubmit needs external sync)
    queue: Mutex<vk::Queue>,

    /// Queue family of `queue`
    pub queue_family: u32,

    /// Debug utils loader (for validation layers)
    pub(crate) debug_utils_loader: Option<ash::ext::debug_utils::Instance>,

    /// Debug messenger handle
    pub(crate) debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl GpuContext {
    /// Create a new GPU context
    ///
    /// # Arguments
    ///
    /// * `entry` - Vulkan loader
    /// * `instance` - Vulkan instance
    /// * `physical_device` - Selected physical device
    /// * `device` - Vulkan logical device
    /// * `allocator` - GPU memory allocator
    /// * `queue` - Queue for transfer submissions
    /// * `queue_family` - Queue family index of `queue`
    /// * `debug_utils_loader` - Debug utils loader (if validation enabled)
    /// * `debug_messenger` - Debug messenger handle (if validation enabled)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        allocator: Allocator,
        queue: vk::Queue,
        queue_family: u32,
        debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
        debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    ) -> Self {
        Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queue: Mutex::new(queue),
            queue_family,
            debug_utils_loader,
            debug_messenger,
        }
    }

    /// Lock the allocator
    pub(crate) fn allocator(&self) -> Result<MutexGuard<'_, Allocator>> {
        self.allocator
            .lock()
            .map_err(|_| engine_err!("galaxy3d::vulkan", "GPU allocator mutex poisoned"))
    }

    /// Submit command buffers to the transfer queue, signalling `fence`
    pub(crate) fn submit(&self, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| engine_err!("galaxy3d::vulkan", "Queue mutex poisoned"))?;
        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], fence)
                .map_err(|e| engine_err!("galaxy3d::vulkan", "Failed to submit transfer commands to GPU: {:?}", e))
        }
    }

    /// Name of the physical device
    pub fn device_name(&self) -> String {
        unsafe {
            let properties = self.instance.get_physical_device_properties(self.physical_device);
            CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy().into_owned()
        }
    }

    /// Wait until the device is idle
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| Error::BackendError(format!("vkDeviceWaitIdle failed: {:?}", e)))
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            // Wait for device to finish
            self.device.device_wait_idle().ok();

            // 1. Drop allocator: free VkDeviceMemory pages BEFORE destroying device
            ManuallyDrop::drop(&mut self.allocator);

            // 2. Stop routing validation messages during destruction
            #[cfg(feature = "vulkan-validation")]
            crate::debug::cleanup_debug_config();

            // 3. Destroy debug messenger BEFORE device and instance
            if let (Some(debug_utils), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            // 4. Destroy device and instance
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
