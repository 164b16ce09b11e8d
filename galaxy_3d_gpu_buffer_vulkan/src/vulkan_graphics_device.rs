/// VulkanGraphicsDevice - Vulkan implementation of the GraphicsDevice trait
///
/// Headless: no surface or swapchain, one queue used for transfers.

use galaxy_3d_gpu_buffer::galaxy3d::{Error, GraphicsDevice, Result};
use galaxy_3d_gpu_buffer::galaxy3d::device::{
    BufferDesc, BufferKey, MemoryLocation, ResourceState, ViewFormat, ViewKey, ViewKind,
};
use galaxy_3d_gpu_buffer::{engine_debug, engine_err, engine_error, engine_info, engine_trace, engine_warn};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::AllocationError;
use slotmap::SlotMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::vulkan_buffer::{BufferEntry, ViewDescriptor, ViewEntry};
use crate::vulkan_config::Config;
use crate::vulkan_context::GpuContext;
use crate::vulkan_conversion::{
    buffer_usage_to_vk, memory_location_to_gpu_allocator, view_descriptor_type, view_texel_format,
    ViewLimits,
};

const LOG_SOURCE: &str = "galaxy3d::vulkan";

/// Vulkan buffer and view factory
///
/// Buffers and views live in slot maps behind mutexes so the device can be
/// shared as `Arc<dyn GraphicsDevice>` by every ManagedBuffer.
///
/// Transfer contexts report which buffers each submission references. A
/// buffer destroyed while one of those submissions is in flight is parked
/// until the context releases the submission's fence.
pub struct VulkanGraphicsDevice {
    /// Shared GPU context (instance, device, allocator, queue)
    ctx: Arc<GpuContext>,
    /// Configuration the device was created with
    config: Config,
    /// Descriptor range limits of the physical device
    limits: ViewLimits,
    buffers: Mutex<SlotMap<BufferKey, BufferEntry>>,
    views: Mutex<SlotMap<ViewKey, ViewEntry>>,
    /// Destroyed buffers still referenced by in-flight transfers
    deferred: Mutex<Vec<BufferEntry>>,
}

impl VulkanGraphicsDevice {
    /// Create a headless Vulkan device
    ///
    /// # Errors
    ///
    /// `InitializationFailed` when the loader, instance, physical device,
    /// logical device or allocator cannot be set up.
    pub fn new(config: Config) -> Result<Self> {
        unsafe {
            // Create Vulkan Entry
            let entry = ash::Entry::load()
                .map_err(|e| {
                    engine_error!(LOG_SOURCE, "Failed to load Vulkan library: {:?}", e);
                    Error::InitializationFailed(format!("Failed to load Vulkan library: {:?}", e))
                })?;

            // Application Info
            let app_name = CString::new(config.app_name.clone())
                .unwrap_or_else(|_| CString::from(c"Galaxy3D Application"));
            let (major, minor, patch) = config.app_version;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, major, minor, patch))
                .engine_name(c"Galaxy3D")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let validation = config.enable_validation && cfg!(feature = "vulkan-validation");
            if config.enable_validation && !validation {
                engine_warn!(LOG_SOURCE, "Validation requested but the vulkan-validation feature is disabled");
            }

            // Debug utils extension and validation layer
            let extension_names = if validation {
                vec![ash::ext::debug_utils::NAME.as_ptr()]
            } else {
                vec![]
            };
            let layer_names = if validation {
                vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
            } else {
                vec![]
            };

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names)
                .enabled_extension_names(&extension_names);

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| {
                    engine_error!(LOG_SOURCE, "Failed to create Vulkan instance: {:?}", e);
                    Error::InitializationFailed(format!("Failed to create instance: {:?}", e))
                })?;

            let (debug_utils_loader, debug_messenger) = if validation {
                match create_debug_messenger(&entry, &instance) {
                    Ok(pair) => pair,
                    Err(e) => {
                        instance.destroy_instance(None);
                        return Err(e);
                    }
                }
            } else {
                (None, None)
            };

            let destroy_instance = |instance: &ash::Instance| {
                if let (Some(debug_utils), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                    debug_utils.destroy_debug_utils_messenger(messenger, None);
                }
                instance.destroy_instance(None);
            };

            // Pick Physical Device (discrete GPU first)
            let physical_devices = match instance.enumerate_physical_devices() {
                Ok(devices) => devices,
                Err(e) => {
                    destroy_instance(&instance);
                    engine_error!(LOG_SOURCE, "Failed to enumerate physical devices: {:?}", e);
                    return Err(Error::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e)));
                }
            };
            let physical_device = match physical_devices
                .iter()
                .copied()
                .find(|&pd| {
                    instance.get_physical_device_properties(pd).device_type
                        == vk::PhysicalDeviceType::DISCRETE_GPU
                })
                .or_else(|| physical_devices.first().copied())
            {
                Some(pd) => pd,
                None => {
                    destroy_instance(&instance);
                    engine_error!(LOG_SOURCE, "No Vulkan-capable GPU found");
                    return Err(Error::InitializationFailed("No Vulkan-capable GPU found".to_string()));
                }
            };

            // Find a queue family able to record copies and barriers
            let queue_families = instance.get_physical_device_queue_family_properties(physical_device);
            let queue_family = match select_queue_family(&queue_families) {
                Some(index) => index,
                None => {
                    destroy_instance(&instance);
                    engine_error!(LOG_SOURCE, "No transfer-capable queue family found");
                    return Err(Error::InitializationFailed("No transfer-capable queue family found".to_string()));
                }
            };

            // Create Logical Device
            let queue_priorities = [1.0];
            let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos);

            let device = match instance.create_device(physical_device, &device_create_info, None) {
                Ok(device) => device,
                Err(e) => {
                    destroy_instance(&instance);
                    engine_error!(LOG_SOURCE, "Failed to create logical device: {:?}", e);
                    return Err(Error::InitializationFailed(format!("Failed to create device: {:?}", e)));
                }
            };
            let queue = device.get_device_queue(queue_family, 0);
            let limits = ViewLimits::from_device(
                &instance.get_physical_device_properties(physical_device).limits,
            );

            // Create GPU allocator
            let allocator = match Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            }) {
                Ok(allocator) => allocator,
                Err(e) => {
                    device.destroy_device(None);
                    destroy_instance(&instance);
                    engine_error!(LOG_SOURCE, "Failed to create GPU allocator: {:?}", e);
                    return Err(Error::InitializationFailed(format!("Failed to create allocator: {:?}", e)));
                }
            };

            let ctx = Arc::new(GpuContext::new(
                entry,
                instance,
                physical_device,
                device,
                allocator,
                queue,
                queue_family,
                debug_utils_loader,
                debug_messenger,
            ));
            engine_info!(
                LOG_SOURCE,
                "Vulkan device ready: {} (queue family {}, validation {})",
                ctx.device_name(), queue_family, validation
            );

            Ok(Self {
                ctx,
                config,
                limits,
                buffers: Mutex::new(SlotMap::with_key()),
                views: Mutex::new(SlotMap::with_key()),
                deferred: Mutex::new(Vec::new()),
            })
        }
    }

    /// Shared GPU context
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer_count(&self) -> usize {
        self.lock_buffers().map(|b| b.len()).unwrap_or(0)
    }

    pub fn view_count(&self) -> usize {
        self.lock_views().map(|v| v.len()).unwrap_or(0)
    }

    /// Vulkan handle of a buffer
    pub fn raw_buffer(&self, buffer: BufferKey) -> Option<vk::Buffer> {
        self.lock_buffers().ok()?.get(buffer).map(|entry| entry.buffer)
    }

    /// Last state recorded for a buffer
    pub fn buffer_state(&self, buffer: BufferKey) -> Option<ResourceState> {
        self.lock_buffers().ok()?.get(buffer).map(|entry| entry.state)
    }

    /// Binding information of a view
    pub fn view_descriptor(&self, view: ViewKey) -> Option<ViewDescriptor> {
        self.lock_views().ok()?.get(view).map(|entry| entry.descriptor)
    }

    /// Destroyed buffers waiting for an in-flight transfer
    pub fn deferred_buffer_count(&self) -> usize {
        self.deferred.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Vulkan handle and tracked state of a buffer
    pub(crate) fn tracked_state(&self, buffer: BufferKey) -> Result<(vk::Buffer, ResourceState)> {
        let buffers = self.lock_buffers()?;
        let entry = buffers
            .get(buffer)
            .ok_or_else(|| Error::InvalidResource(format!("Unknown buffer {:?}", buffer)))?;
        Ok((entry.buffer, entry.state))
    }

    /// Record `state` as the tracked state of `buffer`
    ///
    /// Only called once the matching barrier is recorded, or to roll back
    /// barriers that never reached the queue. Unknown keys are ignored.
    pub(crate) fn commit_state(&self, buffer: BufferKey, state: ResourceState) -> Result<()> {
        if let Some(entry) = self.lock_buffers()?.get_mut(buffer) {
            entry.state = state;
        }
        Ok(())
    }

    /// Mark `buffers` as referenced by the submission signalling `fence`
    pub(crate) fn track_submission(&self, buffers: &[BufferKey], fence: vk::Fence) -> Result<()> {
        let mut table = self.lock_buffers()?;
        for &key in buffers {
            if let Some(entry) = table.get_mut(key) {
                entry.pending.push(fence);
            }
        }
        Ok(())
    }

    /// Forget a completed submission and destroy buffers that only it held
    ///
    /// Must be called before `fence` is reset or destroyed.
    pub(crate) fn release_fence(&self, fence: vk::Fence) {
        if let Ok(mut buffers) = self.lock_buffers() {
            for (_, entry) in buffers.iter_mut() {
                entry.pending.retain(|&pending| pending != fence);
            }
        }

        let released: Vec<BufferEntry> = match self.deferred.lock() {
            Ok(mut deferred) => {
                for entry in deferred.iter_mut() {
                    entry.pending.retain(|&pending| pending != fence);
                }
                let (done, waiting): (Vec<_>, Vec<_>) =
                    deferred.drain(..).partition(|entry| entry.pending.is_empty());
                *deferred = waiting;
                done
            }
            Err(_) => return,
        };
        for entry in released {
            engine_trace!(LOG_SOURCE, "Releasing deferred buffer ({} bytes)", entry.size);
            entry.destroy(&self.ctx);
        }
    }

    fn lock_buffers(&self) -> Result<MutexGuard<'_, SlotMap<BufferKey, BufferEntry>>> {
        self.buffers
            .lock()
            .map_err(|_| engine_err!(LOG_SOURCE, "Buffer table mutex poisoned"))
    }

    fn lock_views(&self) -> Result<MutexGuard<'_, SlotMap<ViewKey, ViewEntry>>> {
        self.views
            .lock()
            .map_err(|_| engine_err!(LOG_SOURCE, "View table mutex poisoned"))
    }
}

/// Queue family for transfers: graphics, then compute, then transfer-only
fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    [vk::QueueFlags::GRAPHICS, vk::QueueFlags::COMPUTE, vk::QueueFlags::TRANSFER]
        .into_iter()
        .find_map(|flag| {
            families
                .iter()
                .position(|qf| qf.queue_count > 0 && qf.queue_flags.contains(flag))
        })
        .map(|index| index as u32)
}

#[cfg(feature = "vulkan-validation")]
unsafe fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);
    crate::debug::init_debug_config();

    let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(crate::debug::vulkan_debug_callback));

    let messenger = debug_utils
        .create_debug_utils_messenger(&debug_info, None)
        .map_err(|e| {
            engine_error!(LOG_SOURCE, "Failed to create debug messenger: {:?}", e);
            Error::InitializationFailed(format!("Failed to create debug messenger: {:?}", e))
        })?;

    Ok((Some(debug_utils), Some(messenger)))
}

#[cfg(not(feature = "vulkan-validation"))]
unsafe fn create_debug_messenger(
    _entry: &ash::Entry,
    _instance: &ash::Instance,
) -> Result<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
    Ok((None, None))
}

impl GraphicsDevice for VulkanGraphicsDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferKey> {
        unsafe {
            let usage = buffer_usage_to_vk(desc.usage, desc.view_format());

            // Create buffer
            let buffer_create_info = vk::BufferCreateInfo::default()
                .size(desc.capacity)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self.ctx.device.create_buffer(&buffer_create_info, None)
                .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create buffer '{}' of size {} bytes: {:?}", desc.name, desc.capacity, e))?;

            // Allocate memory
            let requirements = self.ctx.device.get_buffer_memory_requirements(buffer);

            let allocation = self.ctx.allocator().and_then(|mut allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name: &desc.name,
                        requirements,
                        location: memory_location_to_gpu_allocator(desc.location),
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| match e {
                        AllocationError::OutOfMemory => {
                            let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                            engine_error!(LOG_SOURCE, "Out of GPU memory for buffer '{}' (required: {:.2} MB)", desc.name, size_mb);
                            Error::OutOfMemory
                        }
                        other => {
                            engine_error!(LOG_SOURCE, "Failed to allocate memory for buffer '{}': {:?}", desc.name, other);
                            Error::AllocationFailed(format!("{:?}", other))
                        }
                    })
            });
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.ctx.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            // Bind memory
            let entry = BufferEntry {
                buffer,
                allocation: Some(allocation),
                size: desc.capacity,
                location: desc.location,
                state: ResourceState::Common,
                mapped: false,
                pending: Vec::new(),
            };
            let bound = entry
                .allocation
                .as_ref()
                .map(|a| self.ctx.device.bind_buffer_memory(buffer, a.memory(), a.offset()));
            if let Some(Err(e)) = bound {
                entry.destroy(&self.ctx);
                return Err(engine_err!(LOG_SOURCE, "Failed to bind buffer memory: {:?}", e));
            }

            let key = match self.lock_buffers() {
                Ok(mut buffers) => buffers.insert(entry),
                Err(e) => {
                    entry.destroy(&self.ctx);
                    return Err(e);
                }
            };
            engine_trace!(
                LOG_SOURCE,
                "Created buffer '{}' ({} bytes, {:?}, {:?})",
                desc.name, desc.capacity, desc.location, usage
            );
            Ok(key)
        }
    }

    fn destroy_buffer(&self, buffer: BufferKey) {
        let entry = match self.lock_buffers() {
            Ok(mut buffers) => buffers.remove(buffer),
            Err(_) => return,
        };
        let Some(entry) = entry else {
            return;
        };
        if let Ok(views) = self.lock_views() {
            let dangling = views.values().filter(|view| view.buffer == buffer).count();
            if dangling > 0 {
                engine_warn!(LOG_SOURCE, "Buffer destroyed while {} view(s) still reference it", dangling);
            }
        }
        if entry.pending.is_empty() {
            entry.destroy(&self.ctx);
            return;
        }
        engine_trace!(
            LOG_SOURCE,
            "Deferring destruction of buffer {:?} until {} transfer(s) complete",
            buffer, entry.pending.len()
        );
        match self.deferred.lock() {
            Ok(mut deferred) => deferred.push(entry),
            // Nobody can release it any more, wait for the queue instead
            Err(_) => {
                self.ctx.wait_idle().ok();
                entry.destroy(&self.ctx);
            }
        }
    }

    fn map_buffer(&self, buffer: BufferKey, offset: u64, size: u64) -> Result<NonNull<u8>> {
        let mut buffers = self.lock_buffers()?;
        let entry = buffers
            .get_mut(buffer)
            .ok_or_else(|| Error::InvalidResource(format!("Unknown buffer {:?}", buffer)))?;

        if entry.location == MemoryLocation::DeviceLocal {
            return Err(Error::MappingFailed("Device-local buffers cannot be mapped".to_string()));
        }
        let end = offset.checked_add(size).filter(|&end| end <= entry.size);
        if end.is_none() {
            return Err(Error::MappingFailed(format!(
                "Range [{}, +{}) outside buffer of {} bytes",
                offset, size, entry.size
            )));
        }

        // gpu-allocator keeps host-visible memory persistently mapped
        let base = entry
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| engine_err!(LOG_SOURCE, "Buffer memory is not CPU-accessible"))?;
        entry.mapped = true;

        // SAFETY: offset + size was checked against the allocation size
        let ptr = unsafe { base.as_ptr().cast::<u8>().add(offset as usize) };
        NonNull::new(ptr).ok_or_else(|| Error::MappingFailed("Null mapped pointer".to_string()))
    }

    fn unmap_buffer(&self, buffer: BufferKey) {
        if let Ok(mut buffers) = self.lock_buffers() {
            if let Some(entry) = buffers.get_mut(buffer) {
                entry.mapped = false;
            }
        }
    }

    fn create_view(&self, kind: ViewKind, buffer: BufferKey, format: ViewFormat) -> Result<ViewKey> {
        let (raw, size) = {
            let buffers = self.lock_buffers()?;
            let entry = buffers
                .get(buffer)
                .ok_or_else(|| Error::InvalidResource(format!("View over unknown buffer {:?}", buffer)))?;
            (entry.buffer, entry.size)
        };

        let descriptor_type = view_descriptor_type(kind, format);
        let range = self.limits.view_range(descriptor_type, size);
        if range == 0 {
            return Err(Error::InvalidResource(format!(
                "{:?} view over a {} byte buffer binds no data",
                kind, size
            )));
        }
        if range < size {
            engine_warn!(
                LOG_SOURCE,
                "{:?} view covers {} of {} bytes (device limit for {:?})",
                kind, range, size, descriptor_type
            );
        }

        let texel_view = match view_texel_format(kind, format) {
            Some(vk_format) => {
                let create_info = vk::BufferViewCreateInfo::default()
                    .buffer(raw)
                    .format(vk_format)
                    .offset(0)
                    .range(range);
                let view = unsafe { self.ctx.device.create_buffer_view(&create_info, None) }
                    .map_err(|e| {
                        engine_error!(LOG_SOURCE, "Failed to create {:?} texel view: {:?}", kind, e);
                        Error::AllocationFailed(format!("Failed to create {:?} texel view: {:?}", kind, e))
                    })?;
                Some(view)
            }
            None => None,
        };

        let entry = ViewEntry {
            kind,
            buffer,
            descriptor: ViewDescriptor {
                descriptor_type,
                buffer: raw,
                range,
                texel_view,
            },
        };
        match self.lock_views() {
            Ok(mut views) => Ok(views.insert(entry)),
            Err(e) => {
                entry.destroy(&self.ctx);
                Err(e)
            }
        }
    }

    fn destroy_view(&self, view: ViewKey) {
        let entry = match self.lock_views() {
            Ok(mut views) => views.remove(view),
            Err(_) => return,
        };
        if let Some(entry) = entry {
            engine_trace!(LOG_SOURCE, "Destroyed {:?} view", entry.kind);
            entry.destroy(&self.ctx);
        }
    }
}

impl Drop for VulkanGraphicsDevice {
    fn drop(&mut self) {
        self.ctx.wait_idle().ok();

        let views: Vec<ViewEntry> = match self.views.get_mut() {
            Ok(views) => views.drain().map(|(_, v)| v).collect(),
            Err(_) => Vec::new(),
        };
        let mut buffers: Vec<BufferEntry> = match self.buffers.get_mut() {
            Ok(buffers) => buffers.drain().map(|(_, b)| b).collect(),
            Err(_) => Vec::new(),
        };
        // The queue is idle, nothing deferred is in use any more
        if let Ok(deferred) = self.deferred.get_mut() {
            buffers.append(deferred);
        }
        if !views.is_empty() || !buffers.is_empty() {
            engine_debug!(
                LOG_SOURCE,
                "Releasing {} leaked buffer(s) and {} view(s)",
                buffers.len(), views.len()
            );
        }
        for view in views {
            view.destroy(&self.ctx);
        }
        for buffer in buffers {
            buffer.destroy(&self.ctx);
        }
    }
}
