/// Config - Vulkan backend configuration

/// Vulkan backend configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Application name reported to the driver
    pub app_name: String,
    /// Application version (major, minor, patch)
    pub app_version: (u32, u32, u32),
    /// Enable validation layers (needs the `vulkan-validation` feature)
    pub enable_validation: bool,
    /// Smallest scratch buffer the transfer pool allocates, in bytes
    pub min_transfer_buffer_size: u64,
    /// Completed scratch buffers kept for reuse; extra ones are destroyed
    pub max_pooled_transfer_buffers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "Galaxy3D Application".to_string(),
            app_version: (1, 0, 0),
            enable_validation: cfg!(debug_assertions),
            min_transfer_buffer_size: 256 * 1024,
            max_pooled_transfer_buffers: 8,
        }
    }
}
