/// Graphics device module - collaborator contracts consumed by managed buffers

// Module declarations
pub mod graphics_device;
pub mod buffer;
pub mod transfer;

// Re-export everything from graphics_device.rs
pub use graphics_device::*;

// Re-export from other modules
pub use buffer::*;
pub use transfer::*;

// Mock graphics device and transfer context for tests (no GPU required)
#[cfg(test)]
pub mod mock_graphics_device;
