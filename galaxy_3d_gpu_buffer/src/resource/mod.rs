//! Resource module
//!
//! GPU resources owned by host-side code.

pub mod managed_buffer;

pub use managed_buffer::{ManagedBuffer, MappingMode, BufferWrite};
