/*!
# Galaxy 3D GPU Buffer

Resizable GPU buffers for the Galaxy 3D rendering engine.

This crate provides the platform-agnostic `ManagedBuffer` and the collaborator
traits it drives. Backend implementations (Vulkan, ...) provide the buffer and
view factory and the transfer queue.

## Architecture

- **GraphicsDevice**: Factory trait for GPU buffers and descriptor views
- **TransferContext**: Transfer-buffer pool, transfer command stream and submission
- **CommandStream**: State transitions and buffer copies on the transfer queue
- **ManagedBuffer**: Buffer + views + mapped window, with resize, append,
  offset writes (host-mapped or staged) and map/unmap

Backend implementations provide concrete types that implement these traits.
*/

// Internal modules
mod error;
mod engine;
pub mod log;
pub mod graphics_device;
pub mod resource;

// Main galaxy3d namespace module
pub mod galaxy3d {
    // Error types
    pub use crate::error::{Error, Result};

    // Engine singleton
    pub use crate::engine::Engine;

    // Device factory trait
    pub use crate::graphics_device::GraphicsDevice;

    // Logging sub-module (types only, macros live at the crate root)
    pub mod log {
        pub use crate::log::{Logger, LogEntry, LogSeverity, DefaultLogger, format_entry};
    }

    // Device sub-module with collaborator traits and buffer types
    pub mod device {
        pub use crate::graphics_device::*;
    }

    // Resource sub-module
    pub mod resource {
        pub use crate::resource::*;
    }
}
