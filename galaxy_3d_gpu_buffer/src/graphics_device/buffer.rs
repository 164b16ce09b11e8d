/// Buffer descriptor, memory location, usage flags and view formats

use bitflags::bitflags;

/// Sentinel size meaning "from the offset to the end of the buffer"
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Memory class a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory, written through staged transfers
    DeviceLocal,
    /// Host-visible memory the CPU writes and the GPU reads
    HostUpload,
    /// Host-visible memory the GPU writes and the CPU reads
    HostReadback,
}

impl MemoryLocation {
    /// Whether the host can map this memory
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryLocation::DeviceLocal)
    }
}

bitflags! {
    /// How shaders and fixed-function stages access the buffer
    ///
    /// CONSTANT, SHADER_RESOURCE and UNORDERED_ACCESS each get a descriptor view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Constant buffer view (cbv)
        const CONSTANT = 1 << 0;
        /// Read-only shader resource view (srv)
        const SHADER_RESOURCE = 1 << 1;
        /// Read-write unordered access view (uav)
        const UNORDERED_ACCESS = 1 << 2;
        /// Bound as vertex buffer
        const VERTEX = 1 << 3;
        /// Bound as index buffer
        const INDEX = 1 << 4;
    }
}

/// Kind of descriptor view created over a buffer
///
/// `ALL` lists kinds in creation and destruction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Constant,
    ShaderResource,
    UnorderedAccess,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [
        ViewKind::Constant,
        ViewKind::ShaderResource,
        ViewKind::UnorderedAccess,
    ];

    /// Usage flag requesting this view
    pub fn usage_flag(&self) -> BufferUsage {
        match self {
            ViewKind::Constant => BufferUsage::CONSTANT,
            ViewKind::ShaderResource => BufferUsage::SHADER_RESOURCE,
            ViewKind::UnorderedAccess => BufferUsage::UNORDERED_ACCESS,
        }
    }

    /// Slot of this kind in per-kind arrays
    pub fn index(&self) -> usize {
        match self {
            ViewKind::Constant => 0,
            ViewKind::ShaderResource => 1,
            ViewKind::UnorderedAccess => 2,
        }
    }
}

/// Element interpretation of a descriptor view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewFormat {
    /// Structured elements of `stride` bytes
    Structured { stride: u32 },
    /// Packed 32-bit unsigned integers
    R32Uint,
}

impl ViewFormat {
    /// Size in bytes of one element seen through the view
    pub fn element_size(&self) -> u32 {
        match self {
            ViewFormat::Structured { stride } => *stride,
            ViewFormat::R32Uint => 4,
        }
    }
}

/// Descriptor for creating a GPU buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub capacity: u64,
    /// Memory class
    pub location: MemoryLocation,
    /// Views to create and binding points
    pub usage: BufferUsage,
    /// Structured element stride in bytes (0 = typed 32-bit view)
    pub structure_stride: u32,
    /// Debug name (logs, allocator labels)
    pub name: String,
}

impl BufferDesc {
    pub fn new(capacity: u64, location: MemoryLocation, usage: BufferUsage) -> Self {
        Self {
            capacity,
            location,
            usage,
            structure_stride: 0,
            name: String::from("buffer"),
        }
    }

    pub fn with_structure_stride(mut self, stride: u32) -> Self {
        self.structure_stride = stride;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// View format derived from the structure stride
    pub fn view_format(&self) -> ViewFormat {
        if self.structure_stride > 0 {
            ViewFormat::Structured { stride: self.structure_stride }
        } else {
            ViewFormat::R32Uint
        }
    }

    /// View kinds requested by `usage`, in creation order
    pub fn view_kinds(&self) -> impl Iterator<Item = ViewKind> + '_ {
        ViewKind::ALL
            .into_iter()
            .filter(move |kind| self.usage.contains(kind.usage_flag()))
    }
}

/// Byte range inside a buffer, `size == WHOLE_SIZE` meaning "to the end"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    /// The entire buffer
    pub const WHOLE: BufferRange = BufferRange { offset: 0, size: WHOLE_SIZE };

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// From `offset` to the end of the buffer
    pub fn from_offset(offset: u64) -> Self {
        Self { offset, size: WHOLE_SIZE }
    }

    /// Resolve sentinels against `capacity`
    ///
    /// Returns `(offset, size)` or None when the range does not fit.
    pub fn resolve(&self, capacity: u64) -> Option<(u64, u64)> {
        let size = if self.size == WHOLE_SIZE {
            capacity.checked_sub(self.offset)?
        } else {
            self.size
        };
        let end = self.offset.checked_add(size)?;
        (end <= capacity).then_some((self.offset, size))
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
