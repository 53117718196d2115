//! The slice of the runtime's agent, memory-region and queue objects that the
//! driver layer reads or fills in.

/// Kind of processing agent behind a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Cpu,
    Gpu,
    /// AI engine array (XDNA).
    Aie,
}

/// A processing agent as the driver sees it.
#[derive(Debug, Clone, Default)]
pub struct Agent {
    pub node_id: u32,
    pub device_type: DeviceType,
    pub name: String,
    /// Compute units (GPU) or core tiles (AIE).
    pub num_cores: u32,
    /// AIE columns; zero for other agents.
    pub num_cols: u32,
    /// AIE rows; zero for other agents.
    pub num_rows: u32,
    pub local_mem_size: u64,
}

impl Agent {
    #[must_use]
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }
}

/// Heap classification of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapType {
    #[default]
    System,
    /// Device-local frame buffer visible to the host.
    FrameBufferPublic,
    /// Device-local frame buffer reachable only by the agent.
    FrameBufferPrivate,
}

impl HeapType {
    #[must_use]
    pub const fn is_device_local(self) -> bool {
        matches!(self, Self::FrameBufferPublic | Self::FrameBufferPrivate)
    }
}

/// Allocation granularity requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageSize {
    #[default]
    Size4K,
    Size64K,
    Size2M,
    Size1G,
}

impl PageSize {
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4K => 4 << 10,
            Self::Size64K => 64 << 10,
            Self::Size2M => 2 << 20,
            Self::Size1G => 1 << 30,
        }
    }
}

/// An allocatable memory class.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegion {
    pub node_id: u32,
    pub heap_type: HeapType,
    /// Kernel-argument region (command buffers on XDNA).
    pub kernarg: bool,
    /// Fine-grained regions are device-coherent; the CPU cache is not flushed for them.
    pub fine_grain: bool,
    pub size: u64,
    pub page_size: PageSize,
}

impl MemoryRegion {
    #[must_use]
    pub fn system(node_id: u32) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn device_local(node_id: u32) -> Self {
        Self {
            node_id,
            heap_type: HeapType::FrameBufferPrivate,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kernarg(node_id: u32) -> Self {
        Self {
            node_id,
            kernarg: true,
            ..Self::default()
        }
    }
}

/// Flags controlling a single allocation.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocateFlags {
    /// Only the agent may touch the memory; no host mapping.
    pub restrict: bool,
    pub executable: bool,
    pub non_paged: bool,
    pub uncached: bool,
    pub contiguous: bool,
    /// Back the allocation without creating any CPU mapping.
    pub memory_only: bool,
    pub page_size: Option<PageSize>,
}

impl AllocateFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn restrict(mut self) -> Self {
        self.restrict = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    #[must_use]
    pub const fn non_paged(mut self) -> Self {
        self.non_paged = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub const fn memory_only(mut self) -> Self {
        self.memory_only = true;
        self
    }

    #[must_use]
    pub const fn page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Ring buffer addresses a compute queue is built on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingBuffer {
    pub base: u64,
    pub size: u32,
    pub read_ptr: u64,
    pub write_ptr: u64,
}

/// A logical queue. The driver owns only the hardware-context binding.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    pub id: u64,
    pub node_id: u32,
    pub ring: Option<RingBuffer>,
    hw_ctx_handle: Option<u32>,
    doorbell_offset: u64,
}

impl Queue {
    #[must_use]
    pub fn new(id: u64, node_id: u32) -> Self {
        Self {
            id,
            node_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ring(mut self, ring: RingBuffer) -> Self {
        self.ring = Some(ring);
        self
    }

    /// Handle of the device-side context, if one was created.
    #[must_use]
    pub const fn hw_ctx_handle(&self) -> Option<u32> {
        self.hw_ctx_handle
    }

    pub fn set_hw_ctx_handle(&mut self, handle: Option<u32>) {
        self.hw_ctx_handle = handle;
    }

    #[must_use]
    pub const fn doorbell_offset(&self) -> u64 {
        self.doorbell_offset
    }

    pub fn set_doorbell_offset(&mut self, offset: u64) {
        self.doorbell_offset = offset;
    }
}
