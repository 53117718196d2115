use crate::utils::{iow, iowr};

// ===============================================================================================
// DRM Core
// ===============================================================================================

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DrmVersion {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_patchlevel: i32,
    pub name_len: usize,
    pub name: u64,
    pub date_len: usize,
    pub date: u64,
    pub desc_len: usize,
    pub desc: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimeHandleArgs {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

// ===============================================================================================
// Hardware Contexts
// ===============================================================================================

pub const AMDXDNA_INVALID_CTX_HANDLE: u32 = 0;
pub const AMDXDNA_INVALID_BO_HANDLE: u32 = 0;

/// Highest opcode a context accepts.
pub const AMDXDNA_MAX_OPC: u32 = 0x800;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QosInfo {
    pub gops: u32,
    pub fps: u32,
    pub dma_bandwidth: u32,
    pub latency: u32,
    pub frame_exec_time: u32,
    pub priority: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateHwctxArgs {
    pub ext: u64,
    pub ext_flags: u64,
    pub qos_p: u64,
    pub umq_bo: u32,
    pub log_buf_bo: u32,
    pub max_opc: u32,
    pub num_tiles: u32,
    pub mem_size: u32,
    pub umq_doorbell: u32,
    pub handle: u32,
    pub syncobj_handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DestroyHwctxArgs {
    pub handle: u32,
    pub pad: u32,
}

pub const DRM_AMDXDNA_HWCTX_CONFIG_CU: u32 = 0;
pub const DRM_AMDXDNA_HWCTX_ASSIGN_DBG_BUF: u32 = 1;
pub const DRM_AMDXDNA_HWCTX_REMOVE_DBG_BUF: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CuConfigEntry {
    pub cu_bo: u32,
    pub cu_func: u8,
    pub pad: [u8; 3],
}

/// Header of the variable-length `amdxdna_hwctx_param_config_cu` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct HwctxParamConfigCu {
    pub num_cus: u16,
    pub pad: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ConfigHwctxArgs {
    pub handle: u32,
    pub param_type: u32,
    pub param_val: u64,
    pub param_val_size: u32,
    pub pad: u32,
}

/// Serializes a CU configuration: the header followed by `num_cus` entries.
#[must_use]
pub fn encode_config_cu(entries: &[CuConfigEntry]) -> Vec<u8> {
    let header_len = std::mem::size_of::<HwctxParamConfigCu>();
    let entry_len = std::mem::size_of::<CuConfigEntry>();
    let mut buf = Vec::with_capacity(header_len + entries.len() * entry_len);

    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(entries.len() as u16).to_ne_bytes());
    buf.resize(header_len, 0);
    for entry in entries {
        buf.extend_from_slice(&entry.cu_bo.to_ne_bytes());
        buf.push(entry.cu_func);
        buf.extend_from_slice(&entry.pad);
    }
    buf
}

/// Inverse of [`encode_config_cu`]; `None` if the buffer is truncated.
#[must_use]
pub fn decode_config_cu(buf: &[u8]) -> Option<Vec<CuConfigEntry>> {
    let header_len = std::mem::size_of::<HwctxParamConfigCu>();
    let entry_len = std::mem::size_of::<CuConfigEntry>();
    let num_cus = u16::from_ne_bytes(buf.get(0..2)?.try_into().ok()?) as usize;
    let body = buf.get(header_len..header_len + num_cus * entry_len)?;

    Some(
        body.chunks_exact(entry_len)
            .map(|c| CuConfigEntry {
                cu_bo: u32::from_ne_bytes([c[0], c[1], c[2], c[3]]),
                cu_func: c[4],
                pad: [0; 3],
            })
            .collect(),
    )
}

// ===============================================================================================
// Buffer Objects
// ===============================================================================================

pub const AMDXDNA_BO_INVALID: u32 = 0;
pub const AMDXDNA_BO_SHMEM: u32 = 1;
pub const AMDXDNA_BO_DEV_HEAP: u32 = 2;
pub const AMDXDNA_BO_DEV: u32 = 3;
pub const AMDXDNA_BO_CMD: u32 = 4;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateBoArgs {
    pub flags: u64,
    pub vaddr: u64,
    pub size: u64,
    pub type_: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetBoInfoArgs {
    pub ext: u64,
    pub ext_flags: u64,
    pub handle: u32,
    pub pad: u32,
    pub map_offset: u64,
    pub vaddr: u64,
    pub xdna_addr: u64,
}

pub const SYNC_DIRECT_TO_DEVICE: u32 = 0;
pub const SYNC_DIRECT_FROM_DEVICE: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SyncBoArgs {
    pub handle: u32,
    pub direction: u32,
    pub offset: u64,
    pub size: u64,
}

// ===============================================================================================
// Device Queries
// ===============================================================================================

pub const DRM_AMDXDNA_QUERY_AIE_STATUS: u32 = 0;
pub const DRM_AMDXDNA_QUERY_AIE_METADATA: u32 = 1;
pub const DRM_AMDXDNA_QUERY_AIE_VERSION: u32 = 2;
pub const DRM_AMDXDNA_QUERY_CLOCK_METADATA: u32 = 3;
pub const DRM_AMDXDNA_QUERY_FIRMWARE_VERSION: u32 = 8;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetInfoArgs {
    pub param: u32,
    pub buffer_size: u32,
    pub buffer: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AieVersion {
    pub major: u32,
    pub minor: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AieTileMetadata {
    pub row_count: u16,
    pub row_start: u16,
    pub dma_channel_count: u16,
    pub lock_count: u16,
    pub event_reg_count: u16,
    pub pad: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AieMetadata {
    pub col_size: u32,
    pub cols: u16,
    pub rows: u16,
    pub version: AieVersion,
    pub core: AieTileMetadata,
    pub mem: AieTileMetadata,
    pub shim: AieTileMetadata,
}

impl AieMetadata {
    /// Number of core (compute) tiles in the array.
    #[must_use]
    pub const fn num_core_tiles(&self) -> u32 {
        self.cols as u32 * self.core.row_count as u32
    }
}

// ===============================================================================================
// IOCTL Command Definitions
// ===============================================================================================

pub const DRM_IOCTL_VERSION: u32 = iowr::<DrmVersion>(DRM_IOCTL_BASE, 0x00);
pub const DRM_IOCTL_GEM_CLOSE: u32 = iow::<GemCloseArgs>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = iowr::<PrimeHandleArgs>(DRM_IOCTL_BASE, 0x2d);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = iowr::<PrimeHandleArgs>(DRM_IOCTL_BASE, 0x2e);

pub const DRM_IOCTL_AMDXDNA_CREATE_HWCTX: u32 =
    iowr::<CreateHwctxArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE);
pub const DRM_IOCTL_AMDXDNA_DESTROY_HWCTX: u32 =
    iowr::<DestroyHwctxArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 1);
pub const DRM_IOCTL_AMDXDNA_CONFIG_HWCTX: u32 =
    iowr::<ConfigHwctxArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 2);
pub const DRM_IOCTL_AMDXDNA_CREATE_BO: u32 =
    iowr::<CreateBoArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 3);
pub const DRM_IOCTL_AMDXDNA_GET_BO_INFO: u32 =
    iowr::<GetBoInfoArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 4);
pub const DRM_IOCTL_AMDXDNA_SYNC_BO: u32 =
    iowr::<SyncBoArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 5);
pub const DRM_IOCTL_AMDXDNA_GET_INFO: u32 =
    iowr::<GetInfoArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 7);
