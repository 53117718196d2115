//! The kernel-driver interface shared by every binding.

pub mod handles;

use crate::error::{HsaError, HsaResult};
use crate::runtime::{Agent, AllocateFlags, MemoryRegion, Queue};
use std::ffi::c_void;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;

// ===============================================================================================
// Value Types
// ===============================================================================================

/// The kernel modules a `Driver` can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverType {
    /// `amdxdna`, the AI-engine accelerator driver.
    Xdna,
    /// `amdkfd`, the generic compute driver.
    Kfd,
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xdna => write!(f, "XDNA"),
            Self::Kfd => write!(f, "KFD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverQuery {
    GetDriverVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersionInfo {
    pub major: u32,
    pub minor: u32,
}

impl DriverVersionInfo {
    pub const UNKNOWN: Self = Self {
        major: u32::MAX,
        minor: u32::MAX,
    };

    #[must_use]
    pub const fn is_known(&self) -> bool {
        !(self.major == u32::MAX && self.minor == u32::MAX)
    }
}

impl Default for DriverVersionInfo {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Handle for exported / imported memory. Zero is never a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareableHandle {
    pub handle: u64,
}

impl ShareableHandle {
    #[must_use]
    pub const fn new(handle: u64) -> Self {
        Self { handle }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.handle != 0
    }
}

/// Access rights requested for a mapping (`hsa_access_permission_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPermission {
    #[default]
    None,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessPermission {
    /// Decodes the raw runtime value; anything unrecognized grants no access.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::ReadOnly,
            2 => Self::WriteOnly,
            3 => Self::ReadWrite,
            _ => Self::None,
        }
    }
}

/// Converts an [`AccessPermission`] to `mmap` protection flags.
#[must_use]
pub const fn permissions_to_mmap_flags(perms: AccessPermission) -> i32 {
    match perms {
        AccessPermission::ReadOnly => libc::PROT_READ,
        AccessPermission::WriteOnly => libc::PROT_WRITE,
        AccessPermission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        AccessPermission::None => libc::PROT_NONE,
    }
}

// ===============================================================================================
// Hardware Context Configuration
// ===============================================================================================

/// Raw configuration kinds accepted by `config_hw_ctx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCtxConfigType {
    /// Bind AIE compute units (configuration BOs) to the context.
    ComputeUnits = 0,
    /// Restrict a compute queue to a set of CUs.
    CuMask = 1,
}

impl TryFrom<u32> for HwCtxConfigType {
    type Error = HsaError;

    fn try_from(raw: u32) -> HsaResult<Self> {
        match raw {
            0 => Ok(Self::ComputeUnits),
            1 => Ok(Self::CuMask),
            other => Err(HsaError::invalid(format!(
                "unknown hardware context config type {other}"
            ))),
        }
    }
}

/// One AIE compute unit: the BO holding its configuration and the function it runs.
#[derive(Debug, Clone, Copy)]
pub struct CuConfig {
    /// Address of a buffer previously returned by `allocate_memory`.
    pub config_addr: *mut c_void,
    pub func: u32,
}

#[derive(Debug, Clone)]
pub enum HwCtxConfig {
    ComputeUnits(Vec<CuConfig>),
    /// Indices of the compute units the queue may run on.
    CuMask(Vec<u32>),
}

impl HwCtxConfig {
    #[must_use]
    pub const fn config_type(&self) -> HwCtxConfigType {
        match self {
            Self::ComputeUnits(_) => HwCtxConfigType::ComputeUnits,
            Self::CuMask(_) => HwCtxConfigType::CuMask,
        }
    }
}

// ===============================================================================================
// Driver Interface
// ===============================================================================================

/// Interface between the core runtime and an agent's kernel driver.
///
/// Lifecycle calls (`open`, `init`, `close`) need exclusive access; the data
/// path takes `&self` and each binding serializes its own bookkeeping.
pub trait Driver {
    fn kernel_driver_type(&self) -> DriverType;

    fn devnode_name(&self) -> &Path;

    /// Driver version, [`DriverVersionInfo::UNKNOWN`] until `init` has run.
    fn version(&self) -> DriverVersionInfo;

    fn is_open(&self) -> bool;

    /// Opens the device node. Fails with `AlreadyOpen` if it is already open.
    fn open(&mut self) -> HsaResult<()>;

    /// Closes the device node, releasing everything owned through it. Idempotent.
    fn close(&mut self) -> HsaResult<()>;

    /// Driver-specific bring-up; call after `open` and before the data path.
    fn init(&mut self) -> HsaResult<()>;

    fn query_kernel_mode_driver(&mut self, query: DriverQuery) -> HsaResult<()>;

    fn get_agent_properties(&self, agent: &mut Agent) -> HsaResult<()>;

    fn get_memory_properties(&self, node_id: u32, mem_region: &mut MemoryRegion) -> HsaResult<()>;

    /// Allocates agent-accessible memory and returns its virtual address.
    fn allocate_memory(
        &self,
        mem_region: &MemoryRegion,
        alloc_flags: AllocateFlags,
        size: usize,
        node_id: u32,
    ) -> HsaResult<*mut c_void>;

    fn free_memory(&self, mem: *mut c_void, size: usize) -> HsaResult<()>;

    fn create_queue(&self, queue: &mut Queue) -> HsaResult<()>;

    /// Tears down the queue's hardware context; a queue without one is fine.
    fn destroy_queue(&self, queue: &mut Queue) -> HsaResult<()>;

    fn config_hw_ctx(&self, queue: &Queue, config: &HwCtxConfig) -> HsaResult<()>;

    /// Exports an allocation as a dma-buf; returns the descriptor and the
    /// offset of `mem` inside the exported buffer.
    fn export_dmabuf(&self, mem: *mut c_void, size: usize) -> HsaResult<(OwnedFd, usize)>;

    fn import_dmabuf(&self, dmabuf_fd: BorrowedFd<'_>, agent: &Agent)
    -> HsaResult<ShareableHandle>;

    fn map(
        &self,
        handle: ShareableHandle,
        mem: *mut c_void,
        offset: usize,
        size: usize,
        perms: AccessPermission,
    ) -> HsaResult<()>;

    fn unmap(
        &self,
        handle: ShareableHandle,
        mem: *mut c_void,
        offset: usize,
        size: usize,
    ) -> HsaResult<()>;

    /// Releases the object behind `handle` and invalidates it.
    fn release_shareable_handle(&self, handle: &mut ShareableHandle) -> HsaResult<()>;
}

// ===============================================================================================
// Shared Connection State
// ===============================================================================================

/// A character device a driver binding talks to.
pub trait DeviceNode: AsRawFd + Sized {
    /// Opens the node read/write.
    fn open(path: &Path) -> io::Result<Self>;
}

/// State every binding carries: which module, which node, the open device and the version.
#[derive(Debug)]
pub struct DriverCore<D> {
    kernel_driver_type: DriverType,
    devnode_name: PathBuf,
    device: Option<D>,
    version: DriverVersionInfo,
}

impl<D: DeviceNode> DriverCore<D> {
    pub fn new(kernel_driver_type: DriverType, devnode_name: impl Into<PathBuf>) -> Self {
        Self {
            kernel_driver_type,
            devnode_name: devnode_name.into(),
            device: None,
            version: DriverVersionInfo::UNKNOWN,
        }
    }

    #[must_use]
    pub const fn kernel_driver_type(&self) -> DriverType {
        self.kernel_driver_type
    }

    #[must_use]
    pub fn devnode_name(&self) -> &Path {
        &self.devnode_name
    }

    #[must_use]
    pub const fn version(&self) -> DriverVersionInfo {
        self.version
    }

    pub fn set_version(&mut self, version: DriverVersionInfo) {
        self.version = version;
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// The open file descriptor, `None` while closed.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.device.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn device(&self) -> HsaResult<&D> {
        self.device.as_ref().ok_or(HsaError::NotOpen)
    }

    pub fn open(&mut self) -> HsaResult<()> {
        if self.device.is_some() {
            return Err(HsaError::AlreadyOpen(self.devnode_name.display().to_string()));
        }

        let device = D::open(&self.devnode_name)
            .map_err(|e| HsaError::from_os(&e, self.devnode_name.display().to_string()))?;
        debug!(
            driver = %self.kernel_driver_type,
            devnode = %self.devnode_name.display(),
            fd = device.as_raw_fd(),
            "opened device node"
        );
        self.device = Some(device);
        Ok(())
    }

    /// Drops the device, closing its descriptor. Returns whether it was open.
    pub fn close(&mut self) -> bool {
        let was_open = self.device.take().is_some();
        if was_open {
            debug!(driver = %self.kernel_driver_type, "closed device node");
        }
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};

    #[derive(Debug)]
    struct NullNode(File);

    impl AsRawFd for NullNode {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl DeviceNode for NullNode {
        fn open(path: &Path) -> io::Result<Self> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map(Self)
        }
    }

    #[test]
    fn permission_translation_is_total() {
        assert_eq!(permissions_to_mmap_flags(AccessPermission::ReadOnly), libc::PROT_READ);
        assert_eq!(permissions_to_mmap_flags(AccessPermission::WriteOnly), libc::PROT_WRITE);
        assert_eq!(
            permissions_to_mmap_flags(AccessPermission::ReadWrite),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(permissions_to_mmap_flags(AccessPermission::None), libc::PROT_NONE);

        for raw in [0, 4, 17, u32::MAX] {
            assert_eq!(
                permissions_to_mmap_flags(AccessPermission::from_raw(raw)),
                libc::PROT_NONE,
                "raw {raw}"
            );
        }
        for raw in 0..8 {
            let a = permissions_to_mmap_flags(AccessPermission::from_raw(raw));
            let b = permissions_to_mmap_flags(AccessPermission::from_raw(raw));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn shareable_handle_validity() {
        assert!(!ShareableHandle::default().is_valid());
        assert!(ShareableHandle::new(3).is_valid());
    }

    #[test]
    fn version_defaults_to_unknown() {
        let v = DriverVersionInfo::default();
        assert_eq!((v.major, v.minor), (u32::MAX, u32::MAX));
        assert!(!v.is_known());
        assert!(DriverVersionInfo { major: 0, minor: 1 }.is_known());
    }

    #[test]
    fn config_type_rejects_unknown_kinds() {
        assert_eq!(HwCtxConfigType::try_from(0).ok(), Some(HwCtxConfigType::ComputeUnits));
        assert_eq!(HwCtxConfigType::try_from(1).ok(), Some(HwCtxConfigType::CuMask));
        let err = HwCtxConfigType::try_from(9).unwrap_err();
        assert_eq!(err.status(), crate::error::HsaStatus::InvalidArgument);
        assert_eq!(
            HwCtxConfig::CuMask(vec![0]).config_type(),
            HwCtxConfigType::CuMask
        );
    }

    #[test]
    fn core_open_close_lifecycle() {
        let mut core: DriverCore<NullNode> = DriverCore::new(DriverType::Kfd, "/dev/null");
        assert!(core.fd().is_none());
        assert!(matches!(core.device(), Err(HsaError::NotOpen)));

        core.open().unwrap();
        assert!(core.fd().is_some());
        assert!(matches!(core.open(), Err(HsaError::AlreadyOpen(_))));

        assert!(core.close());
        assert!(!core.close());
        assert!(core.fd().is_none());
    }

    #[test]
    fn core_open_missing_node_is_not_found() {
        let mut core: DriverCore<NullNode> =
            DriverCore::new(DriverType::Xdna, "/dev/does-not-exist-hsa-kmd");
        let err = core.open().unwrap_err();
        assert_eq!(err.status(), crate::error::HsaStatus::NotFound);
        assert!(!core.is_open());
    }
}
