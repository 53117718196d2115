#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::driver::DeviceNode;
use crate::kfd::ioctl::{
    AMDKFD_IOC_ACQUIRE_VM, AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, AMDKFD_IOC_CREATE_QUEUE,
    AMDKFD_IOC_DESTROY_QUEUE, AMDKFD_IOC_EXPORT_DMABUF, AMDKFD_IOC_FREE_MEMORY_OF_GPU,
    AMDKFD_IOC_GET_DMABUF_INFO, AMDKFD_IOC_GET_VERSION, AMDKFD_IOC_IMPORT_DMABUF,
    AMDKFD_IOC_MAP_MEMORY_TO_GPU, AMDKFD_IOC_SET_CU_MASK, AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU,
    AcquireVmArgs, AllocMemoryOfGpuArgs, CreateQueueArgs, DestroyQueueArgs, ExportDmabufArgs,
    FreeMemoryOfGpuArgs, GetDmabufInfoArgs, GetVersionArgs, ImportDmabufArgs, MapMemoryToGpuArgs,
    SetCuMaskArgs, UnmapMemoryFromGpuArgs,
};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// The amdkfd requests a [`KfdDriver`](crate::kfd::KfdDriver) issues.
pub trait KfdIoctl: DeviceNode {
    fn get_version(&self) -> io::Result<GetVersionArgs>;

    /// On success `args.queue_id` and `args.doorbell_offset` are filled in.
    fn create_queue(&self, args: &mut CreateQueueArgs) -> io::Result<()>;

    fn destroy_queue(&self, queue_id: u32) -> io::Result<()>;

    /// Restricts a queue to the CUs set in `mask`.
    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> io::Result<()>;

    /// Binds the VM of the render node `drm_fd` to `gpu_id`.
    fn acquire_vm(&self, gpu_id: u32, drm_fd: u32) -> io::Result<()>;

    /// On success `args.handle` holds the allocation and `args.mmap_offset`
    /// its offset on the render node.
    fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()>;

    fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()>;

    fn map_memory_to_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()>;

    fn unmap_memory_from_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()>;

    fn get_dmabuf_info(&self, args: &mut GetDmabufInfoArgs) -> io::Result<()>;

    /// Imports a dma-buf at `args.va_addr`; `args.handle` receives the allocation.
    fn import_dmabuf(&self, args: &mut ImportDmabufArgs) -> io::Result<()>;

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd>;

    /// Maps VRAM through `render` at `offset`.
    ///
    /// # Safety
    /// With `MAP_FIXED` in `flags`, `addr..addr + len` must be a range the caller owns.
    unsafe fn mmap_render_node(
        &self,
        render: BorrowedFd<'_>,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        offset: u64,
    ) -> io::Result<*mut c_void>;
}

/// A handle to the KFD driver character device (`/dev/kfd`).
///
/// The file descriptor sits behind an `Arc`, so clones are cheap and share
/// the same open file.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    pub file: Arc<File>,
}

impl KfdDevice {
    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl KfdIoctl for KfdDevice {
    // ===========================================================================================
    // Versioning
    // ===========================================================================================

    fn get_version(&self) -> io::Result<GetVersionArgs> {
        let mut args = GetVersionArgs::default();
        unsafe {
            self.ioctl(AMDKFD_IOC_GET_VERSION, &mut args)?;
        }
        Ok(args)
    }

    // ===========================================================================================
    // Queue Management
    // ===========================================================================================

    fn create_queue(&self, args: &mut CreateQueueArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_CREATE_QUEUE, args) }
    }

    fn destroy_queue(&self, queue_id: u32) -> io::Result<()> {
        let mut args = DestroyQueueArgs { queue_id, pad: 0 };
        unsafe { self.ioctl(AMDKFD_IOC_DESTROY_QUEUE, &mut args) }
    }

    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> io::Result<()> {
        let mut args = SetCuMaskArgs {
            queue_id,
            num_cu_mask: (mask.len() * 32) as u32,
            cu_mask_ptr: mask.as_ptr() as u64,
        };
        unsafe { self.ioctl(AMDKFD_IOC_SET_CU_MASK, &mut args) }
    }

    // ===========================================================================================
    // Memory Management
    // ===========================================================================================

    fn acquire_vm(&self, gpu_id: u32, drm_fd: u32) -> io::Result<()> {
        let mut args = AcquireVmArgs { drm_fd, gpu_id };
        unsafe { self.ioctl(AMDKFD_IOC_ACQUIRE_VM, &mut args) }
    }

    fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, args) }
    }

    fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()> {
        let mut args = FreeMemoryOfGpuArgs { handle };
        unsafe { self.ioctl(AMDKFD_IOC_FREE_MEMORY_OF_GPU, &mut args) }
    }

    fn map_memory_to_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = MapMemoryToGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_MAP_MEMORY_TO_GPU, &mut args) }
    }

    fn unmap_memory_from_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = UnmapMemoryFromGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, &mut args) }
    }

    // ===========================================================================================
    // DMA Buffer Interop
    // ===========================================================================================

    fn get_dmabuf_info(&self, args: &mut GetDmabufInfoArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_GET_DMABUF_INFO, args) }
    }

    fn import_dmabuf(&self, args: &mut ImportDmabufArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_IMPORT_DMABUF, args) }
    }

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd> {
        let mut args = ExportDmabufArgs {
            handle,
            flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            dmabuf_fd: 0,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_EXPORT_DMABUF, &mut args)?;
            Ok(OwnedFd::from_raw_fd(args.dmabuf_fd as RawFd))
        }
    }

    unsafe fn mmap_render_node(
        &self,
        render: BorrowedFd<'_>,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        offset: u64,
    ) -> io::Result<*mut c_void> {
        let ret = unsafe {
            libc::mmap(addr, len, prot, flags, render.as_raw_fd(), offset as libc::off_t)
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret)
    }
}

impl DeviceNode for KfdDevice {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl AsRawFd for KfdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
