#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::driver::DeviceNode;
use crate::xdna::ioctl::{
    AieMetadata, AieVersion, ConfigHwctxArgs, CreateBoArgs, CreateHwctxArgs, DRM_CLOEXEC,
    DRM_AMDXDNA_QUERY_AIE_METADATA, DRM_AMDXDNA_QUERY_AIE_VERSION, DRM_IOCTL_AMDXDNA_CONFIG_HWCTX,
    DRM_IOCTL_AMDXDNA_CREATE_BO, DRM_IOCTL_AMDXDNA_CREATE_HWCTX, DRM_IOCTL_AMDXDNA_DESTROY_HWCTX,
    DRM_IOCTL_AMDXDNA_GET_BO_INFO, DRM_IOCTL_AMDXDNA_GET_INFO, DRM_IOCTL_AMDXDNA_SYNC_BO,
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_PRIME_FD_TO_HANDLE, DRM_IOCTL_PRIME_HANDLE_TO_FD,
    DRM_IOCTL_VERSION, DRM_RDWR, DestroyHwctxArgs, DrmVersion, GemCloseArgs, GetBoInfoArgs,
    GetInfoArgs, PrimeHandleArgs, SyncBoArgs,
};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// The amdxdna control surface a driver instance talks to.
///
/// [`AccelDevice`] issues the real ioctls; anything else implementing this
/// (a simulator, a recording shim) can stand in for the kernel.
pub trait XdnaIoctl: DeviceNode {
    /// DRM driver name reported by the node (`"amdxdna"` for this module).
    fn driver_name(&self) -> io::Result<String>;

    fn query_aie_version(&self) -> io::Result<AieVersion>;

    fn query_aie_metadata(&self) -> io::Result<AieMetadata>;

    /// On success `args.handle` holds the new BO.
    fn create_bo(&self, args: &mut CreateBoArgs) -> io::Result<()>;

    fn get_bo_info(&self, args: &mut GetBoInfoArgs) -> io::Result<()>;

    fn sync_bo(&self, args: &mut SyncBoArgs) -> io::Result<()>;

    /// Drops this process' reference to a BO.
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn create_hwctx(&self, args: &mut CreateHwctxArgs) -> io::Result<()>;

    fn destroy_hwctx(&self, handle: u32) -> io::Result<()>;

    fn config_hwctx(&self, args: &mut ConfigHwctxArgs) -> io::Result<()>;

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<OwnedFd>;

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;

    /// Maps a BO through the device node at `map_offset`.
    ///
    /// # Safety
    /// With `MAP_FIXED` in `flags`, `addr..addr + len` must be a range the caller owns.
    unsafe fn mmap_bo(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        map_offset: u64,
    ) -> io::Result<*mut c_void>;
}

/// A handle to an amdxdna accelerator node (`/dev/accel/accelN`).
#[derive(Debug)]
pub struct AccelDevice {
    file: File,
}

impl AccelDevice {
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

    fn get_info<T: Default>(&self, param: u32) -> io::Result<T> {
        let mut out = T::default();
        let mut args = GetInfoArgs {
            param,
            buffer_size: std::mem::size_of::<T>() as u32,
            buffer: (&raw mut out) as u64,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_AMDXDNA_GET_INFO, &mut args)?;
        }
        Ok(out)
    }
}

impl AsRawFd for AccelDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DeviceNode for AccelDevice {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl XdnaIoctl for AccelDevice {
    fn driver_name(&self) -> io::Result<String> {
        let mut name = [0u8; 64];
        let mut args = DrmVersion {
            name_len: name.len(),
            name: name.as_mut_ptr() as u64,
            ..DrmVersion::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_VERSION, &mut args)?;
        }
        let len = args.name_len.min(name.len());
        Ok(String::from_utf8_lossy(&name[..len]).into_owned())
    }

    fn query_aie_version(&self) -> io::Result<AieVersion> {
        self.get_info(DRM_AMDXDNA_QUERY_AIE_VERSION)
    }

    fn query_aie_metadata(&self) -> io::Result<AieMetadata> {
        self.get_info(DRM_AMDXDNA_QUERY_AIE_METADATA)
    }

    fn create_bo(&self, args: &mut CreateBoArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_CREATE_BO, args) }
    }

    fn get_bo_info(&self, args: &mut GetBoInfoArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_GET_BO_INFO, args) }
    }

    fn sync_bo(&self, args: &mut SyncBoArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_SYNC_BO, args) }
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut args = GemCloseArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    fn create_hwctx(&self, args: &mut CreateHwctxArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_CREATE_HWCTX, args) }
    }

    fn destroy_hwctx(&self, handle: u32) -> io::Result<()> {
        let mut args = DestroyHwctxArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_DESTROY_HWCTX, &mut args) }
    }

    fn config_hwctx(&self, args: &mut ConfigHwctxArgs) -> io::Result<()> {
        unsafe { self.ioctl(DRM_IOCTL_AMDXDNA_CONFIG_HWCTX, args) }
    }

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<OwnedFd> {
        let mut args = PrimeHandleArgs {
            handle,
            flags: DRM_RDWR | DRM_CLOEXEC,
            fd: -1,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut args)?;
            Ok(OwnedFd::from_raw_fd(args.fd))
        }
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut args = PrimeHandleArgs {
            handle: 0,
            flags: 0,
            fd: fd.as_raw_fd(),
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args)?;
        }
        Ok(args.handle)
    }

    unsafe fn mmap_bo(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        map_offset: u64,
    ) -> io::Result<*mut c_void> {
        let ret = unsafe {
            libc::mmap(
                addr,
                len,
                prot,
                flags,
                self.file.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret)
    }
}
