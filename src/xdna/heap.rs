use crate::utils::align_up;
use std::ffi::c_void;
use std::io;
use std::ptr::{self, NonNull};

/// Bytes of device heap handed to the accelerator.
pub const DEV_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Alignment the accelerator requires of the heap base.
pub const DEV_HEAP_ALIGN: usize = 64 * 1024 * 1024;

/// The accelerator's device heap: one anonymous reservation and the aligned
/// window inside it that the device actually sees.
///
/// The OS only guarantees page alignment, so the reservation is `size + align`
/// bytes and the window starts at the first `align` boundary inside it.
/// Dropping the heap unmaps the whole reservation.
#[derive(Debug)]
pub struct DeviceHeap {
    parent: NonNull<c_void>,
    parent_len: usize,
    aligned: NonNull<c_void>,
    size: usize,
    bo_handle: u32,
}

// The heap is a plain address range; access to its contents is synchronized
// by whoever hands out sub-ranges.
unsafe impl Send for DeviceHeap {}
unsafe impl Sync for DeviceHeap {}

impl DeviceHeap {
    /// Reserves an inaccessible range big enough to carve out `size` bytes at `align`.
    ///
    /// # Errors
    /// Returns the OS error if the reservation cannot be made.
    pub fn reserve(size: usize, align: usize) -> io::Result<Self> {
        if size == 0 || !align.is_power_of_two() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let parent_len = size
            .checked_add(align)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                parent_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let parent = NonNull::new(raw).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        let Some(window) = align_up(raw as usize, align) else {
            unsafe { libc::munmap(raw, parent_len) };
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        };
        let offset = window - raw as usize;
        let aligned = unsafe { NonNull::new_unchecked(raw.cast::<u8>().add(offset).cast()) };

        Ok(Self {
            parent,
            parent_len,
            aligned,
            size,
            bo_handle: 0,
        })
    }

    /// Start of the reservation owned by the OS allocator.
    #[must_use]
    pub const fn parent(&self) -> *mut c_void {
        self.parent.as_ptr()
    }

    #[must_use]
    pub const fn parent_len(&self) -> usize {
        self.parent_len
    }

    /// Start of the device-visible window.
    #[must_use]
    pub const fn aligned(&self) -> *mut c_void {
        self.aligned.as_ptr()
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let base = self.aligned.as_ptr() as usize;
        addr >= base && addr.checked_add(len).is_some_and(|end| end <= base + self.size)
    }

    /// The kernel BO backing the window, zero until one is attached.
    #[must_use]
    pub const fn bo_handle(&self) -> u32 {
        self.bo_handle
    }

    pub fn set_bo_handle(&mut self, handle: u32) {
        self.bo_handle = handle;
    }
}

impl Drop for DeviceHeap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.parent.as_ptr(), self.parent_len);
        }
    }
}
