#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Rounds `val` up to a multiple of `align` (a power of two).
///
/// `None` if the result does not fit in a `usize`.
#[must_use]
pub const fn align_up(val: usize, align: usize) -> Option<usize> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// The system page size, falling back to 4 KiB if `sysconf` refuses to answer.
#[must_use]
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct EightBytes {
        _a: u32,
        _b: u32,
    }

    #[repr(C)]
    struct TwelveBytes {
        _a: u32,
        _b: u32,
        _c: i32,
    }

    #[test]
    fn encodes_known_requests() {
        // DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_PRIME_HANDLE_TO_FD, AMDKFD_IOC_GET_VERSION
        assert_eq!(iow::<EightBytes>(0x64, 0x09), 0x4008_6409);
        assert_eq!(iowr::<TwelveBytes>(0x64, 0x2d), 0xc00c_642d);
        assert_eq!(ior::<EightBytes>(0x4B, 0x01), 0x8008_4b01);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(usize::MAX - 10, 4096), None);
        assert_eq!(align_up(usize::MAX - 4095, 4096), Some(usize::MAX - 4095));
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(page_size().is_power_of_two());
    }
}
