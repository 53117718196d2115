use std::ffi::c_void;
use std::fs;
use std::sync::OnceLock;
use tracing::warn;

const COHERENCY_LINE_SIZE: &str = "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size";

static CACHE_LINE_SIZE: OnceLock<Option<usize>> = OnceLock::new();

/// L1 data cache line size, discovered on first use and cached for the process.
///
/// `None` if neither `sysconf` nor sysfs report a usable value; flushing is
/// then skipped.
pub fn cache_line_size() -> Option<usize> {
    *CACHE_LINE_SIZE.get_or_init(|| {
        let line = discover_line_size();
        if line.is_none() {
            warn!("could not determine the CPU cache line size, clflush disabled");
        }
        line
    })
}

fn discover_line_size() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let ret = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if let Ok(line) = usize::try_from(ret)
            && line.is_power_of_two()
        {
            return Some(line);
        }
    }

    fs::read_to_string(COHERENCY_LINE_SIZE)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|line| line.is_power_of_two())
}

/// Start address of every `line`-sized cache line overlapping
/// `[base + offset, base + offset + len)`.
pub fn flush_line_addresses(
    base: usize,
    offset: usize,
    len: usize,
    line: usize,
) -> impl Iterator<Item = usize> {
    // A range that does not fit in the address space flushes nothing.
    let span = || {
        let first = base.checked_add(offset)?;
        let last = first.checked_add(len.checked_sub(1)?)?;
        let end = (last & !(line - 1)).checked_add(line)?;
        Some((first & !(line - 1), end))
    };
    let (start, end) = if line == 0 { None } else { span() }.unwrap_or((0, 0));
    (start..end).step_by(line.max(1))
}

/// Flushes the CPU cache lines covering `len` bytes at `base + offset`.
///
/// Only valid for memory the CPU may cache and flush itself; device-coherent
/// mappings never need it.
///
/// # Safety
/// `base + offset .. base + offset + len` must be mapped in this process.
pub unsafe fn clflush_data(base: *const c_void, offset: usize, len: usize) {
    let Some(line) = cache_line_size() else {
        return;
    };

    for addr in flush_line_addresses(base as usize, offset, len, line) {
        unsafe { flush_line(addr as *const u8) };
    }
    fence();
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_line(p: *const u8) {
    unsafe { std::arch::x86_64::_mm_clflush(p) };
}

#[cfg(target_arch = "x86")]
unsafe fn flush_line(p: *const u8) {
    unsafe { std::arch::x86::_mm_clflush(p) };
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
unsafe fn flush_line(_p: *const u8) {}

fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_mfence();
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        std::arch::x86::_mm_mfence();
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
