#![allow(dead_code, clippy::unwrap_used)]

//! In-process stand-ins for amdxdna and amdkfd nodes.
//!
//! Buffer objects are plain anonymous mappings; device BOs are carved out of
//! whatever range the heap BO was mapped at, the way the kernel does it.

use hsa_kmd::DriverConfig;
use hsa_kmd::driver::DeviceNode;
use hsa_kmd::kfd::KfdIoctl;
use hsa_kmd::kfd::ioctl::{
    AllocMemoryOfGpuArgs, CreateQueueArgs, GetDmabufInfoArgs, GetVersionArgs, ImportDmabufArgs,
    KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
};
use hsa_kmd::xdna::XdnaIoctl;
use hsa_kmd::xdna::ioctl::{
    AMDXDNA_BO_DEV, AMDXDNA_BO_DEV_HEAP, AieMetadata, AieTileMetadata, AieVersion,
    ConfigHwctxArgs, CreateBoArgs, CreateHwctxArgs, CuConfigEntry, GetBoInfoArgs, SyncBoArgs,
    decode_config_cu,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy)]
pub struct MockBo {
    pub type_: u32,
    pub size: u64,
    pub vaddr: u64,
}

#[derive(Debug, Default)]
pub struct MockState {
    next_handle: u32,
    next_ctx: u32,
    pub bos: HashMap<u32, MockBo>,
    pub closed: Vec<u32>,
    pub contexts: HashSet<u32>,
    pub heap: Option<(usize, usize)>,
    heap_used: usize,
    pub configured_cus: Vec<CuConfigEntry>,
    /// Handle the next import resolves to, instead of a fresh one.
    pub import_as: Option<u32>,
    pub fail_mmap: bool,
    pub fail_create_bo: bool,
    pub fail_gem_close: bool,
    /// Hand out context handle 0, which names no context.
    pub invalid_ctx: bool,
}

impl MockState {
    fn new_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Debug)]
pub struct MockXdna {
    file: File,
    name: String,
    pub state: Mutex<MockState>,
}

const fn map_offset_of(handle: u32) -> u64 {
    (handle as u64) << 32
}

impl AsRawFd for MockXdna {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DeviceNode for MockXdna {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let contents = fs::read_to_string(path)?;
        let name = match contents.trim() {
            "" => "amdxdna".to_string(),
            other => other.to_string(),
        };
        Ok(Self {
            file,
            name,
            state: Mutex::new(MockState::default()),
        })
    }
}

impl XdnaIoctl for MockXdna {
    fn driver_name(&self) -> io::Result<String> {
        Ok(self.name.clone())
    }

    fn query_aie_version(&self) -> io::Result<AieVersion> {
        Ok(AieVersion { major: 1, minor: 0 })
    }

    fn query_aie_metadata(&self) -> io::Result<AieMetadata> {
        Ok(AieMetadata {
            cols: 4,
            rows: 6,
            version: AieVersion { major: 2, minor: 0 },
            core: AieTileMetadata {
                row_count: 4,
                row_start: 2,
                ..AieTileMetadata::default()
            },
            ..AieMetadata::default()
        })
    }

    fn create_bo(&self, args: &mut CreateBoArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.fail_create_bo {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let mut vaddr = 0;
        if args.type_ == AMDXDNA_BO_DEV {
            let (base, len) = st.heap.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            if st.heap_used + args.size as usize > len {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            vaddr = (base + st.heap_used) as u64;
            st.heap_used += args.size as usize;
        }
        let handle = st.new_handle();
        st.bos.insert(
            handle,
            MockBo {
                type_: args.type_,
                size: args.size,
                vaddr,
            },
        );
        args.handle = handle;
        Ok(())
    }

    fn get_bo_info(&self, args: &mut GetBoInfoArgs) -> io::Result<()> {
        let st = self.state.lock();
        let bo = st
            .bos
            .get(&args.handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        args.map_offset = map_offset_of(args.handle);
        args.vaddr = bo.vaddr;
        Ok(())
    }

    fn sync_bo(&self, _args: &mut SyncBoArgs) -> io::Result<()> {
        Ok(())
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.fail_gem_close {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        st.bos
            .remove(&handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        st.closed.push(handle);
        Ok(())
    }

    fn create_hwctx(&self, args: &mut CreateHwctxArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        let ctx = if st.invalid_ctx {
            0
        } else {
            st.next_ctx += 1;
            st.next_ctx
        };
        st.contexts.insert(ctx);
        args.handle = ctx;
        args.umq_doorbell = ctx * 0x1000;
        Ok(())
    }

    fn destroy_hwctx(&self, handle: u32) -> io::Result<()> {
        if self.state.lock().contexts.remove(&handle) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    fn config_hwctx(&self, args: &mut ConfigHwctxArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        if !st.contexts.contains(&args.handle) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let payload = unsafe {
            std::slice::from_raw_parts(args.param_val as *const u8, args.param_val_size as usize)
        };
        st.configured_cus =
            decode_config_cu(payload).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(())
    }

    fn prime_handle_to_fd(&self, handle: u32) -> io::Result<OwnedFd> {
        if !self.state.lock().bos.contains_key(&handle) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok(OwnedFd::from(self.file.try_clone()?))
    }

    fn prime_fd_to_handle(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut st = self.state.lock();
        if let Some(handle) = st.import_as.take() {
            return Ok(handle);
        }
        let handle = st.new_handle();
        st.bos.insert(
            handle,
            MockBo {
                type_: hsa_kmd::xdna::ioctl::AMDXDNA_BO_SHMEM,
                size: 16 * 4096,
                vaddr: 0,
            },
        );
        Ok(handle)
    }

    unsafe fn mmap_bo(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        map_offset: u64,
    ) -> io::Result<*mut c_void> {
        let mut st = self.state.lock();
        if st.fail_mmap {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let handle = (map_offset >> 32) as u32;
        let bo = *st
            .bos
            .get(&handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        let fixed = flags & libc::MAP_FIXED;
        let ret = unsafe {
            libc::mmap(
                addr,
                len,
                prot,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | fixed,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if bo.type_ == AMDXDNA_BO_DEV_HEAP {
            st.heap = Some((ret as usize, len));
            st.heap_used = 0;
        }
        Ok(ret)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockKfdAlloc {
    pub gpu_id: u32,
    pub va: u64,
    pub size: u64,
    pub flags: u32,
    pub imported: bool,
}

#[derive(Debug, Default)]
pub struct MockKfdState {
    next_handle: u64,
    next_queue: u32,
    pub allocations: HashMap<u64, MockKfdAlloc>,
    pub freed: Vec<u64>,
    /// Handles currently mapped into a GPU VM.
    pub gpu_mapped: HashSet<u64>,
    pub queues: HashSet<u32>,
    pub cu_masks: HashMap<u32, Vec<u32>>,
    pub acquired_vms: Vec<u32>,
    pub exported: Vec<u64>,
    /// Size the next dma-buf reports.
    pub dmabuf_size: u64,
    pub fail_alloc: bool,
    pub fail_gpu_map: bool,
}

/// A `/dev/kfd` stand-in. The node file holds the ioctl version as
/// `major.minor`; an empty file reads as 1.18.
#[derive(Debug)]
pub struct MockKfd {
    file: File,
    version: (u32, u32),
    pub state: Mutex<MockKfdState>,
}

impl AsRawFd for MockKfd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DeviceNode for MockKfd {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let contents = fs::read_to_string(path)?;
        let version = match contents.trim().split_once('.') {
            Some((major, minor)) => (major.parse().unwrap(), minor.parse().unwrap()),
            None => (1, 18),
        };
        Ok(Self {
            file,
            version,
            state: Mutex::new(MockKfdState {
                dmabuf_size: 4 * 4096,
                ..MockKfdState::default()
            }),
        })
    }
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

impl KfdIoctl for MockKfd {
    fn get_version(&self) -> io::Result<GetVersionArgs> {
        Ok(GetVersionArgs {
            major_version: self.version.0,
            minor_version: self.version.1,
        })
    }

    fn create_queue(&self, args: &mut CreateQueueArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        st.next_queue += 1;
        let id = st.next_queue;
        st.queues.insert(id);
        args.queue_id = id;
        args.doorbell_offset = u64::from(id) * 8;
        Ok(())
    }

    fn destroy_queue(&self, queue_id: u32) -> io::Result<()> {
        let mut st = self.state.lock();
        st.cu_masks.remove(&queue_id);
        st.queues.remove(&queue_id).then_some(()).ok_or_else(enoent)
    }

    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> io::Result<()> {
        let mut st = self.state.lock();
        if !st.queues.contains(&queue_id) {
            return Err(enoent());
        }
        st.cu_masks.insert(queue_id, mask.to_vec());
        Ok(())
    }

    fn acquire_vm(&self, gpu_id: u32, _drm_fd: u32) -> io::Result<()> {
        self.state.lock().acquired_vms.push(gpu_id);
        Ok(())
    }

    fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.fail_alloc {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        st.next_handle += 1;
        let handle = st.next_handle;
        st.allocations.insert(
            handle,
            MockKfdAlloc {
                gpu_id: args.gpu_id,
                va: args.va_addr,
                size: args.size,
                flags: args.flags,
                imported: false,
            },
        );
        args.handle = handle;
        if args.flags & KFD_IOC_ALLOC_MEM_FLAGS_VRAM != 0 {
            args.mmap_offset = handle << 32;
        }
        Ok(())
    }

    fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        st.allocations.remove(&handle).ok_or_else(enoent)?;
        st.gpu_mapped.remove(&handle);
        st.freed.push(handle);
        Ok(())
    }

    fn map_memory_to_gpu(&self, handle: u64, _gpu_id: u32) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.fail_gpu_map {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if !st.allocations.contains_key(&handle) {
            return Err(enoent());
        }
        st.gpu_mapped.insert(handle);
        Ok(())
    }

    fn unmap_memory_from_gpu(&self, handle: u64, _gpu_id: u32) -> io::Result<()> {
        self.state
            .lock()
            .gpu_mapped
            .remove(&handle)
            .then_some(())
            .ok_or_else(enoent)
    }

    fn get_dmabuf_info(&self, args: &mut GetDmabufInfoArgs) -> io::Result<()> {
        args.size = self.state.lock().dmabuf_size;
        Ok(())
    }

    fn import_dmabuf(&self, args: &mut ImportDmabufArgs) -> io::Result<()> {
        let mut st = self.state.lock();
        st.next_handle += 1;
        let handle = st.next_handle;
        let size = st.dmabuf_size;
        st.allocations.insert(
            handle,
            MockKfdAlloc {
                gpu_id: args.gpu_id,
                va: args.va_addr,
                size,
                flags: 0,
                imported: true,
            },
        );
        args.handle = handle;
        Ok(())
    }

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd> {
        let mut st = self.state.lock();
        if !st.allocations.contains_key(&handle) {
            return Err(enoent());
        }
        st.exported.push(handle);
        Ok(OwnedFd::from(self.file.try_clone()?))
    }

    unsafe fn mmap_render_node(
        &self,
        _render: BorrowedFd<'_>,
        addr: *mut c_void,
        len: usize,
        prot: i32,
        flags: i32,
        _offset: u64,
    ) -> io::Result<*mut c_void> {
        let fixed = flags & libc::MAP_FIXED;
        let ret = unsafe {
            libc::mmap(addr, len, prot, libc::MAP_SHARED | libc::MAP_ANONYMOUS | fixed, -1, 0)
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret)
    }
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Gpu id of the single GPU node in [`kfd_config`]'s topology.
pub const KFD_GPU_ID: u32 = 4660;

/// A KFD setup under `dir`: node 0 is a 16-core CPU, node 1 a 60-CU GPU with
/// 256 MiB of public and ~15.75 GiB of private VRAM behind `renderD128`.
pub fn kfd_config(dir: &Path, version: &str) -> DriverConfig {
    let topology = dir.join("topology");
    write_file(&topology.join("system_properties"), "platform_oem 1\nplatform_id 2\n");
    write_file(
        &topology.join("nodes/0/properties"),
        "cpu_cores_count 16\nsimd_count 0\nmem_banks_count 1\n",
    );
    write_file(
        &topology.join("nodes/0/mem_banks/0/properties"),
        "heap_type 0\nsize_in_bytes 34359738368\n",
    );
    write_file(
        &topology.join("nodes/1/properties"),
        "cpu_cores_count 0\nsimd_count 240\nsimd_per_cu 4\ndrm_render_minor 128\n\
         mem_banks_count 2\n",
    );
    write_file(&topology.join("nodes/1/gpu_id"), &format!("{KFD_GPU_ID}\n"));
    write_file(
        &topology.join("nodes/1/mem_banks/0/properties"),
        "heap_type 1\nsize_in_bytes 268435456\n",
    );
    write_file(
        &topology.join("nodes/1/mem_banks/1/properties"),
        "heap_type 2\nsize_in_bytes 16911433728\n",
    );

    write_file(&dir.join("dri/renderD128"), "");
    write_file(&dir.join("kfd"), version);
    DriverConfig {
        kfd_devnode: dir.join("kfd"),
        kfd_topology_root: topology,
        dri_dev_dir: dir.join("dri"),
        ..DriverConfig::default()
    }
}

static NEXT_NODE: AtomicU32 = AtomicU32::new(0);

/// A scratch directory unique to this process and call.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let n = NEXT_NODE.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("hsa-kmd-{tag}-{}-{n}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Creates a fake device node reporting `driver_name`.
pub fn fake_node(dir: &Path, name: &str, driver_name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, driver_name).unwrap();
    path
}

/// Allocates from a fresh, unmapped region of address space.
pub fn free_va(len: usize) -> *mut c_void {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED);
    addr
}
