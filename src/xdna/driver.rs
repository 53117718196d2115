#![allow(clippy::cast_possible_truncation)]

use crate::config::DriverConfig;
use crate::driver::handles::{HandleTable, Mapping};
use crate::driver::{
    AccessPermission, CuConfig, Driver, DriverCore, DriverQuery, DriverType, DriverVersionInfo,
    HwCtxConfig, ShareableHandle, permissions_to_mmap_flags,
};
use crate::error::{HsaError, HsaResult};
use crate::runtime::{Agent, AllocateFlags, DeviceType, MemoryRegion, PageSize, Queue};
use crate::utils::{align_up, page_size};
use crate::xdna::cache::clflush_data;
use crate::xdna::device::{AccelDevice, XdnaIoctl};
use crate::xdna::heap::{DEV_HEAP_ALIGN, DEV_HEAP_SIZE, DeviceHeap};
use crate::xdna::ioctl::{
    AMDXDNA_BO_CMD, AMDXDNA_BO_DEV, AMDXDNA_BO_DEV_HEAP, AMDXDNA_BO_SHMEM,
    AMDXDNA_INVALID_BO_HANDLE, AMDXDNA_INVALID_CTX_HANDLE, AMDXDNA_MAX_OPC, AieMetadata,
    ConfigHwctxArgs, CreateBoArgs, CreateHwctxArgs, CuConfigEntry, DRM_AMDXDNA_HWCTX_CONFIG_CU,
    GetBoInfoArgs, QosInfo, encode_config_cu,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fs;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info, warn};

/// DRM driver name reported by amdxdna nodes.
pub const XDNA_DRIVER_NAME: &str = "amdxdna";

/// What a tracked buffer object is and how its CPU mapping was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoKind {
    /// Host memory mapped through the device node.
    Shmem,
    /// Device memory inside the device heap.
    Dev,
    /// Command / kernel-argument buffer mapped through the device node.
    Cmd,
    /// An imported dma-buf mapped at a caller-provided address.
    Imported,
}

#[derive(Debug, Clone, Copy)]
pub struct BoInfo {
    pub kind: BoKind,
    /// Device-coherent memory is never flushed from the CPU side.
    pub fine_grain: bool,
}

#[derive(Debug, Default)]
struct XdnaTables {
    bos: HandleTable<u32, BoInfo>,
    /// Imported handles that currently have no mapping.
    imported: HashSet<u32>,
    hw_contexts: HashSet<u32>,
}

/// [`Driver`] binding for the `amdxdna` AI-engine accelerator driver.
///
/// Generic over the control surface so everything above the ioctls can run
/// against something other than `/dev/accel`.
#[derive(Debug)]
pub struct XdnaDriver<D: XdnaIoctl = AccelDevice> {
    core: DriverCore<D>,
    node_id: u32,
    aie_metadata: Option<AieMetadata>,
    dev_heap: Option<DeviceHeap>,
    initialized: bool,
    tables: Mutex<XdnaTables>,
}

impl<D: XdnaIoctl> XdnaDriver<D> {
    pub fn new(devnode_name: impl Into<PathBuf>) -> Self {
        Self {
            core: DriverCore::new(DriverType::Xdna, devnode_name),
            node_id: 0,
            aie_metadata: None,
            dev_heap: None,
            initialized: false,
            tables: Mutex::new(XdnaTables::default()),
        }
    }

    /// Sets the node id the accelerator agent answers to.
    #[must_use]
    pub const fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    #[must_use]
    pub const fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Looks for an `amdxdna` node under `config.accel_dev_dir` and brings it up.
    ///
    /// # Errors
    /// `NotFound` if no such node exists. If one exists but cannot be opened or
    /// initialized, that failure is returned instead.
    pub fn discover_driver(config: &DriverConfig) -> HsaResult<Self> {
        let dir = &config.accel_dev_dir;
        let mut nodes: Vec<PathBuf> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with("accel"))
                .map(|e| e.path())
                .collect(),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "no accel device directory");
                return Err(HsaError::NotFound(format!(
                    "no accelerator nodes under {}",
                    dir.display()
                )));
            }
        };
        nodes.sort();

        let mut open_error = None;
        for path in nodes {
            let mut driver = Self::new(&path).with_node_id(config.xdna_node_id);
            if let Err(e) = driver.open() {
                debug!(devnode = %path.display(), error = %e, "skipping accel node");
                open_error = Some(e);
                continue;
            }

            let name = match driver.core.device()?.driver_name() {
                Ok(name) => name,
                Err(e) => {
                    debug!(devnode = %path.display(), error = %e, "DRM version query failed");
                    continue;
                }
            };
            if name != XDNA_DRIVER_NAME {
                debug!(devnode = %path.display(), driver = %name, "not an XDNA node");
                continue;
            }

            driver.init()?;
            info!(devnode = %path.display(), "discovered XDNA device");
            return Ok(driver);
        }

        Err(open_error.unwrap_or_else(|| {
            HsaError::NotFound(format!("no {XDNA_DRIVER_NAME} device under {}", dir.display()))
        }))
    }

    /// Size of the device heap every XDNA driver reserves.
    #[must_use]
    pub const fn get_dev_heap_byte_size() -> u64 {
        DEV_HEAP_SIZE as u64
    }

    /// The open control surface.
    ///
    /// # Errors
    /// `NotOpen` before `open` or after `close`.
    pub fn device(&self) -> HsaResult<&D> {
        self.core.device()
    }

    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.core.fd()
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn aie_metadata(&self) -> Option<&AieMetadata> {
        self.aie_metadata.as_ref()
    }

    #[must_use]
    pub const fn dev_heap(&self) -> Option<&DeviceHeap> {
        self.dev_heap.as_ref()
    }

    /// Snapshot of BO handle → address.
    #[must_use]
    pub fn get_handle_mappings(&self) -> HashMap<u32, usize> {
        self.tables.lock().bos.handle_mappings()
    }

    /// Snapshot of address → BO handle.
    #[must_use]
    pub fn get_addr_mappings(&self) -> HashMap<usize, u32> {
        self.tables.lock().bos.addr_mappings()
    }

    /// Reserves the device heap and registers it with the driver.
    ///
    /// # Errors
    /// Any failure leaves no heap and no reservation behind.
    pub fn init_device_heap(&mut self) -> HsaResult<()> {
        if self.dev_heap.is_some() {
            return Ok(());
        }
        let dev = self.core.device()?;

        let mut heap = DeviceHeap::reserve(DEV_HEAP_SIZE, DEV_HEAP_ALIGN)
            .map_err(|e| HsaError::from_os(&e, "device heap reservation"))?;

        let mut create = CreateBoArgs {
            size: DEV_HEAP_SIZE as u64,
            type_: AMDXDNA_BO_DEV_HEAP,
            ..CreateBoArgs::default()
        };
        dev.create_bo(&mut create)
            .map_err(|e| HsaError::from_os(&e, "create device heap BO"))?;

        let mapped = Self::bo_map_offset(dev, create.handle).and_then(|map_offset| unsafe {
            dev.mmap_bo(
                heap.aligned(),
                heap.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                map_offset,
            )
            .map_err(|e| HsaError::from_os(&e, "map device heap"))
        });
        match mapped {
            Ok(addr) if addr == heap.aligned() => {}
            Ok(addr) => {
                Self::close_bo(dev, create.handle);
                return Err(HsaError::Internal(format!(
                    "device heap mapped at {addr:p}, expected {:p}",
                    heap.aligned()
                )));
            }
            Err(e) => {
                Self::close_bo(dev, create.handle);
                return Err(e);
            }
        }

        heap.set_bo_handle(create.handle);
        debug!(
            parent = ?heap.parent(),
            aligned = ?heap.aligned(),
            size = heap.size(),
            handle = create.handle,
            "device heap ready"
        );
        self.dev_heap = Some(heap);
        Ok(())
    }

    /// Drops the heap BO and unmaps the whole reservation. Safe to call repeatedly.
    pub fn free_device_heap(&mut self) -> HsaResult<()> {
        let Some(heap) = self.dev_heap.take() else {
            return Ok(());
        };
        if let Ok(dev) = self.core.device() {
            Self::close_bo(dev, heap.bo_handle());
        }
        debug!(parent = ?heap.parent(), len = heap.parent_len(), "freeing device heap");
        drop(heap);
        Ok(())
    }

    /// Flushes the CPU cache for `len` bytes at `mem + offset` without a driver call.
    ///
    /// # Errors
    /// `InvalidArgument` unless the range lies inside one tracked allocation
    /// that is not device-coherent.
    pub fn flush_cpu_cache(&self, mem: *mut c_void, offset: usize, len: usize) -> HsaResult<()> {
        if len == 0 {
            return Ok(());
        }
        let start = (mem as usize)
            .checked_add(offset)
            .ok_or_else(|| HsaError::invalid("flush range overflows"))?;

        let tables = self.tables.lock();
        let Some((handle, mapping)) = tables.bos.find_containing(start, len) else {
            return Err(HsaError::invalid(format!(
                "{len} bytes at {start:#x} are not inside a tracked allocation"
            )));
        };
        if mapping.info.fine_grain {
            return Err(HsaError::invalid(format!(
                "BO {handle} is device-coherent and is never flushed"
            )));
        }

        unsafe { clflush_data(mem, offset, len) };
        Ok(())
    }

    fn ensure_initialized(&self) -> HsaResult<&D> {
        let dev = self.core.device()?;
        if !self.initialized {
            return Err(HsaError::NotInitialized);
        }
        Ok(dev)
    }

    fn check_node(&self, node_id: u32) -> HsaResult<()> {
        if node_id == self.node_id {
            Ok(())
        } else {
            Err(HsaError::InvalidNodeId(node_id))
        }
    }

    fn bo_map_offset(dev: &D, handle: u32) -> HsaResult<u64> {
        let mut info = GetBoInfoArgs {
            handle,
            ..GetBoInfoArgs::default()
        };
        dev.get_bo_info(&mut info)
            .map_err(|e| HsaError::from_os(&e, "get BO info"))?;
        Ok(info.map_offset)
    }

    fn close_bo(dev: &D, handle: u32) {
        if let Err(e) = dev.gem_close(handle) {
            warn!(handle, error = %e, "failed to close BO");
        }
    }

    /// Creates a BO of `type_` and returns its handle and CPU address.
    fn create_mapped_bo(&self, dev: &D, type_: u32, size: usize) -> HsaResult<(u32, usize)> {
        let mut create = CreateBoArgs {
            size: size as u64,
            type_,
            ..CreateBoArgs::default()
        };
        dev.create_bo(&mut create)
            .map_err(|e| HsaError::from_os(&e, "create BO"))?;
        let handle = create.handle;
        if handle == AMDXDNA_INVALID_BO_HANDLE {
            return Err(HsaError::Internal("driver returned an invalid BO handle".into()));
        }

        let mut info = GetBoInfoArgs {
            handle,
            ..GetBoInfoArgs::default()
        };
        if let Err(e) = dev.get_bo_info(&mut info) {
            Self::close_bo(dev, handle);
            return Err(HsaError::from_os(&e, "get BO info"));
        }

        if type_ == AMDXDNA_BO_DEV {
            let addr = info.vaddr as usize;
            let in_heap = self
                .dev_heap
                .as_ref()
                .is_some_and(|heap| heap.contains(addr, size));
            if !in_heap {
                Self::close_bo(dev, handle);
                return Err(HsaError::Internal(format!(
                    "device BO {handle} at {addr:#x} lies outside the device heap"
                )));
            }
            return Ok((handle, addr));
        }

        let mapped = unsafe {
            dev.mmap_bo(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                info.map_offset,
            )
        };
        match mapped {
            Ok(addr) => Ok((handle, addr as usize)),
            Err(e) => {
                Self::close_bo(dev, handle);
                Err(HsaError::from_os(&e, "map BO"))
            }
        }
    }

    /// Undoes the CPU side of a tracked BO.
    fn release_cpu_mapping(handle: u32, mapping: &Mapping<BoInfo>) {
        let addr = mapping.addr as *mut c_void;
        let ret = match mapping.info.kind {
            BoKind::Dev => return,
            BoKind::Shmem | BoKind::Cmd => unsafe { libc::munmap(addr, mapping.size) },
            // The range belongs to the caller; give it back as an inaccessible reservation.
            BoKind::Imported => {
                let p = unsafe {
                    libc::mmap(
                        addr,
                        mapping.size,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE
                            | libc::MAP_ANONYMOUS
                            | libc::MAP_FIXED
                            | libc::MAP_NORESERVE,
                        -1,
                        0,
                    )
                };
                if p == libc::MAP_FAILED { -1 } else { 0 }
            }
        };
        if ret != 0 {
            warn!(
                handle,
                addr = mapping.addr,
                error = %std::io::Error::last_os_error(),
                "failed to release CPU mapping"
            );
        }
    }

    fn config_hw_ctx_cu(&self, queue: &Queue, cus: &[CuConfig]) -> HsaResult<()> {
        let dev = self.ensure_initialized()?;
        let ctx = queue
            .hw_ctx_handle()
            .ok_or_else(|| HsaError::invalid(format!("queue {} has no hardware context", queue.id)))?;

        let max_cus = self
            .aie_metadata
            .as_ref()
            .map_or(0, AieMetadata::num_core_tiles) as usize;
        if cus.is_empty() || cus.len() > max_cus.min(usize::from(u16::MAX)) {
            return Err(HsaError::invalid(format!(
                "{} compute units requested, context supports 1..={max_cus}",
                cus.len()
            )));
        }

        let entries = {
            let tables = self.tables.lock();
            if !tables.hw_contexts.contains(&ctx) {
                return Err(HsaError::invalid(format!(
                    "hardware context {ctx} was not created by this driver"
                )));
            }
            cus.iter()
                .map(|cu| {
                    let cu_func = u8::try_from(cu.func).map_err(|_| {
                        HsaError::invalid(format!("compute unit function {} out of range", cu.func))
                    })?;
                    let cu_bo = tables.bos.handle_of(cu.config_addr as usize).ok_or_else(|| {
                        HsaError::invalid(format!(
                            "CU configuration {:p} is not an allocated buffer",
                            cu.config_addr
                        ))
                    })?;
                    Ok(CuConfigEntry {
                        cu_bo,
                        cu_func,
                        pad: [0; 3],
                    })
                })
                .collect::<HsaResult<Vec<_>>>()?
        };

        let payload = encode_config_cu(&entries);
        let mut args = ConfigHwctxArgs {
            handle: ctx,
            param_type: DRM_AMDXDNA_HWCTX_CONFIG_CU,
            param_val: payload.as_ptr() as u64,
            param_val_size: payload.len() as u32,
            pad: 0,
        };
        dev.config_hwctx(&mut args)
            .map_err(|e| HsaError::from_os(&e, "configure hardware context CUs"))?;
        debug!(ctx, num_cus = entries.len(), "configured hardware context CUs");
        Ok(())
    }

    fn handle_u32(handle: ShareableHandle) -> HsaResult<u32> {
        if !handle.is_valid() {
            return Err(HsaError::invalid("invalid shareable handle"));
        }
        u32::try_from(handle.handle)
            .map_err(|_| HsaError::invalid(format!("{:#x} is not an XDNA handle", handle.handle)))
    }
}

impl<D: XdnaIoctl> Driver for XdnaDriver<D> {
    fn kernel_driver_type(&self) -> DriverType {
        self.core.kernel_driver_type()
    }

    fn devnode_name(&self) -> &Path {
        self.core.devnode_name()
    }

    fn version(&self) -> DriverVersionInfo {
        self.core.version()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn open(&mut self) -> HsaResult<()> {
        self.core.open()
    }

    fn close(&mut self) -> HsaResult<()> {
        if !self.core.is_open() {
            self.dev_heap = None;
            return Ok(());
        }

        let tables = self.tables.get_mut();
        if let Ok(dev) = self.core.device() {
            let bos = tables.bos.drain();
            if !bos.is_empty() {
                warn!(count = bos.len(), "releasing BOs still allocated at close");
            }
            for (handle, mapping) in bos {
                Self::release_cpu_mapping(handle, &mapping);
                Self::close_bo(dev, handle);
            }
            for handle in tables.imported.drain() {
                Self::close_bo(dev, handle);
            }
            for ctx in tables.hw_contexts.drain() {
                warn!(ctx, "destroying hardware context still alive at close");
                if let Err(e) = dev.destroy_hwctx(ctx) {
                    warn!(ctx, error = %e, "failed to destroy hardware context");
                }
            }
        }

        self.free_device_heap()?;
        self.aie_metadata = None;
        self.initialized = false;
        self.core.close();
        Ok(())
    }

    fn init(&mut self) -> HsaResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.query_kernel_mode_driver(DriverQuery::GetDriverVersion)?;

        let metadata = self
            .core
            .device()?
            .query_aie_metadata()
            .map_err(|e| HsaError::from_os(&e, "AIE metadata query"))?;
        self.aie_metadata = Some(metadata);

        self.init_device_heap()?;
        self.initialized = true;

        let version = self.core.version();
        info!(
            devnode = %self.core.devnode_name().display(),
            major = version.major,
            minor = version.minor,
            cols = metadata.cols,
            rows = metadata.rows,
            "XDNA driver initialized"
        );
        Ok(())
    }

    fn query_kernel_mode_driver(&mut self, query: DriverQuery) -> HsaResult<()> {
        match query {
            DriverQuery::GetDriverVersion => {
                let aie = self
                    .core
                    .device()?
                    .query_aie_version()
                    .map_err(|e| HsaError::from_os(&e, "AIE version query"))?;
                self.core.set_version(DriverVersionInfo {
                    major: aie.major,
                    minor: aie.minor,
                });
                Ok(())
            }
        }
    }

    fn get_agent_properties(&self, agent: &mut Agent) -> HsaResult<()> {
        self.check_node(agent.node_id)?;
        let metadata = self.aie_metadata.as_ref().ok_or(HsaError::NotInitialized)?;

        agent.device_type = DeviceType::Aie;
        agent.name = format!("aie{}", metadata.version.major);
        agent.num_cols = u32::from(metadata.cols);
        agent.num_rows = u32::from(metadata.rows);
        agent.num_cores = metadata.num_core_tiles();
        agent.local_mem_size = Self::get_dev_heap_byte_size();
        Ok(())
    }

    fn get_memory_properties(&self, node_id: u32, mem_region: &mut MemoryRegion) -> HsaResult<()> {
        self.check_node(node_id)?;
        mem_region.node_id = node_id;
        mem_region.page_size = PageSize::Size4K;

        if mem_region.heap_type.is_device_local() {
            mem_region.size = Self::get_dev_heap_byte_size();
        } else {
            let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
            mem_region.size = u64::try_from(pages).unwrap_or(0) * page_size() as u64;
        }
        Ok(())
    }

    fn allocate_memory(
        &self,
        mem_region: &MemoryRegion,
        alloc_flags: AllocateFlags,
        size: usize,
        node_id: u32,
    ) -> HsaResult<*mut c_void> {
        let dev = self.ensure_initialized()?;
        self.check_node(node_id)?;
        if mem_region.node_id != node_id {
            return Err(HsaError::invalid(format!(
                "region of node {} cannot back an allocation on node {node_id}",
                mem_region.node_id
            )));
        }
        if size == 0 {
            return Err(HsaError::invalid("zero-sized allocation"));
        }

        let granularity = alloc_flags.page_size.map_or_else(page_size, PageSize::bytes);
        let size = align_up(size, granularity)
            .filter(|&size| isize::try_from(size).is_ok())
            .ok_or(HsaError::OutOfMemory)?;

        let (type_, kind) = if mem_region.kernarg {
            (AMDXDNA_BO_CMD, BoKind::Cmd)
        } else if mem_region.heap_type.is_device_local() {
            (AMDXDNA_BO_DEV, BoKind::Dev)
        } else {
            (AMDXDNA_BO_SHMEM, BoKind::Shmem)
        };
        if kind == BoKind::Dev && size > DEV_HEAP_SIZE {
            return Err(HsaError::OutOfMemory);
        }

        let (handle, addr) = self.create_mapped_bo(dev, type_, size)?;
        let info = BoInfo {
            kind,
            fine_grain: mem_region.fine_grain || alloc_flags.uncached,
        };

        let mut tables = self.tables.lock();
        if let Err(e) = tables.bos.insert(handle, addr, size, info) {
            drop(tables);
            Self::release_cpu_mapping(handle, &Mapping { addr, size, info });
            Self::close_bo(dev, handle);
            return Err(e);
        }
        debug!(handle, addr, size, ?kind, "allocated BO");
        Ok(addr as *mut c_void)
    }

    fn free_memory(&self, mem: *mut c_void, size: usize) -> HsaResult<()> {
        let dev = self.core.device()?;
        let addr = mem as usize;

        let mut tables = self.tables.lock();
        let handle = tables
            .bos
            .handle_of(addr)
            .ok_or_else(|| HsaError::invalid(format!("{mem:p} was not allocated by this driver")))?;
        let Some(mapping) = tables.bos.get(handle).copied() else {
            return Err(HsaError::Internal(format!("address {addr:#x} maps to a dead handle")));
        };
        if mapping.info.kind == BoKind::Imported {
            return Err(HsaError::invalid(format!(
                "{mem:p} is an imported mapping; unmap it instead"
            )));
        }
        if size > mapping.size {
            return Err(HsaError::invalid(format!(
                "free of {size} bytes exceeds the {}-byte allocation",
                mapping.size
            )));
        }

        tables.bos.remove_by_handle(handle);
        drop(tables);

        // The range is already gone; a failed close only leaks the kernel object.
        Self::release_cpu_mapping(handle, &mapping);
        Self::close_bo(dev, handle);
        debug!(handle, addr, size = mapping.size, "freed BO");
        Ok(())
    }

    fn create_queue(&self, queue: &mut Queue) -> HsaResult<()> {
        let dev = self.ensure_initialized()?;
        self.check_node(queue.node_id)?;
        if let Some(ctx) = queue.hw_ctx_handle() {
            return Err(HsaError::invalid(format!(
                "queue {} already owns hardware context {ctx}",
                queue.id
            )));
        }

        let num_tiles = self
            .aie_metadata
            .as_ref()
            .map_or(0, AieMetadata::num_core_tiles);
        let qos = QosInfo::default();
        let mut args = CreateHwctxArgs {
            qos_p: (&raw const qos) as u64,
            max_opc: AMDXDNA_MAX_OPC,
            num_tiles,
            ..CreateHwctxArgs::default()
        };
        dev.create_hwctx(&mut args)
            .map_err(|e| HsaError::from_os(&e, "create hardware context"))?;
        if args.handle == AMDXDNA_INVALID_CTX_HANDLE {
            if let Err(e) = dev.destroy_hwctx(args.handle) {
                warn!(error = %e, "failed to destroy invalid hardware context");
            }
            return Err(HsaError::Internal(
                "driver returned an invalid hardware context".into(),
            ));
        }

        self.tables.lock().hw_contexts.insert(args.handle);
        queue.set_hw_ctx_handle(Some(args.handle));
        queue.set_doorbell_offset(u64::from(args.umq_doorbell));
        debug!(queue = queue.id, ctx = args.handle, num_tiles, "created hardware context");
        Ok(())
    }

    fn destroy_queue(&self, queue: &mut Queue) -> HsaResult<()> {
        let Some(ctx) = queue.hw_ctx_handle() else {
            return Ok(());
        };
        let dev = self.core.device()?;

        dev.destroy_hwctx(ctx)
            .map_err(|e| HsaError::from_os(&e, "destroy hardware context"))?;
        self.tables.lock().hw_contexts.remove(&ctx);
        queue.set_hw_ctx_handle(None);
        queue.set_doorbell_offset(0);
        debug!(queue = queue.id, ctx, "destroyed hardware context");
        Ok(())
    }

    fn config_hw_ctx(&self, queue: &Queue, config: &HwCtxConfig) -> HsaResult<()> {
        match config {
            HwCtxConfig::ComputeUnits(cus) => self.config_hw_ctx_cu(queue, cus),
            HwCtxConfig::CuMask(_) => Err(HsaError::invalid(
                "CU masks do not apply to AIE hardware contexts",
            )),
        }
    }

    fn export_dmabuf(&self, mem: *mut c_void, size: usize) -> HsaResult<(OwnedFd, usize)> {
        let dev = self.core.device()?;
        if size == 0 {
            return Err(HsaError::invalid("zero-sized export"));
        }

        let tables = self.tables.lock();
        let Some((handle, mapping)) = tables.bos.find_containing(mem as usize, size) else {
            return Err(HsaError::invalid(format!(
                "{size} bytes at {mem:p} are not a tracked allocation"
            )));
        };
        let offset = mem as usize - mapping.addr;

        let fd = dev
            .prime_handle_to_fd(handle)
            .map_err(|e| HsaError::from_os(&e, "export dma-buf"))?;
        debug!(handle, offset, "exported dma-buf");
        Ok((fd, offset))
    }

    fn import_dmabuf(&self, dmabuf_fd: BorrowedFd<'_>, agent: &Agent) -> HsaResult<ShareableHandle> {
        let dev = self.ensure_initialized()?;
        self.check_node(agent.node_id)?;

        let mut tables = self.tables.lock();
        let handle = dev
            .prime_fd_to_handle(dmabuf_fd)
            .map_err(|e| HsaError::from_os(&e, "import dma-buf"))?;
        if handle == AMDXDNA_INVALID_BO_HANDLE {
            return Err(HsaError::Internal("driver returned an invalid BO handle".into()));
        }
        // Importing our own export yields the handle we already track.
        if tables.bos.contains_handle(handle) || tables.imported.contains(&handle) {
            return Err(HsaError::invalid(format!(
                "dma-buf resolves to BO {handle}, which is already tracked"
            )));
        }
        tables.imported.insert(handle);
        debug!(handle, node = agent.node_id, "imported dma-buf");
        Ok(ShareableHandle::new(u64::from(handle)))
    }

    fn map(
        &self,
        handle: ShareableHandle,
        mem: *mut c_void,
        offset: usize,
        size: usize,
        perms: AccessPermission,
    ) -> HsaResult<()> {
        let dev = self.core.device()?;
        let handle = Self::handle_u32(handle)?;
        let addr = mem as usize;
        let page = page_size();
        if size == 0 {
            return Err(HsaError::invalid("zero-sized mapping"));
        }
        if mem.is_null() || addr % page != 0 || offset % page != 0 {
            return Err(HsaError::invalid(format!(
                "mapping at {mem:p} + {offset:#x} is not page aligned"
            )));
        }
        if addr.checked_add(size).is_none() {
            return Err(HsaError::invalid(format!(
                "{size} bytes at {mem:p} run past the address space"
            )));
        }

        let mut tables = self.tables.lock();
        if !tables.imported.contains(&handle) {
            let reason = if tables.bos.contains_handle(handle) {
                "is already mapped"
            } else {
                "is not a live shareable handle"
            };
            return Err(HsaError::invalid(format!("handle {handle} {reason}")));
        }
        if tables.bos.overlaps(addr, size) {
            return Err(HsaError::invalid(format!(
                "{size} bytes at {mem:p} overlap an existing mapping"
            )));
        }

        let map_offset = Self::bo_map_offset(dev, handle)?
            .checked_add(offset as u64)
            .ok_or_else(|| HsaError::invalid(format!("offset {offset:#x} overflows the BO")))?;
        let mapped = unsafe {
            dev.mmap_bo(
                mem,
                size,
                permissions_to_mmap_flags(perms),
                libc::MAP_SHARED | libc::MAP_FIXED,
                map_offset,
            )
        }
        .map_err(|e| HsaError::from_os(&e, "map imported BO"))?;
        if mapped as usize != addr {
            return Err(HsaError::Internal(format!(
                "imported BO {handle} mapped at {mapped:p}, expected {mem:p}"
            )));
        }

        let info = BoInfo {
            kind: BoKind::Imported,
            fine_grain: false,
        };
        if let Err(e) = tables.bos.insert(handle, addr, size, info) {
            Self::release_cpu_mapping(handle, &Mapping { addr, size, info });
            return Err(e);
        }
        tables.imported.remove(&handle);
        debug!(handle, addr, size, ?perms, "mapped imported BO");
        Ok(())
    }

    fn unmap(
        &self,
        handle: ShareableHandle,
        mem: *mut c_void,
        _offset: usize,
        size: usize,
    ) -> HsaResult<()> {
        self.core.device()?;
        let handle = Self::handle_u32(handle)?;

        let mut tables = self.tables.lock();
        let mapping = match tables.bos.get(handle) {
            Some(m) if m.info.kind == BoKind::Imported => *m,
            _ => return Err(HsaError::invalid(format!("handle {handle} is not mapped"))),
        };
        if mapping.addr != mem as usize || (size != 0 && size != mapping.size) {
            return Err(HsaError::invalid(format!(
                "handle {handle} is mapped at {:#x} for {} bytes",
                mapping.addr, mapping.size
            )));
        }

        tables.bos.remove_by_handle(handle);
        tables.imported.insert(handle);
        Self::release_cpu_mapping(handle, &mapping);
        debug!(handle, addr = mapping.addr, "unmapped imported BO");
        Ok(())
    }

    fn release_shareable_handle(&self, handle: &mut ShareableHandle) -> HsaResult<()> {
        let dev = self.core.device()?;
        let raw = Self::handle_u32(*handle)?;

        let mut tables = self.tables.lock();
        if tables.bos.contains_handle(raw) {
            return Err(HsaError::invalid(format!(
                "handle {raw} is still mapped or owns an allocation"
            )));
        }
        if !tables.imported.remove(&raw) {
            return Err(HsaError::invalid(format!("handle {raw} is not a live shareable handle")));
        }
        if let Err(e) = dev.gem_close(raw) {
            tables.imported.insert(raw);
            return Err(HsaError::from_os(&e, "close imported BO"));
        }

        handle.handle = 0;
        debug!(handle = raw, "released shareable handle");
        Ok(())
    }
}

impl<D: XdnaIoctl> Drop for XdnaDriver<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close XDNA driver");
        }
    }
}
