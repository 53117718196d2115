#![allow(clippy::cast_possible_truncation)]

use crate::config::DriverConfig;
use crate::driver::handles::{HandleTable, Mapping};
use crate::driver::{
    AccessPermission, Driver, DriverCore, DriverQuery, DriverType, DriverVersionInfo, HwCtxConfig,
    ShareableHandle,
};
use crate::error::{HsaError, HsaResult};
use crate::kfd::device::{KfdDevice, KfdIoctl};
use crate::kfd::ioctl::{
    CreateQueueArgs, GetDmabufInfoArgs, ImportDmabufArgs, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT, KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE,
    KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE, KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
    KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, KFD_IOC_ALLOC_MEM_FLAGS_USERPTR,
    KFD_IOC_ALLOC_MEM_FLAGS_VRAM, KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE,
    KFD_IOC_QUEUE_TYPE_COMPUTE_AQL, KFD_IOCTL_MAJOR_VERSION, KFD_MAX_QUEUE_PERCENTAGE,
    AllocMemoryOfGpuArgs, cu_mask_words,
};
use crate::kfd::sysfs::{
    HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE, HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC, HSA_HEAPTYPE_SYSTEM,
    Node, Topology,
};
use crate::runtime::{Agent, AllocateFlags, DeviceType, HeapType, MemoryRegion, PageSize, Queue};
use crate::utils::{align_up, page_size};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::ptr;
use tracing::{debug, info, warn};

const DEFAULT_QUEUE_PRIORITY: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    /// Host pages registered with the GPU.
    Userptr,
    /// VRAM inside a reserved VA range; `cpu_mapped` if the render node backs it.
    Vram { cpu_mapped: bool },
    /// A dma-buf imported into a reserved VA range.
    Imported,
}

#[derive(Debug, Clone, Copy)]
struct KfdAlloc {
    kind: AllocKind,
    gpu_id: u32,
}

#[derive(Debug, Default)]
struct KfdTables {
    allocations: HandleTable<u64, KfdAlloc>,
    /// Imported handles currently mapped into the GPU VM.
    mapped: HashSet<u64>,
    queues: HashSet<u32>,
}

/// [`Driver`] binding for `amdkfd`, the generic GPU compute driver.
///
/// `D` is the KFD node the driver talks to; [`KfdDevice`] outside of tests.
#[derive(Debug)]
pub struct KfdDriver<D: KfdIoctl = KfdDevice> {
    core: DriverCore<D>,
    config: DriverConfig,
    topology: Option<Topology>,
    /// Render nodes whose VMs were acquired, by KFD gpu id.
    render_nodes: HashMap<u32, File>,
    tables: Mutex<KfdTables>,
}

/// Reserves `size` bytes of inaccessible address space.
fn reserve_va(size: usize) -> HsaResult<*mut c_void> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(HsaError::from_os(&io::Error::last_os_error(), "reserve VA"));
    }
    Ok(addr)
}

fn unmap_va(addr: usize, size: usize) {
    if unsafe { libc::munmap(addr as *mut c_void, size) } != 0 {
        warn!(addr, size, error = %io::Error::last_os_error(), "munmap failed");
    }
}

fn kfd_alloc_flags(mem_region: &MemoryRegion, alloc_flags: AllocateFlags) -> u32 {
    let mut flags = KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
    if alloc_flags.executable {
        flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
    }
    if mem_region.fine_grain {
        flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
    }
    if alloc_flags.uncached {
        flags |= KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED;
    }
    if alloc_flags.contiguous {
        flags |= KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT;
    }
    flags
}

impl<D: KfdIoctl> KfdDriver<D> {
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            core: DriverCore::new(DriverType::Kfd, config.kfd_devnode.clone()),
            config,
            topology: None,
            render_nodes: HashMap::new(),
            tables: Mutex::new(KfdTables::default()),
        }
    }

    #[must_use]
    pub const fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    /// Address an imported handle was placed at.
    #[must_use]
    pub fn imported_address(&self, handle: ShareableHandle) -> Option<*mut c_void> {
        let tables = self.tables.lock();
        let mapping = tables.allocations.get(handle.handle)?;
        (mapping.info.kind == AllocKind::Imported).then_some(mapping.addr as *mut c_void)
    }

    /// Snapshot of allocation handle → address.
    #[must_use]
    pub fn get_handle_mappings(&self) -> HashMap<u64, usize> {
        self.tables.lock().allocations.handle_mappings()
    }

    /// The open KFD node.
    ///
    /// # Errors
    /// `NotOpen` before `open` or after `close`.
    pub fn device(&self) -> HsaResult<&D> {
        self.core.device()
    }

    fn ensure_initialized(&self) -> HsaResult<(&D, &Topology)> {
        let dev = self.core.device()?;
        let topology = self.topology.as_ref().ok_or(HsaError::NotInitialized)?;
        Ok((dev, topology))
    }

    fn node(topology: &Topology, node_id: u32) -> HsaResult<&Node> {
        topology.node(node_id).ok_or(HsaError::InvalidNodeId(node_id))
    }

    /// The GPU that backs allocations made for `node`: the node itself, or the
    /// first GPU for CPU nodes.
    fn backing_gpu<'a>(topology: &'a Topology, node: &'a Node) -> HsaResult<&'a Node> {
        if node.properties.is_gpu() {
            return Ok(node);
        }
        topology
            .gpu_nodes()
            .next()
            .ok_or_else(|| HsaError::DriverUnsupported("no GPU node in the KFD topology".into()))
    }

    fn acquire_vms(&mut self) -> HsaResult<()> {
        let topology = self.topology.as_ref().ok_or(HsaError::NotInitialized)?;
        let dev = self.core.device()?;

        for node in topology.gpu_nodes() {
            let props = &node.properties;
            let path = self
                .config
                .dri_dev_dir
                .join(format!("renderD{}", props.drm_render_minor));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| HsaError::from_os(&e, path.display().to_string()))?;
            dev.acquire_vm(props.kfd_gpu_id, file.as_raw_fd() as u32)
                .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_ACQUIRE_VM"))?;
            debug!(gpu_id = props.kfd_gpu_id, render = %path.display(), "acquired GPU VM");
            self.render_nodes.insert(props.kfd_gpu_id, file);
        }
        Ok(())
    }

    /// Releases everything behind one table entry.
    fn release_allocation(dev: &D, handle: u64, mapping: &Mapping<KfdAlloc>, mapped: bool) {
        if (mapping.info.kind != AllocKind::Imported || mapped)
            && let Err(e) = dev.unmap_memory_from_gpu(handle, mapping.info.gpu_id)
        {
            warn!(handle, error = %e, "failed to unmap from GPU");
        }
        if let Err(e) = dev.free_memory_of_gpu(handle) {
            warn!(handle, error = %e, "failed to free GPU memory");
        }
        unmap_va(mapping.addr, mapping.size);
    }

    fn allocate_userptr(
        dev: &D,
        gpu_id: u32,
        size: usize,
        flags: u32,
    ) -> HsaResult<(u64, usize, AllocKind)> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(HsaError::from_os(&io::Error::last_os_error(), "host pages"));
        }
        let addr = addr as usize;

        let mut args = AllocMemoryOfGpuArgs {
            va_addr: addr as u64,
            size: size as u64,
            handle: 0,
            mmap_offset: addr as u64,
            gpu_id,
            flags: flags | KFD_IOC_ALLOC_MEM_FLAGS_USERPTR,
        };
        if let Err(e) = dev.alloc_memory_of_gpu(&mut args) {
            unmap_va(addr, size);
            return Err(HsaError::from_os(&e, "AMDKFD_IOC_ALLOC_MEMORY_OF_GPU"));
        }
        Ok((args.handle, addr, AllocKind::Userptr))
    }

    fn allocate_vram(
        &self,
        dev: &D,
        gpu_id: u32,
        size: usize,
        flags: u32,
        cpu_access: bool,
    ) -> HsaResult<(u64, usize, AllocKind)> {
        let render = self
            .render_nodes
            .get(&gpu_id)
            .ok_or_else(|| HsaError::Internal(format!("no render node for GPU {gpu_id}")))?;
        let addr = reserve_va(size)? as usize;

        let mut args = AllocMemoryOfGpuArgs {
            va_addr: addr as u64,
            size: size as u64,
            handle: 0,
            mmap_offset: 0,
            gpu_id,
            flags: flags | KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
        };
        if let Err(e) = dev.alloc_memory_of_gpu(&mut args) {
            unmap_va(addr, size);
            return Err(HsaError::from_os(&e, "AMDKFD_IOC_ALLOC_MEMORY_OF_GPU"));
        }

        if cpu_access {
            let mapped = unsafe {
                dev.mmap_render_node(
                    render.as_fd(),
                    addr as *mut c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    args.mmap_offset,
                )
            };
            if let Err(e) = mapped {
                dev.free_memory_of_gpu(args.handle).ok();
                unmap_va(addr, size);
                return Err(HsaError::from_os(&e, "map VRAM"));
            }
        }
        Ok((args.handle, addr, AllocKind::Vram { cpu_mapped: cpu_access }))
    }
}

impl<D: KfdIoctl> Driver for KfdDriver<D> {
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
        let tables = self.tables.get_mut();
        if let Ok(dev) = self.core.device() {
            for queue_id in tables.queues.drain() {
                warn!(queue_id, "destroying queue still alive at close");
                if let Err(e) = dev.destroy_queue(queue_id) {
                    warn!(queue_id, error = %e, "failed to destroy queue");
                }
            }
            let allocations = tables.allocations.drain();
            if !allocations.is_empty() {
                warn!(count = allocations.len(), "releasing allocations still alive at close");
            }
            for (handle, mapping) in allocations {
                let mapped = tables.mapped.contains(&handle);
                Self::release_allocation(dev, handle, &mapping, mapped);
            }
            tables.mapped.clear();
        }

        self.render_nodes.clear();
        self.topology = None;
        self.core.close();
        Ok(())
    }

    fn init(&mut self) -> HsaResult<()> {
        if self.topology.is_some() {
            return Ok(());
        }
        self.query_kernel_mode_driver(DriverQuery::GetDriverVersion)?;
        let version = self.core.version();
        if version.major != KFD_IOCTL_MAJOR_VERSION {
            return Err(HsaError::DriverUnsupported(format!(
                "KFD ioctl version {}.{}, expected major {KFD_IOCTL_MAJOR_VERSION}",
                version.major, version.minor
            )));
        }

        let topology = Topology::snapshot(&self.config.kfd_topology_root).map_err(|e| {
            HsaError::from_os(&e, self.config.kfd_topology_root.display().to_string())
        })?;
        self.topology = Some(topology);

        if let Err(e) = self.acquire_vms() {
            self.render_nodes.clear();
            self.topology = None;
            return Err(e);
        }

        info!(
            major = version.major,
            minor = version.minor,
            nodes = self.topology.as_ref().map_or(0, |t| t.nodes.len()),
            "KFD driver initialized"
        );
        Ok(())
    }

    fn query_kernel_mode_driver(&mut self, query: DriverQuery) -> HsaResult<()> {
        match query {
            DriverQuery::GetDriverVersion => {
                let v = self
                    .core
                    .device()?
                    .get_version()
                    .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_GET_VERSION"))?;
                self.core.set_version(DriverVersionInfo {
                    major: v.major_version,
                    minor: v.minor_version,
                });
                Ok(())
            }
        }
    }

    fn get_agent_properties(&self, agent: &mut Agent) -> HsaResult<()> {
        let (_, topology) = self.ensure_initialized()?;
        let node = Self::node(topology, agent.node_id)?;
        let props = &node.properties;

        if props.is_gpu() {
            agent.device_type = DeviceType::Gpu;
            agent.num_cores = props.num_compute_units();
            agent.local_mem_size = [HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC, HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE]
                .iter()
                .filter_map(|&t| node.bank_size(t))
                .sum();
        } else {
            agent.device_type = DeviceType::Cpu;
            agent.num_cores = props.cpu_cores_count;
            agent.local_mem_size = 0;
        }
        agent.name.clone_from(&props.marketing_name);
        agent.num_cols = 0;
        agent.num_rows = 0;
        Ok(())
    }

    fn get_memory_properties(&self, node_id: u32, mem_region: &mut MemoryRegion) -> HsaResult<()> {
        let (_, topology) = self.ensure_initialized()?;
        let node = Self::node(topology, node_id)?;

        let heap_type = match mem_region.heap_type {
            HeapType::System => HSA_HEAPTYPE_SYSTEM,
            HeapType::FrameBufferPublic => HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC,
            HeapType::FrameBufferPrivate => HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE,
        };
        let size = node.bank_size(heap_type).ok_or_else(|| {
            HsaError::invalid(format!(
                "node {node_id} has no {:?} memory",
                mem_region.heap_type
            ))
        })?;

        mem_region.node_id = node_id;
        mem_region.size = size;
        mem_region.page_size = PageSize::Size4K;
        Ok(())
    }

    fn allocate_memory(
        &self,
        mem_region: &MemoryRegion,
        alloc_flags: AllocateFlags,
        size: usize,
        node_id: u32,
    ) -> HsaResult<*mut c_void> {
        let (dev, topology) = self.ensure_initialized()?;
        let node = Self::node(topology, node_id)?;
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
        let mut flags = kfd_alloc_flags(mem_region, alloc_flags);

        let (handle, addr, kind, gpu_id) = if mem_region.heap_type.is_device_local() {
            if !node.properties.is_gpu() {
                return Err(HsaError::invalid(format!("node {node_id} has no device memory")));
            }
            let gpu_id = node.properties.kfd_gpu_id;
            if mem_region.heap_type == HeapType::FrameBufferPublic {
                flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
            } else {
                flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
            }
            let cpu_access = !alloc_flags.memory_only && !alloc_flags.restrict;
            let (h, a, k) = self.allocate_vram(dev, gpu_id, size, flags, cpu_access)?;
            (h, a, k, gpu_id)
        } else {
            let gpu_id = Self::backing_gpu(topology, node)?.properties.kfd_gpu_id;
            let (h, a, k) = Self::allocate_userptr(dev, gpu_id, size, flags)?;
            (h, a, k, gpu_id)
        };

        let info = KfdAlloc { kind, gpu_id };
        let mapping = Mapping { addr, size, info };
        if let Err(e) = dev.map_memory_to_gpu(handle, gpu_id) {
            dev.free_memory_of_gpu(handle).ok();
            unmap_va(addr, size);
            return Err(HsaError::from_os(&e, "AMDKFD_IOC_MAP_MEMORY_TO_GPU"));
        }

        if let Err(e) = self.tables.lock().allocations.insert(handle, addr, size, info) {
            Self::release_allocation(dev, handle, &mapping, true);
            return Err(e);
        }
        debug!(handle, addr, size, gpu_id, ?kind, "allocated KFD memory");
        Ok(addr as *mut c_void)
    }

    fn free_memory(&self, mem: *mut c_void, size: usize) -> HsaResult<()> {
        let dev = self.core.device()?;

        let mut tables = self.tables.lock();
        let handle = tables
            .allocations
            .handle_of(mem as usize)
            .ok_or_else(|| HsaError::invalid(format!("{mem:p} was not allocated by this driver")))?;
        let Some(mapping) = tables.allocations.get(handle).copied() else {
            return Err(HsaError::Internal(format!("{mem:p} maps to a dead handle")));
        };
        if mapping.info.kind == AllocKind::Imported {
            return Err(HsaError::invalid(format!(
                "{mem:p} is an imported buffer; release its handle instead"
            )));
        }
        if size > mapping.size {
            return Err(HsaError::invalid(format!(
                "free of {size} bytes exceeds the {}-byte allocation",
                mapping.size
            )));
        }

        tables.allocations.remove_by_handle(handle);
        drop(tables);
        Self::release_allocation(dev, handle, &mapping, true);
        debug!(handle, addr = mapping.addr, "freed KFD memory");
        Ok(())
    }

    fn create_queue(&self, queue: &mut Queue) -> HsaResult<()> {
        let (dev, topology) = self.ensure_initialized()?;
        let node = Self::node(topology, queue.node_id)?;
        if !node.properties.is_gpu() {
            return Err(HsaError::invalid(format!("node {} cannot run queues", queue.node_id)));
        }
        if let Some(id) = queue.hw_ctx_handle() {
            return Err(HsaError::invalid(format!(
                "queue {} is already bound to KFD queue {id}",
                queue.id
            )));
        }
        let ring = queue
            .ring
            .ok_or_else(|| HsaError::invalid(format!("queue {} has no ring buffer", queue.id)))?;

        let mut args = CreateQueueArgs {
            ring_base_address: ring.base,
            write_pointer_address: ring.write_ptr,
            read_pointer_address: ring.read_ptr,
            ring_size: ring.size,
            gpu_id: node.properties.kfd_gpu_id,
            queue_type: KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
            queue_percentage: KFD_MAX_QUEUE_PERCENTAGE,
            queue_priority: DEFAULT_QUEUE_PRIORITY,
            ..CreateQueueArgs::default()
        };
        dev.create_queue(&mut args)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_CREATE_QUEUE"))?;

        self.tables.lock().queues.insert(args.queue_id);
        queue.set_hw_ctx_handle(Some(args.queue_id));
        queue.set_doorbell_offset(args.doorbell_offset);
        debug!(queue = queue.id, kfd_queue = args.queue_id, "created compute queue");
        Ok(())
    }

    fn destroy_queue(&self, queue: &mut Queue) -> HsaResult<()> {
        let Some(queue_id) = queue.hw_ctx_handle() else {
            return Ok(());
        };
        let dev = self.core.device()?;
        dev.destroy_queue(queue_id)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_DESTROY_QUEUE"))?;

        self.tables.lock().queues.remove(&queue_id);
        queue.set_hw_ctx_handle(None);
        queue.set_doorbell_offset(0);
        Ok(())
    }

    fn config_hw_ctx(&self, queue: &Queue, config: &HwCtxConfig) -> HsaResult<()> {
        let (dev, topology) = self.ensure_initialized()?;
        let HwCtxConfig::CuMask(indices) = config else {
            return Err(HsaError::invalid(
                "compute-unit binding applies to AIE contexts only",
            ));
        };

        let queue_id = queue
            .hw_ctx_handle()
            .ok_or_else(|| HsaError::invalid(format!("queue {} has no KFD queue", queue.id)))?;
        let num_cus = Self::node(topology, queue.node_id)?.properties.num_compute_units();
        if indices.is_empty() {
            return Err(HsaError::invalid("empty CU mask"));
        }
        if let Some(bad) = indices.iter().find(|&&cu| cu >= num_cus) {
            return Err(HsaError::invalid(format!(
                "CU {bad} out of range, node has {num_cus}"
            )));
        }

        let mask = cu_mask_words(indices, num_cus);
        dev.set_cu_mask(queue_id, &mask)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_SET_CU_MASK"))?;
        debug!(queue = queue.id, cus = indices.len(), "set CU mask");
        Ok(())
    }

    fn export_dmabuf(&self, mem: *mut c_void, size: usize) -> HsaResult<(OwnedFd, usize)> {
        let dev = self.core.device()?;
        if size == 0 {
            return Err(HsaError::invalid("zero-sized export"));
        }

        let tables = self.tables.lock();
        let Some((handle, mapping)) = tables.allocations.find_containing(mem as usize, size) else {
            return Err(HsaError::invalid(format!(
                "{size} bytes at {mem:p} are not a tracked allocation"
            )));
        };
        let offset = mem as usize - mapping.addr;
        let fd = dev
            .export_dmabuf(handle)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_EXPORT_DMABUF"))?;
        debug!(handle, offset, "exported dma-buf");
        Ok((fd, offset))
    }

    fn import_dmabuf(&self, dmabuf_fd: BorrowedFd<'_>, agent: &Agent) -> HsaResult<ShareableHandle> {
        let (dev, topology) = self.ensure_initialized()?;
        let node = Self::node(topology, agent.node_id)?;
        let gpu_id = Self::backing_gpu(topology, node)?.properties.kfd_gpu_id;

        let mut info = GetDmabufInfoArgs {
            gpu_id,
            dmabuf_fd: dmabuf_fd.as_raw_fd() as u32,
            ..GetDmabufInfoArgs::default()
        };
        dev.get_dmabuf_info(&mut info)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_GET_DMABUF_INFO"))?;
        let size = usize::try_from(info.size)
            .ok()
            .and_then(|size| align_up(size, page_size()))
            .ok_or(HsaError::OutOfMemory)?;
        if size == 0 {
            return Err(HsaError::invalid("dma-buf is empty"));
        }

        let addr = reserve_va(size)? as usize;
        let mut args = ImportDmabufArgs {
            va_addr: addr as u64,
            handle: 0,
            gpu_id,
            dmabuf_fd: dmabuf_fd.as_raw_fd() as u32,
        };
        if let Err(e) = dev.import_dmabuf(&mut args) {
            unmap_va(addr, size);
            return Err(HsaError::from_os(&e, "AMDKFD_IOC_IMPORT_DMABUF"));
        }

        let info = KfdAlloc {
            kind: AllocKind::Imported,
            gpu_id,
        };
        if let Err(e) = self.tables.lock().allocations.insert(args.handle, addr, size, info) {
            Self::release_allocation(dev, args.handle, &Mapping { addr, size, info }, false);
            return Err(e);
        }
        debug!(handle = args.handle, addr, size, gpu_id, "imported dma-buf");
        Ok(ShareableHandle::new(args.handle))
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
        if !handle.is_valid() {
            return Err(HsaError::invalid("invalid shareable handle"));
        }
        if size == 0 {
            return Err(HsaError::invalid("zero-sized mapping"));
        }
        // GPU VM mappings of imported buffers are always read/write.
        if perms != AccessPermission::ReadWrite {
            return Err(HsaError::invalid(format!(
                "{perms:?} cannot be honored by a GPU VM mapping"
            )));
        }

        let mut tables = self.tables.lock();
        let mapping = match tables.allocations.get(handle.handle) {
            Some(m) if m.info.kind == AllocKind::Imported => *m,
            _ => {
                return Err(HsaError::invalid(format!(
                    "handle {:#x} is not a live shareable handle",
                    handle.handle
                )));
            }
        };
        if tables.mapped.contains(&handle.handle) {
            return Err(HsaError::invalid(format!("handle {:#x} is already mapped", handle.handle)));
        }
        if !mem.is_null() && mem as usize != mapping.addr {
            return Err(HsaError::invalid(format!(
                "handle {:#x} lives at {:#x}, not {mem:p}",
                handle.handle, mapping.addr
            )));
        }
        if offset.checked_add(size).is_none_or(|end| end > mapping.size) {
            return Err(HsaError::invalid(format!(
                "[{offset:#x}, +{size:#x}) exceeds the {}-byte buffer",
                mapping.size
            )));
        }

        dev.map_memory_to_gpu(handle.handle, mapping.info.gpu_id)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_MAP_MEMORY_TO_GPU"))?;
        tables.mapped.insert(handle.handle);
        debug!(handle = handle.handle, addr = mapping.addr, "mapped imported buffer");
        Ok(())
    }

    fn unmap(
        &self,
        handle: ShareableHandle,
        mem: *mut c_void,
        _offset: usize,
        _size: usize,
    ) -> HsaResult<()> {
        let dev = self.core.device()?;

        let mut tables = self.tables.lock();
        if !tables.mapped.contains(&handle.handle) {
            return Err(HsaError::invalid(format!("handle {:#x} is not mapped", handle.handle)));
        }
        let Some(mapping) = tables.allocations.get(handle.handle).copied() else {
            return Err(HsaError::Internal(format!(
                "mapped handle {:#x} has no allocation",
                handle.handle
            )));
        };
        if !mem.is_null() && mem as usize != mapping.addr {
            return Err(HsaError::invalid(format!(
                "handle {:#x} lives at {:#x}, not {mem:p}",
                handle.handle, mapping.addr
            )));
        }

        dev.unmap_memory_from_gpu(handle.handle, mapping.info.gpu_id)
            .map_err(|e| HsaError::from_os(&e, "AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU"))?;
        tables.mapped.remove(&handle.handle);
        Ok(())
    }

    fn release_shareable_handle(&self, handle: &mut ShareableHandle) -> HsaResult<()> {
        let dev = self.core.device()?;
        if !handle.is_valid() {
            return Err(HsaError::invalid("invalid shareable handle"));
        }

        let mut tables = self.tables.lock();
        if tables.mapped.contains(&handle.handle) {
            return Err(HsaError::invalid(format!(
                "handle {:#x} is still mapped",
                handle.handle
            )));
        }
        match tables.allocations.get(handle.handle) {
            Some(m) if m.info.kind == AllocKind::Imported => {}
            _ => {
                return Err(HsaError::invalid(format!(
                    "handle {:#x} is not a live shareable handle",
                    handle.handle
                )));
            }
        }
        let Some(mapping) = tables.allocations.remove_by_handle(handle.handle) else {
            return Err(HsaError::Internal("imported handle vanished".into()));
        };
        drop(tables);

        Self::release_allocation(dev, handle.handle, &mapping, false);
        debug!(handle = handle.handle, "released shareable handle");
        handle.handle = 0;
        Ok(())
    }
}

impl<D: KfdIoctl> Drop for KfdDriver<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close KFD driver");
        }
    }
}
