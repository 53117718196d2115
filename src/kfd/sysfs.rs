#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::fs;
use std::io;
use std::path::Path;

// Heap types reported in `mem_banks/N/properties`.
pub const HSA_HEAPTYPE_SYSTEM: u32 = 0;
pub const HSA_HEAPTYPE_FRAME_BUFFER_PUBLIC: u32 = 1;
pub const HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE: u32 = 2;

// ===============================================================================================
// Data Structures
// ===============================================================================================

#[derive(Debug, Clone, Default)]
pub struct SystemProperties {
    pub platform_oem: u32,
    pub platform_id: u32,
    pub platform_rev: u32,
    pub num_nodes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NodeProperties {
    pub node_id: u32,

    pub cpu_cores_count: u32,
    pub simd_count: u32,
    pub mem_banks_count: u32,

    pub vendor_id: u32,
    pub device_id: u32,
    pub location_id: u32,
    pub domain: u32,
    pub drm_render_minor: i32,
    pub kfd_gpu_id: u32,

    pub local_mem_size: u64,
    pub array_count: u32,
    pub simd_arrays_per_engine: u32,
    pub cu_per_simd_array: u32,
    pub simd_per_cu: u32,
    pub gfx_target_version: u32,
    pub num_xcc: u32,
    pub wave_front_size: u32,

    pub marketing_name: String,
}

impl NodeProperties {
    /// A node with SIMDs and a KFD gpu id; CPU-only nodes have neither.
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.simd_count > 0 && self.kfd_gpu_id != 0
    }

    /// Compute units on a GPU node.
    #[must_use]
    pub const fn num_compute_units(&self) -> u32 {
        if self.simd_per_cu == 0 {
            0
        } else {
            self.simd_count / self.simd_per_cu
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBank {
    pub heap_type: u32,
    pub size_in_bytes: u64,
    pub flags: u32,
    pub width: u32,
    pub mem_clk_max: u32,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub system_props: SystemProperties,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub properties: NodeProperties,
    pub mem_banks: Vec<MemoryBank>,
}

// ===============================================================================================
// Topology Implementation
// ===============================================================================================

impl Topology {
    /// Reads the topology rooted at `root` (normally `/sys/devices/virtual/kfd/kfd/topology`).
    ///
    /// # Errors
    /// `NotFound` if `root` does not exist; any error reading `system_properties`.
    pub fn snapshot(root: &Path) -> io::Result<Self> {
        if !root.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("KFD topology not found at {}", root.display()),
            ));
        }

        let mut system_props = Self::parse_system_properties(&root.join("system_properties"))?;

        let mut nodes = Vec::new();
        for (idx, path) in numbered_children(&root.join("nodes")).iter().enumerate() {
            if let Ok(mut node) = Node::from_sysfs(path) {
                node.properties.node_id = idx as u32;
                nodes.push(node);
            }
        }

        system_props.num_nodes = nodes.len() as u32;

        Ok(Self {
            system_props,
            nodes,
        })
    }

    #[must_use]
    pub fn node(&self, node_id: u32) -> Option<&Node> {
        self.nodes.get(node_id as usize)
    }

    pub fn gpu_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.properties.is_gpu())
    }

    pub fn parse_system_properties(path: &Path) -> io::Result<SystemProperties> {
        let content = fs::read_to_string(path)?;
        let mut p = SystemProperties::default();

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                match k {
                    "platform_oem" => p.platform_oem = v.parse::<u32>().unwrap_or(0),
                    "platform_id" => p.platform_id = v.parse::<u32>().unwrap_or(0),
                    "platform_rev" => p.platform_rev = v.parse::<u32>().unwrap_or(0),
                    _ => {}
                }
            }
        }

        Ok(p)
    }
}

// ===============================================================================================
// Node Parsing (Sysfs Traversal)
// ===============================================================================================

impl Node {
    fn from_sysfs(path: &Path) -> io::Result<Self> {
        let mut properties = Self::parse_node_properties(&path.join("properties"))?;

        if properties.kfd_gpu_id == 0
            && let Ok(txt) = fs::read_to_string(path.join("gpu_id"))
            && let Ok(val) = txt.trim().parse::<u32>()
        {
            properties.kfd_gpu_id = val;
        }

        let mem_banks = numbered_children(&path.join("mem_banks"))
            .iter()
            .filter_map(|p| Self::parse_memory_bank(p).ok())
            .collect();

        Ok(Self {
            properties,
            mem_banks,
        })
    }

    /// Total size of the node's banks of `heap_type`.
    #[must_use]
    pub fn bank_size(&self, heap_type: u32) -> Option<u64> {
        let mut banks = self.mem_banks.iter().filter(|b| b.heap_type == heap_type).peekable();
        banks.peek()?;
        Some(banks.map(|b| b.size_in_bytes).sum())
    }

    fn parse_node_properties(path: &Path) -> io::Result<NodeProperties> {
        let content = fs::read_to_string(path)?;
        let mut p = NodeProperties::default();

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let key = parts.next();
            let val_str = parts.next();

            if let (Some(k), Some(v)) = (key, val_str) {
                if let Ok(val) = v.parse::<u64>() {
                    match k {
                        "cpu_cores_count" => p.cpu_cores_count = val as u32,
                        "simd_count" => p.simd_count = val as u32,
                        "mem_banks_count" => p.mem_banks_count = val as u32,
                        "vendor_id" => p.vendor_id = val as u32,
                        "device_id" => p.device_id = val as u32,
                        "location_id" => p.location_id = val as u32,
                        "domain" => p.domain = val as u32,
                        "drm_render_minor" => p.drm_render_minor = val as i32,
                        "local_mem_size" => p.local_mem_size = val,
                        "array_count" => p.array_count = val as u32,
                        "simd_arrays_per_engine" => p.simd_arrays_per_engine = val as u32,
                        "cu_per_simd_array" => p.cu_per_simd_array = val as u32,
                        "simd_per_cu" => p.simd_per_cu = val as u32,
                        "gfx_target_version" => p.gfx_target_version = val as u32,
                        "num_xcc" => p.num_xcc = val as u32,
                        "wave_front_size" => p.wave_front_size = val as u32,
                        _ => {}
                    }
                }
                if k == "name" {
                    p.marketing_name = v.to_string();
                }
            }
        }
        Ok(p)
    }

    fn parse_memory_bank(path: &Path) -> io::Result<MemoryBank> {
        let content = fs::read_to_string(path.join("properties"))?;
        let mut p = MemoryBank::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(k), Some(v)) = (parts.next(), parts.next())
                && let Ok(val) = v.parse::<u64>()
            {
                match k {
                    "heap_type" => p.heap_type = val as u32,
                    "size_in_bytes" => p.size_in_bytes = val,
                    "flags" => p.flags = val as u32,
                    "width" => p.width = val as u32,
                    "mem_clk_max" => p.mem_clk_max = val as u32,
                    _ => {}
                }
            }
        }
        Ok(p)
    }
}

/// Subdirectories of `dir` named by a number, in numeric order.
fn numbered_children(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<(u32, _)> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|e| {
            let idx = e.file_name().to_str()?.parse::<u32>().ok()?;
            Some((idx, e.path()))
        })
        .filter(|(_, p)| p.is_dir())
        .collect();
    paths.sort_by_key(|(idx, _)| *idx);
    paths.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hsa-kmd-sysfs-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fake_topology(tag: &str) -> PathBuf {
        let root = scratch_dir(tag);
        write(&root.join("system_properties"), "platform_oem 1\nplatform_id 2\n");

        write(
            &root.join("nodes/0/properties"),
            "cpu_cores_count 16\nsimd_count 0\nmem_banks_count 1\n",
        );
        write(
            &root.join("nodes/0/mem_banks/0/properties"),
            "heap_type 0\nsize_in_bytes 34359738368\n",
        );

        write(
            &root.join("nodes/1/properties"),
            "cpu_cores_count 0\nsimd_count 240\nsimd_per_cu 4\ndrm_render_minor 128\n\
             gfx_target_version 110000\nmem_banks_count 2\n",
        );
        write(&root.join("nodes/1/gpu_id"), "4660\n");
        write(
            &root.join("nodes/1/mem_banks/0/properties"),
            "heap_type 1\nsize_in_bytes 268435456\n",
        );
        write(
            &root.join("nodes/1/mem_banks/1/properties"),
            "heap_type 2\nsize_in_bytes 16911433728\n",
        );
        root
    }

    #[test]
    fn parses_nodes_and_banks() {
        let root = fake_topology("parse");
        let topo = Topology::snapshot(&root).unwrap();

        assert_eq!(topo.system_props.num_nodes, 2);
        assert_eq!(topo.system_props.platform_id, 2);

        let cpu = topo.node(0).unwrap();
        assert!(!cpu.properties.is_gpu());
        assert_eq!(cpu.bank_size(HSA_HEAPTYPE_SYSTEM), Some(34_359_738_368));

        let gpu = topo.node(1).unwrap();
        assert!(gpu.properties.is_gpu());
        assert_eq!(gpu.properties.kfd_gpu_id, 4660);
        assert_eq!(gpu.properties.num_compute_units(), 60);
        assert_eq!(gpu.properties.drm_render_minor, 128);
        assert_eq!(gpu.bank_size(HSA_HEAPTYPE_FRAME_BUFFER_PRIVATE), Some(16_911_433_728));
        assert_eq!(gpu.bank_size(HSA_HEAPTYPE_SYSTEM), None);
        assert_eq!(topo.gpu_nodes().count(), 1);
        assert!(topo.node(2).is_none());

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn missing_root_is_not_found() {
        let err = Topology::snapshot(Path::new("/nonexistent/hsa-kmd/topology")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
