use std::env;
use std::path::PathBuf;
use tracing::warn;

const DEFAULT_ACCEL_DEV_DIR: &str = "/dev/accel";
const DEFAULT_KFD_DEVNODE: &str = "/dev/kfd";
const DEFAULT_KFD_TOPOLOGY_ROOT: &str = "/sys/devices/virtual/kfd/kfd/topology";
const DEFAULT_DRI_DEV_DIR: &str = "/dev/dri";

/// Where the kernel drivers live on this host.
///
/// `Default` describes a stock Linux install; every field can be overridden
/// from the environment so tests and containers can point elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Directory scanned for `accel*` nodes during XDNA discovery.
    pub accel_dev_dir: PathBuf,
    pub kfd_devnode: PathBuf,
    /// Root of the KFD sysfs topology (contains `nodes/` and `system_properties`).
    pub kfd_topology_root: PathBuf,
    /// Directory holding `renderD*` nodes used to acquire GPU VMs.
    pub dri_dev_dir: PathBuf,
    /// Node id the accelerator agent answers to.
    pub xdna_node_id: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            accel_dev_dir: PathBuf::from(DEFAULT_ACCEL_DEV_DIR),
            kfd_devnode: PathBuf::from(DEFAULT_KFD_DEVNODE),
            kfd_topology_root: PathBuf::from(DEFAULT_KFD_TOPOLOGY_ROOT),
            dri_dev_dir: PathBuf::from(DEFAULT_DRI_DEV_DIR),
            xdna_node_id: 0,
        }
    }
}

impl DriverConfig {
    /// Builds the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("HSA_ACCEL_DEV_DIR") {
            cfg.accel_dev_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HSA_KFD_DEVNODE") {
            cfg.kfd_devnode = PathBuf::from(v);
        }
        if let Some(v) = lookup("HSA_KFD_TOPOLOGY_ROOT") {
            cfg.kfd_topology_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("HSA_DRI_DEV_DIR") {
            cfg.dri_dev_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HSA_XDNA_NODE_ID") {
            match v.trim().parse::<u32>() {
                Ok(id) => cfg.xdna_node_id = id,
                Err(_) => warn!("ignoring malformed HSA_XDNA_NODE_ID={v:?}"),
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    #[test]
    fn defaults_when_unset() {
        let cfg = DriverConfig::from_lookup(|_| None);
        assert_eq!(cfg, DriverConfig::default());
        assert_eq!(cfg.kfd_devnode, Path::new("/dev/kfd"));
    }

    #[test]
    fn overrides_apply_and_bad_numbers_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("HSA_ACCEL_DEV_DIR", "/tmp/accel"),
            ("HSA_KFD_TOPOLOGY_ROOT", "/tmp/topology"),
            ("HSA_XDNA_NODE_ID", "three"),
        ]
        .into_iter()
        .collect();
        let cfg = DriverConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(cfg.accel_dev_dir, Path::new("/tmp/accel"));
        assert_eq!(cfg.kfd_topology_root, Path::new("/tmp/topology"));
        assert_eq!(cfg.xdna_node_id, 0);

        let cfg = DriverConfig::from_lookup(|k| (k == "HSA_XDNA_NODE_ID").then(|| "2".into()));
        assert_eq!(cfg.xdna_node_id, 2);
    }
}
