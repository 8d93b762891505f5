//! Host CPU and NUMA topology read from sysfs.

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Default sysfs mount.
pub const SYSFS_ROOT: &str = "/sys";

/// Read-only view of the host topology.
#[derive(Debug, Clone)]
pub struct HostTopology {
    sysfs: PathBuf,
}

/// Summary returned by node info queries.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Number of online CPUs.
    pub cpus: usize,
    /// Number of NUMA nodes.
    pub nodes: usize,
    /// Total memory in KiB.
    pub memory_kib: u64,
}

impl Default for HostTopology {
    fn default() -> Self {
        Self::new(SYSFS_ROOT)
    }
}

impl HostTopology {
    /// Create a view rooted at `sysfs` (tests point this at a temp tree).
    pub fn new(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
        }
    }

    /// The sysfs root in use.
    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs
    }

    /// Online host CPUs.
    pub fn online_cpus(&self) -> Result<Bitmap> {
        let path = self.sysfs.join("devices/system/cpu/online");
        read_list(&path)
    }

    /// True when the host exposes NUMA nodes.
    pub fn numa_available(&self) -> bool {
        self.sysfs.join("devices/system/node/online").exists()
    }

    /// Online NUMA nodes; a single node 0 on non-NUMA hosts.
    pub fn numa_nodes(&self) -> Result<Bitmap> {
        let path = self.sysfs.join("devices/system/node/online");
        if !path.exists() {
            return Ok(Bitmap::with_range(1));
        }
        read_list(&path)
    }

    /// CPUs belonging to a NUMA node.
    pub fn node_cpus(&self, node: usize) -> Result<Bitmap> {
        let path = self
            .sysfs
            .join(format!("devices/system/node/node{}/cpulist", node));
        if !path.exists() && node == 0 && !self.numa_available() {
            return self.online_cpus();
        }
        read_list(&path)
    }

    /// Convert a nodeset into the union of its CPUs.
    pub fn nodeset_to_cpuset(&self, nodes: &Bitmap) -> Result<Bitmap> {
        let mut cpus = Bitmap::new();
        for node in nodes.iter() {
            cpus = cpus.union(&self.node_cpus(node)?);
        }
        Ok(cpus)
    }

    /// Basic node information.
    pub fn node_info(&self, meminfo: &Path) -> Result<NodeInfo> {
        let memory_kib = std::fs::read_to_string(meminfo)?
            .lines()
            .find_map(|line| {
                line.strip_prefix("MemTotal:")
                    .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
            })
            .unwrap_or(0);

        Ok(NodeInfo {
            cpus: self.online_cpus()?.count(),
            nodes: self.numa_nodes()?.count(),
            memory_kib,
        })
    }
}

fn read_list(path: &Path) -> Result<Bitmap> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::internal(format!("cannot read {}: {}", path.display(), e)))?;
    Bitmap::parse(&raw)
}
