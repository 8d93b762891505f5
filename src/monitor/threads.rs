//! Discovery of VMM threads through procfs.
//!
//! Threads are classified by their kernel comm name: `vcpu<N>` threads run
//! guest CPUs, `virtio*` threads serve devices and everything else is an
//! emulator helper.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Default procfs mount.
pub const PROC_ROOT: &str = "/proc";

/// Kernel limit on comm names, including the trailing NUL.
const COMM_LEN: usize = 16;

/// What a thread does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadKind {
    /// Runs guest vcpu `cpu_id`.
    Vcpu {
        /// Guest CPU index.
        cpu_id: usize,
        /// Whether the vcpu is online.
        online: bool,
    },
    /// virtio device worker.
    Io {
        /// Thread name.
        name: String,
    },
    /// Any other VMM thread.
    Emulator {
        /// Thread name.
        name: String,
    },
    /// comm could not be read.
    Unknown,
}

/// One VMM thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Kernel thread id.
    pub tid: i32,
    /// Classification.
    pub kind: ThreadKind,
}

impl ThreadInfo {
    /// Guest CPU index for vcpu threads.
    pub fn vcpu_id(&self) -> Option<usize> {
        match self.kind {
            ThreadKind::Vcpu { cpu_id, .. } => Some(cpu_id),
            _ => None,
        }
    }
}

/// Classify a thread by its comm name.
pub fn classify(comm: &str) -> ThreadKind {
    let comm = truncate_comm(comm.trim_end_matches('\n'));
    if let Some(id) = comm.strip_prefix("vcpu").and_then(|n| n.parse::<usize>().ok()) {
        ThreadKind::Vcpu {
            cpu_id: id,
            online: true,
        }
    } else if comm.starts_with("virtio") {
        ThreadKind::Io {
            name: comm.to_string(),
        }
    } else {
        ThreadKind::Emulator {
            name: comm.to_string(),
        }
    }
}

fn truncate_comm(comm: &str) -> &str {
    if comm.len() < COMM_LEN {
        return comm;
    }
    let mut end = COMM_LEN - 1;
    while !comm.is_char_boundary(end) {
        end -= 1;
    }
    &comm[..end]
}

/// Reads thread lists of a process.
#[derive(Debug, Clone)]
pub struct ThreadScanner {
    proc_root: PathBuf,
}

impl Default for ThreadScanner {
    fn default() -> Self {
        Self::new(PROC_ROOT)
    }
}

impl ThreadScanner {
    /// Scanner rooted at `proc_root`.
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// procfs root in use.
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Sorted thread ids of `pid`.
    pub fn tids(&self, pid: i32) -> Result<Vec<i32>> {
        let task_dir = self.proc_root.join(pid.to_string()).join("task");
        let entries = std::fs::read_dir(&task_dir).map_err(|e| {
            Error::internal(format!(
                "unable to list threads in {}: {}",
                task_dir.display(),
                e
            ))
        })?;

        let mut tids: Vec<i32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        tids.sort_unstable();
        Ok(tids)
    }

    /// Classified threads of `pid`, sorted by tid.
    pub fn scan(&self, pid: i32) -> Result<Vec<ThreadInfo>> {
        let task_dir = self.proc_root.join(pid.to_string()).join("task");
        let threads = self
            .tids(pid)?
            .into_iter()
            .map(|tid| {
                let comm = task_dir.join(tid.to_string()).join("comm");
                let kind = match std::fs::read_to_string(&comm) {
                    Ok(name) => classify(&name),
                    Err(e) => {
                        tracing::debug!(tid, error = %e, "cannot read thread name");
                        ThreadKind::Unknown
                    }
                };
                ThreadInfo { tid, kind }
            })
            .collect();
        Ok(threads)
    }
}

/// Snapshots are equal when they list the same tids in the same order.
pub fn same_tids(a: &[ThreadInfo], b: &[ThreadInfo]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.tid == y.tid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Populate `<root>/<pid>/task/<tid>/comm`.
    pub(crate) fn fake_proc(root: &Path, pid: i32, threads: &[(i32, &str)]) {
        let task = root.join(pid.to_string()).join("task");
        let _ = std::fs::remove_dir_all(&task);
        for (tid, comm) in threads {
            let dir = task.join(tid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("vcpu3\n"),
            ThreadKind::Vcpu {
                cpu_id: 3,
                online: true
            }
        );
        assert_eq!(
            classify("virtio-blk"),
            ThreadKind::Io {
                name: "virtio-blk".into()
            }
        );
        assert_eq!(
            classify("cloud-hyperviso"),
            ThreadKind::Emulator {
                name: "cloud-hyperviso".into()
            }
        );
        assert!(matches!(classify("vcpux"), ThreadKind::Emulator { .. }));
    }

    #[test]
    fn test_comm_truncated_to_kernel_limit() {
        let long = "virtio-net-worker-extra";
        match classify(long) {
            ThreadKind::Io { name } => assert_eq!(name.len(), 15),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scan_sorted_and_classified() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(
            dir.path(),
            100,
            &[(112, "vcpu1"), (100, "cloud-hyperviso"), (111, "vcpu0"), (120, "virtio-net")],
        );
        let scanner = ThreadScanner::new(dir.path());
        let threads = scanner.scan(100).unwrap();

        let tids: Vec<i32> = threads.iter().map(|t| t.tid).collect();
        assert_eq!(tids, vec![100, 111, 112, 120]);
        assert_eq!(threads[1].vcpu_id(), Some(0));
        assert_eq!(threads[2].vcpu_id(), Some(1));
        assert!(matches!(threads[3].kind, ThreadKind::Io { .. }));
    }

    #[test]
    fn test_unreadable_comm_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("5/task/6")).unwrap();
        let threads = ThreadScanner::new(dir.path()).scan(5).unwrap();
        assert_eq!(threads[0].kind, ThreadKind::Unknown);
    }

    #[test]
    fn test_missing_process_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ThreadScanner::new(dir.path()).scan(999).is_err());
    }

    #[test]
    fn test_same_tids() {
        let a = vec![ThreadInfo { tid: 1, kind: ThreadKind::Unknown }];
        let b = vec![ThreadInfo {
            tid: 1,
            kind: classify("vcpu0"),
        }];
        let c = vec![ThreadInfo { tid: 2, kind: ThreadKind::Unknown }];
        assert!(same_tids(&a, &b));
        assert!(!same_tids(&a, &c));
        assert!(!same_tids(&a, &[]));
    }
}
