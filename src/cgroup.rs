//! cgroup v2 handling for domains and their threads.
//!
//! Each active domain gets a machine cgroup under its resource partition.
//! Threads of the VMM are moved into threaded children named `emulator`,
//! `vcpu<N>` and `iothread<N>`.
//!
//! Knobs of the legacy hierarchy are mapped onto the unified one:
//! cpu shares become `cpu.weight`, period/quota become `cpu.max`, the blkio
//! weight becomes `io.weight`.

use crate::bitmap::Bitmap;
use crate::domain::def::DomainDef;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Attempts made when the kernel reports a group busy on removal.
pub const REMOVE_ATTEMPTS: usize = 5;

/// Delay between removal attempts.
pub const REMOVE_DELAY: Duration = Duration::from_millis(200);

/// Controllers the driver knows how to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// CPU bandwidth and weight.
    Cpu,
    /// CPU and memory node placement.
    Cpuset,
    /// Memory limits.
    Memory,
    /// Block I/O weight.
    Io,
    /// Process count.
    Pids,
}

impl Controller {
    /// All known controllers.
    pub const ALL: [Controller; 5] = [
        Controller::Cpu,
        Controller::Cpuset,
        Controller::Memory,
        Controller::Io,
        Controller::Pids,
    ];

    /// Controller name as written in `cgroup.controllers`.
    pub fn name(&self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Cpuset => "cpuset",
            Controller::Memory => "memory",
            Controller::Io => "io",
            Controller::Pids => "pids",
        }
    }

    /// Parse a controller name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Whether the controller works in threaded subtrees.
    pub fn is_threaded(&self) -> bool {
        matches!(self, Controller::Cpu | Controller::Cpuset | Controller::Pids)
    }
}

/// How machine groups are anchored on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStrategy {
    /// systemd slices and scopes: `/machine.slice/machine-<name>.scope`.
    Systemd,
    /// Plain directories: `/machine/<name>.libvirt-ch`.
    Direct,
}

impl RootStrategy {
    /// Detect from the name of pid 1.
    pub fn detect(proc_root: &Path) -> Self {
        match std::fs::read_to_string(proc_root.join("1/comm")) {
            Ok(comm) if comm.trim() == "systemd" => RootStrategy::Systemd,
            _ => RootStrategy::Direct,
        }
    }
}

/// Kinds of per-thread child groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadGroup {
    /// Emulator threads.
    Emulator,
    /// One vcpu thread.
    Vcpu(usize),
    /// One I/O thread, keyed by its tid.
    Iothread(usize),
}

impl ThreadGroup {
    /// Directory name of the child group.
    pub fn dir_name(&self) -> String {
        match self {
            ThreadGroup::Emulator => "emulator".to_string(),
            ThreadGroup::Vcpu(n) => format!("vcpu{}", n),
            ThreadGroup::Iothread(n) => format!("iothread{}", n),
        }
    }
}

/// Keep only characters valid in a cgroup or unit name.
pub fn sanitize_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let out = out.trim_matches('-');
    if out.is_empty() {
        "default".to_string()
    } else {
        out.to_string()
    }
}

/// Read the unified-hierarchy path of a process from `/proc/<pid>/cgroup`.
pub fn pid_cgroup_path(proc_root: &Path, pid: i32) -> Option<String> {
    let raw = std::fs::read_to_string(proc_root.join(pid.to_string()).join("cgroup")).ok()?;
    raw.lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|p| p.trim().to_string())
}

/// Convert legacy cpu shares to a unified `cpu.weight`.
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

/// Run `op`, retrying while it fails with EBUSY.
///
/// Returns `Ok(false)` when every attempt saw EBUSY.
pub fn retry_busy<F>(attempts: usize, delay: Duration, mut op: F) -> std::io::Result<bool>
where
    F: FnMut() -> std::io::Result<()>,
{
    for attempt in 1..=attempts {
        match op() {
            Ok(()) => return Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                tracing::debug!(attempt, "cgroup busy, retrying");
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// The cgroup filesystem and its usable controllers.
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    mount: PathBuf,
    strategy: RootStrategy,
    controllers: Vec<Controller>,
}

impl CgroupRoot {
    /// Inspect the hierarchy mounted at `mount`.
    ///
    /// `configured` restricts the controllers; empty means every controller
    /// the root offers.
    pub fn new(mount: impl Into<PathBuf>, configured: &[String], proc_root: &Path) -> Self {
        let mount = mount.into();
        let offered: Vec<Controller> = std::fs::read_to_string(mount.join("cgroup.controllers"))
            .map(|raw| raw.split_whitespace().filter_map(Controller::from_name).collect())
            .unwrap_or_default();

        let controllers = if configured.is_empty() {
            offered
        } else {
            offered
                .into_iter()
                .filter(|c| configured.iter().any(|name| name == c.name()))
                .collect()
        };

        tracing::debug!(
            mount = %mount.display(),
            controllers = ?controllers,
            "cgroup hierarchy"
        );

        Self {
            mount,
            strategy: RootStrategy::detect(proc_root),
            controllers,
        }
    }

    /// Whether any usable controller exists.
    pub fn is_available(&self) -> bool {
        !self.controllers.is_empty()
    }

    /// Anchoring strategy.
    pub fn strategy(&self) -> RootStrategy {
        self.strategy
    }

    /// Path of a machine group relative to the mount.
    pub fn machine_path(&self, partition: &str, machine_name: &str) -> String {
        let leaf = sanitize_component(machine_name);
        match self.strategy {
            RootStrategy::Systemd => {
                let slice: Vec<String> = partition
                    .split('/')
                    .filter(|c| !c.is_empty())
                    .map(|c| format!("{}.slice", sanitize_component(c)))
                    .collect();
                format!("/{}/machine-{}.scope", slice.join("/"), leaf)
            }
            RootStrategy::Direct => {
                format!("{}/{}.libvirt-ch", partition.trim_end_matches('/'), leaf)
            }
        }
    }

    /// Create the machine group for a new run.
    pub fn create_machine(&self, partition: &str, machine_name: &str) -> Result<Cgroup> {
        if !partition.starts_with('/') {
            return Err(Error::config_unsupported(format!(
                "resource partition '{}' must start with '/'",
                partition
            )));
        }
        let group = self.group(self.machine_path(partition, machine_name));
        group.enable_on_ancestors()?;
        std::fs::create_dir_all(group.dir()).map_err(|e| {
            Error::cgroup(format!("failed to create {}: {}", group.dir().display(), e))
        })?;
        tracing::info!(path = %group.path, "created machine cgroup");
        Ok(group)
    }

    /// Attach to the existing group a VMM already lives in.
    pub fn attach(&self, proc_root: &Path, pid: i32) -> Result<Cgroup> {
        let path = pid_cgroup_path(proc_root, pid)
            .ok_or_else(|| Error::cgroup(format!("no unified cgroup for pid {}", pid)))?;
        let group = self.group(path);
        if !group.dir().is_dir() {
            return Err(Error::cgroup(format!(
                "cgroup {} of pid {} does not exist",
                group.path, pid
            )));
        }
        Ok(group)
    }

    fn group(&self, path: String) -> Cgroup {
        Cgroup {
            mount: self.mount.clone(),
            path,
            controllers: self.controllers.clone(),
            threaded: false,
        }
    }
}

/// One cgroup directory.
#[derive(Debug, Clone)]
pub struct Cgroup {
    mount: PathBuf,
    path: String,
    controllers: Vec<Controller>,
    threaded: bool,
}

impl Cgroup {
    /// Path relative to the mount, e.g. `/machine/ch-1-vm1.libvirt-ch`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Absolute directory.
    pub fn dir(&self) -> PathBuf {
        self.mount.join(self.path.trim_start_matches('/'))
    }

    /// Whether a controller is usable in this group.
    pub fn has_controller(&self, controller: Controller) -> bool {
        self.controllers.contains(&controller)
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let path = self.dir().join(file);
        tracing::trace!(path = %path.display(), value, "cgroup write");
        std::fs::write(&path, value)
            .map_err(|e| Error::cgroup(format!("failed to write {}: {}", path.display(), e)))
    }

    fn read(&self, file: &str) -> Result<String> {
        let path = self.dir().join(file);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::cgroup(format!("failed to read {}: {}", path.display(), e)))
    }

    /// Enable our controllers in `cgroup.subtree_control` from the mount
    /// down to (excluding) this group. Best effort.
    fn enable_on_ancestors(&self) -> Result<()> {
        let control: Vec<String> = self
            .controllers
            .iter()
            .map(|c| format!("+{}", c.name()))
            .collect();
        if control.is_empty() {
            return Ok(());
        }
        let control = control.join(" ");

        let mut dir = self.mount.clone();
        for component in self.path.split('/').filter(|c| !c.is_empty()) {
            if let Err(e) = std::fs::write(dir.join("cgroup.subtree_control"), &control) {
                tracing::debug!(dir = %dir.display(), error = %e, "subtree_control not updated");
            }
            dir.push(component);
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::cgroup(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Move a whole process.
    pub fn add_task(&self, pid: i32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    /// Move a single thread.
    pub fn add_thread(&self, tid: i32) -> Result<()> {
        if self.threaded {
            self.write("cgroup.threads", &tid.to_string())
        } else {
            self.add_task(tid)
        }
    }

    /// Create (or reopen) a threaded child group.
    pub fn thread_group(&self, kind: ThreadGroup) -> Result<Cgroup> {
        let child = Cgroup {
            mount: self.mount.clone(),
            path: format!("{}/{}", self.path.trim_end_matches('/'), kind.dir_name()),
            controllers: self
                .controllers
                .iter()
                .copied()
                .filter(Controller::is_threaded)
                .collect(),
            threaded: true,
        };

        let threaded: Vec<String> = child
            .controllers
            .iter()
            .map(|c| format!("+{}", c.name()))
            .collect();
        if !threaded.is_empty() {
            if let Err(e) = self.write("cgroup.subtree_control", &threaded.join(" ")) {
                tracing::debug!(error = %e, "subtree_control not updated");
            }
        }

        std::fs::create_dir_all(child.dir()).map_err(|e| {
            Error::cgroup(format!("failed to create {}: {}", child.dir().display(), e))
        })?;
        if let Err(e) = child.write("cgroup.type", "threaded") {
            tracing::debug!(error = %e, "cgroup.type not updated");
        }
        Ok(child)
    }

    /// Set `cpuset.cpus`.
    pub fn set_cpuset_cpus(&self, cpus: &Bitmap) -> Result<()> {
        self.write("cpuset.cpus", &cpus.format())
    }

    /// Set `cpuset.mems`.
    pub fn set_cpuset_mems(&self, mems: &str) -> Result<()> {
        self.write("cpuset.mems", mems)
    }

    /// Read `cpuset.mems`.
    pub fn cpuset_mems(&self) -> Result<String> {
        self.read("cpuset.mems")
    }

    /// Set `cpu.weight` from legacy shares.
    pub fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        self.write("cpu.weight", &shares_to_weight(shares).to_string())
    }

    /// Set bandwidth in `cpu.max`; a missing half keeps its current value.
    ///
    /// A negative quota means unlimited.
    pub fn set_cpu_bandwidth(&self, period: Option<u64>, quota: Option<i64>) -> Result<()> {
        if period.is_none() && quota.is_none() {
            return Ok(());
        }
        let current = self.read("cpu.max").unwrap_or_else(|_| "max 100000".to_string());
        let mut parts = current.split_whitespace();
        let cur_quota = parts.next().unwrap_or("max").to_string();
        let cur_period = parts.next().unwrap_or("100000").to_string();

        let quota = match quota {
            Some(q) if q > 0 => q.to_string(),
            Some(_) => "max".to_string(),
            None => cur_quota,
        };
        let period = period.map(|p| p.to_string()).unwrap_or(cur_period);
        self.write("cpu.max", &format!("{} {}", quota, period))
    }

    /// Set `io.weight`.
    pub fn set_io_weight(&self, weight: u32) -> Result<()> {
        self.write("io.weight", &format!("default {}", weight))
    }

    /// Set `memory.max` (KiB).
    pub fn set_memory_hard_limit(&self, kib: u64) -> Result<()> {
        self.write("memory.max", &(kib * 1024).to_string())
    }

    /// Set `memory.high` (KiB).
    pub fn set_memory_soft_limit(&self, kib: u64) -> Result<()> {
        self.write("memory.high", &(kib * 1024).to_string())
    }

    /// Set `memory.swap.max` (KiB).
    pub fn set_memory_swap_limit(&self, kib: u64) -> Result<()> {
        self.write("memory.swap.max", &(kib * 1024).to_string())
    }

    /// Apply the domain-wide tuning of a definition.
    pub fn apply_domain_tuning(&self, def: &DomainDef) -> Result<()> {
        if let Some(weight) = def.blkio.weight {
            if !self.has_controller(Controller::Io) {
                return Err(Error::config_unsupported(
                    "block I/O tuning is not available on this host",
                ));
            }
            self.set_io_weight(weight)?;
        }

        if def.memtune.is_set() {
            if !self.has_controller(Controller::Memory) {
                return Err(Error::config_unsupported(
                    "memory cgroup is not available on this host",
                ));
            }
            let hard = def.memtune.hard_limit_kib;
            if let Some(kib) = hard {
                self.set_memory_hard_limit(kib)?;
            }
            if let Some(kib) = def.memtune.soft_limit_kib {
                self.set_memory_soft_limit(kib)?;
            }
            if let Some(kib) = def.memtune.swap_hard_limit_kib {
                // unified swap limit excludes memory
                self.set_memory_swap_limit(kib.saturating_sub(hard.unwrap_or(0)))?;
            }
        }

        if let Some(shares) = def.cputune.shares {
            if !self.has_controller(Controller::Cpu) {
                return Err(Error::config_unsupported(
                    "CPU tuning is not available on this host",
                ));
            }
            self.set_cpu_shares(shares)?;
        }

        Ok(())
    }

    /// Child group directories.
    pub fn children(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn child(&self, name: &str) -> Cgroup {
        Cgroup {
            mount: self.mount.clone(),
            path: format!("{}/{}", self.path.trim_end_matches('/'), name),
            controllers: self.controllers.clone(),
            threaded: true,
        }
    }

    /// Reset the group to all host nodes and re-apply each thread group's
    /// own nodes.
    pub fn restore_mems(&self, all_nodes: &Bitmap) -> Result<()> {
        if !self.has_controller(Controller::Cpuset) {
            return Ok(());
        }
        self.set_cpuset_mems(&all_nodes.format())?;
        for name in self.children() {
            let child = self.child(&name);
            let mems = child.cpuset_mems()?;
            child.set_cpuset_mems(&mems)?;
        }
        Ok(())
    }

    /// Remove the group and its children.
    ///
    /// EBUSY is retried; a group that stays busy is left behind with a
    /// warning.
    pub fn remove(&self) -> Result<()> {
        for name in self.children() {
            self.child(&name).remove()?;
        }
        let dir = self.dir();
        let removed = retry_busy(REMOVE_ATTEMPTS, REMOVE_DELAY, || {
            match std::fs::remove_dir(&dir) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .map_err(|e| Error::cgroup(format!("failed to remove {}: {}", dir.display(), e)))?;

        if removed {
            tracing::debug!(path = %self.path, "removed cgroup");
        } else {
            tracing::warn!(path = %self.path, "cgroup still busy, leaving it behind");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    pub(crate) fn fake_root(dir: &Path, controllers: &str) -> CgroupRoot {
        let mount = dir.join("cgroup");
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::write(mount.join("cgroup.controllers"), controllers).unwrap();
        CgroupRoot::new(mount, &[], &dir.join("proc"))
    }

    #[test]
    fn test_shares_to_weight() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(0), 1);
    }

    #[test]
    fn test_controller_detection_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpuset cpu io memory hugetlb pids\n");
        assert!(root.is_available());

        let filtered = CgroupRoot::new(
            dir.path().join("cgroup"),
            &["cpu".to_string(), "memory".to_string()],
            &dir.path().join("proc"),
        );
        let group = filtered.group("/x".into());
        assert!(group.has_controller(Controller::Cpu));
        assert!(!group.has_controller(Controller::Cpuset));

        let none = CgroupRoot::new(dir.path().join("missing"), &[], &dir.path().join("proc"));
        assert!(!none.is_available());
    }

    #[test]
    fn test_machine_path_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        std::fs::create_dir_all(proc_root.join("1")).unwrap();

        std::fs::write(proc_root.join("1/comm"), "init\n").unwrap();
        let direct = CgroupRoot::new(dir.path(), &[], &proc_root);
        assert_eq!(direct.strategy(), RootStrategy::Direct);
        assert_eq!(
            direct.machine_path("/machine", "ch-12-vm 1"),
            "/machine/ch-12-vm-1.libvirt-ch"
        );

        std::fs::write(proc_root.join("1/comm"), "systemd\n").unwrap();
        let systemd = CgroupRoot::new(dir.path(), &[], &proc_root);
        assert_eq!(
            systemd.machine_path("/machine", "ch-12-vm1"),
            "/machine.slice/machine-ch-12-vm1.scope"
        );
    }

    #[test]
    fn test_create_machine_and_knobs() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpuset cpu io memory");
        let group = root.create_machine("/machine", "ch-1-vm1").unwrap();
        assert!(group.dir().is_dir());

        group.add_task(100).unwrap();
        assert_eq!(std::fs::read_to_string(group.dir().join("cgroup.procs")).unwrap(), "100");

        group.set_cpu_bandwidth(Some(50_000), None).unwrap();
        assert_eq!(group.read("cpu.max").unwrap(), "max 50000");
        group.set_cpu_bandwidth(None, Some(20_000)).unwrap();
        assert_eq!(group.read("cpu.max").unwrap(), "20000 50000");
        group.set_cpu_bandwidth(None, Some(-1)).unwrap();
        assert_eq!(group.read("cpu.max").unwrap(), "max 50000");

        let mut def = DomainDef::new("vm1", 1, 1024);
        def.blkio.weight = Some(500);
        def.memtune.hard_limit_kib = Some(1024);
        def.memtune.swap_hard_limit_kib = Some(3072);
        def.cputune.shares = Some(1024);
        group.apply_domain_tuning(&def).unwrap();
        assert_eq!(group.read("io.weight").unwrap(), "default 500");
        assert_eq!(group.read("memory.max").unwrap(), "1048576");
        assert_eq!(group.read("memory.swap.max").unwrap(), "2097152");
        assert_eq!(group.read("cpu.weight").unwrap(), "39");
    }

    #[test]
    fn test_tuning_without_controller_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpuset");
        let group = root.create_machine("/machine", "ch-1-vm1").unwrap();

        let mut def = DomainDef::new("vm1", 1, 1024);
        def.cputune.shares = Some(1024);
        let err = group.apply_domain_tuning(&def).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigUnsupported);
    }

    #[test]
    fn test_relative_partition_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpu");
        let err = root.create_machine("machine", "x").unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_thread_group_keeps_threaded_controllers() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpuset cpu memory io");
        let group = root.create_machine("/machine", "ch-1-vm1").unwrap();

        let vcpu = group.thread_group(ThreadGroup::Vcpu(2)).unwrap();
        assert!(vcpu.path().ends_with("/vcpu2"));
        assert!(vcpu.has_controller(Controller::Cpuset));
        assert!(!vcpu.has_controller(Controller::Memory));

        vcpu.add_thread(4242).unwrap();
        assert_eq!(vcpu.read("cgroup.threads").unwrap(), "4242");
        assert_eq!(vcpu.read("cgroup.type").unwrap(), "threaded");
    }

    #[test]
    fn test_restore_mems_rewrites_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "cpuset cpu");
        let group = root.create_machine("/machine", "ch-1-vm1").unwrap();
        let emu = group.thread_group(ThreadGroup::Emulator).unwrap();
        emu.set_cpuset_mems("1").unwrap();

        group.restore_mems(&Bitmap::parse("0-1").unwrap()).unwrap();
        assert_eq!(group.cpuset_mems().unwrap(), "0-1");
        assert_eq!(emu.cpuset_mems().unwrap(), "1");
    }

    #[test]
    fn test_remove_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(dir.path(), "");
        let group = root.create_machine("/machine", "ch-1-vm1").unwrap();
        std::fs::create_dir_all(group.dir().join("vcpu0")).unwrap();
        std::fs::create_dir_all(group.dir().join("emulator")).unwrap();

        group.remove().unwrap();
        assert!(!group.dir().exists());
        // already gone is fine
        group.remove().unwrap();
    }

    #[test]
    fn test_retry_busy_gives_up() {
        let calls = Cell::new(0);
        let done = retry_busy(5, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err(std::io::Error::from_raw_os_error(libc::EBUSY))
        })
        .unwrap();
        assert!(!done);
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn test_retry_busy_succeeds_after_busy() {
        let calls = Cell::new(0);
        let done = retry_busy(5, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(std::io::Error::from_raw_os_error(libc::EBUSY))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert!(done);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_busy_propagates_other_errors() {
        let err = retry_busy(5, Duration::from_millis(1), || {
            Err(std::io::Error::from_raw_os_error(libc::EACCES))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn test_pid_cgroup_path() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("77");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("cgroup"),
            "1:name=systemd:/old\n0::/machine.slice/machine-ch-77-vm1.scope\n",
        )
        .unwrap();
        assert_eq!(
            pid_cgroup_path(dir.path(), 77).as_deref(),
            Some("/machine.slice/machine-ch-77-vm1.scope")
        );
        assert_eq!(pid_cgroup_path(dir.path(), 78), None);
    }
}
