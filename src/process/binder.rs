//! Thread placement: cgroups, affinity and scheduler per VMM thread.
//!
//! Every thread goes through [`Binder::setup_pid`], which picks the
//! effective CPU mask, creates the thread's cgroup child, and then applies
//! affinity and scheduler settings to the tid.

use crate::bitmap::Bitmap;
use crate::cgroup::{Cgroup, Controller, ThreadGroup};
use crate::domain::def::{DomainDef, NumaMode, Placement, SchedDef};
use crate::error::{Error, Result};
use crate::host::HostTopology;
use crate::monitor::{ThreadInfo, ThreadKind};
use nix::unistd::Pid;

/// Kernel calls that place a thread.
pub trait ThreadControl: Send + Sync {
    /// Pin `tid` to `cpus`.
    fn set_affinity(&self, tid: i32, cpus: &Bitmap) -> Result<()>;

    /// Set scheduler policy and priority of `tid`.
    fn set_scheduler(&self, tid: i32, sched: &SchedDef) -> Result<()>;
}

/// [`ThreadControl`] backed by the real syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemThreads;

impl ThreadControl for SystemThreads {
    fn set_affinity(&self, tid: i32, cpus: &Bitmap) -> Result<()> {
        let set = cpus.to_cpu_set()?;
        nix::sched::sched_setaffinity(Pid::from_raw(tid), &set).map_err(|e| {
            Error::internal(format!("cannot set CPU affinity of {} to {}: {}", tid, cpus, e))
        })
    }

    fn set_scheduler(&self, tid: i32, sched: &SchedDef) -> Result<()> {
        let param = libc::sched_param {
            sched_priority: sched.priority,
        };
        let rc = unsafe { libc::sched_setscheduler(tid, sched.policy.as_raw(), &param) };
        if rc != 0 {
            return Err(Error::internal(format!(
                "cannot set scheduler of {}: {}",
                tid,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// CPU mask for a thread: explicit, then the auto set when placement is
/// automatic, then the domain-wide mask.
///
/// `None` means no mask is configured; affinity then falls back to all host
/// CPUs while the cgroup cpuset is left alone.
pub fn effective_mask(
    explicit: Option<&Bitmap>,
    def: &DomainDef,
    auto_cpuset: Option<&Bitmap>,
) -> Option<Bitmap> {
    if let Some(mask) = explicit {
        return Some(mask.clone());
    }
    if def.placement == Placement::Auto {
        match auto_cpuset {
            Some(auto) => return Some(auto.clone()),
            None => tracing::warn!(domain = %def.name, "automatic placement produced no CPU set"),
        }
    }
    def.cpumask.clone()
}

fn bandwidth(period: Option<u64>, quota: Option<i64>) -> (Option<u64>, Option<i64>) {
    (period.filter(|p| *p > 0), quota.filter(|q| *q != 0))
}

/// Tuning applied to one thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadTuning<'a> {
    /// cgroup child for the thread.
    pub group: ThreadGroup,
    /// Explicit CPU mask.
    pub cpumask: Option<&'a Bitmap>,
    /// Bandwidth period (µs).
    pub period: Option<u64>,
    /// Bandwidth quota (µs).
    pub quota: Option<i64>,
    /// Scheduler.
    pub sched: Option<&'a SchedDef>,
}

/// Everything needed to place the threads of one domain.
pub struct Binder<'a> {
    /// Active definition.
    pub def: &'a DomainDef,
    /// Domain cgroup, when cgroups are in use.
    pub cgroup: Option<&'a Cgroup>,
    /// Auto-placement CPU set.
    pub auto_cpuset: Option<&'a Bitmap>,
    /// Auto-placement node set.
    pub auto_nodeset: Option<&'a Bitmap>,
    /// Host topology.
    pub host: &'a HostTopology,
    /// Syscall backend.
    pub control: &'a dyn ThreadControl,
}

impl Binder<'_> {
    fn has_controller(&self, controller: Controller) -> bool {
        self.cgroup.is_some_and(|c| c.has_controller(controller))
    }

    fn require_cpu_controller(&self, period: Option<u64>, quota: Option<i64>) -> Result<()> {
        if (period.is_some() || quota.is_some()) && !self.has_controller(Controller::Cpu) {
            return Err(Error::config_unsupported(
                "cgroup cpu is required for scheduler tuning",
            ));
        }
        Ok(())
    }

    fn strict_mems(&self) -> Option<String> {
        self.def
            .strict_nodeset(self.auto_nodeset)
            .map(|nodes| nodes.format())
    }

    /// Place one thread.
    pub fn setup_pid(&self, tid: i32, tuning: &ThreadTuning<'_>) -> Result<()> {
        let (period, quota) = bandwidth(tuning.period, tuning.quota);
        self.require_cpu_controller(period, quota)?;

        let mask = effective_mask(tuning.cpumask, self.def, self.auto_cpuset);

        let mut child = None;
        if self.has_controller(Controller::Cpu) || self.has_controller(Controller::Cpuset) {
            if let Some(cgroup) = self.cgroup {
                child = Some(cgroup.thread_group(tuning.group)?);
            }
        }

        let result = self.apply(tid, tuning, child.as_ref(), mask, period, quota);
        if result.is_err() {
            if let Some(child) = &child {
                if let Err(e) = child.remove() {
                    tracing::debug!(path = child.path(), error = %e, "cannot remove thread cgroup");
                }
            }
        }
        result
    }

    fn apply(
        &self,
        tid: i32,
        tuning: &ThreadTuning<'_>,
        child: Option<&Cgroup>,
        mask: Option<Bitmap>,
        period: Option<u64>,
        quota: Option<i64>,
    ) -> Result<()> {
        if let Some(child) = child {
            if self.has_controller(Controller::Cpuset) {
                if let Some(mask) = &mask {
                    child.set_cpuset_cpus(mask)?;
                }
                if let Some(mems) = self.strict_mems() {
                    child.set_cpuset_mems(&mems)?;
                }
            }
            if period.is_some() || quota.is_some() {
                child.set_cpu_bandwidth(period, quota)?;
            }
            tracing::debug!(tid, path = child.path(), "adding thread to cgroup");
            child.add_thread(tid)?;
        }

        let affinity = match mask {
            Some(mask) => mask,
            None => self.host.online_cpus()?,
        };
        self.control.set_affinity(tid, &affinity)?;

        if let Some(sched) = tuning.sched {
            self.control.set_scheduler(tid, sched)?;
        }
        Ok(())
    }

    /// Place every emulator thread. Emulator threads keep the scheduler
    /// they were started with.
    pub fn setup_emulator_threads(&self, threads: &[ThreadInfo]) -> Result<()> {
        let tune = &self.def.cputune;
        for thread in threads {
            let ThreadKind::Emulator { name } = &thread.kind else {
                continue;
            };
            tracing::debug!(tid = thread.tid, name = %name, "setting up emulator thread");
            self.setup_pid(
                thread.tid,
                &ThreadTuning {
                    group: ThreadGroup::Emulator,
                    cpumask: tune.emulatorpin.as_ref(),
                    period: tune.emulator_period,
                    quota: tune.emulator_quota,
                    sched: None,
                },
            )?;
        }
        Ok(())
    }

    /// Place every I/O thread on the auto CPU set. Each thread gets the
    /// `iothread<tid>` group.
    pub fn setup_io_threads(&self, threads: &[ThreadInfo]) -> Result<()> {
        let tune = &self.def.cputune;
        let io = threads
            .iter()
            .filter(|t| matches!(t.kind, ThreadKind::Io { .. }));
        for thread in io {
            tracing::debug!(tid = thread.tid, "setting up I/O thread");
            self.setup_pid(
                thread.tid,
                &ThreadTuning {
                    group: ThreadGroup::Iothread(thread.tid as usize),
                    cpumask: self.auto_cpuset,
                    period: tune.iothread_period,
                    quota: tune.iothread_quota,
                    sched: None,
                },
            )?;
        }
        Ok(())
    }

    /// Place every online vcpu. `vcpu_pids` is indexed by vcpu id; threads
    /// listed in `bound` are already placed and left alone.
    pub fn setup_vcpus(&self, vcpu_pids: &[i32], bound: &[i32]) -> Result<()> {
        let tune = &self.def.cputune;
        let (period, quota) = bandwidth(tune.period, tune.quota);
        self.require_cpu_controller(period, quota)?;

        if !vcpu_pids.iter().any(|pid| *pid > 0) {
            let custom = self.def.vcpus.iter().any(|v| {
                v.online && v.cpumask.as_ref().is_some_and(|m| Some(m) != self.def.cpumask.as_ref())
            });
            if custom {
                return Err(Error::operation_invalid("cpu affinity is not supported"));
            }
            return Ok(());
        }

        for (id, vcpu) in self.def.vcpus.iter().enumerate() {
            if !vcpu.online {
                continue;
            }
            let Some(tid) = vcpu_pids.get(id).copied().filter(|t| *t > 0) else {
                tracing::warn!(vcpu = id, "online vcpu has no thread");
                continue;
            };
            if bound.contains(&tid) {
                continue;
            }
            self.setup_pid(
                tid,
                &ThreadTuning {
                    group: ThreadGroup::Vcpu(id),
                    cpumask: vcpu.cpumask.as_ref(),
                    period,
                    quota,
                    sched: vcpu.sched.as_ref(),
                },
            )?;
        }
        Ok(())
    }

    /// Bind emulator, I/O and vcpu threads from a scan, skipping the tids
    /// in `bound`.
    ///
    /// Returns the vcpu thread table.
    pub fn setup_threads(&self, threads: &[ThreadInfo], bound: &[i32]) -> Result<Vec<i32>> {
        let pids = vcpu_pids(self.def.max_vcpus(), threads);
        let fresh: Vec<ThreadInfo> = threads
            .iter()
            .filter(|t| !bound.contains(&t.tid))
            .cloned()
            .collect();
        self.setup_emulator_threads(&fresh)?;
        self.setup_io_threads(&fresh)?;
        self.setup_vcpus(&pids, bound)?;
        Ok(pids)
    }

    /// Initial affinity of the whole VMM process.
    ///
    /// A strict single-node memory policy pins to that node's CPUs, then
    /// emulatorpin, then every host CPU.
    pub fn init_affinity(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(Error::internal(
                "cannot set up CPU affinity until the process is started",
            ));
        }
        let single_node = self
            .def
            .numatune
            .as_ref()
            .filter(|t| t.mode == NumaMode::Strict)
            .and_then(|_| self.def.strict_nodeset(self.auto_nodeset))
            .filter(|nodes| nodes.count() <= 1);

        let cpus = if let Some(nodes) = single_node {
            self.host.nodeset_to_cpuset(&nodes)?
        } else if let Some(pin) = &self.def.cputune.emulatorpin {
            pin.clone()
        } else {
            self.host.online_cpus()?
        };
        self.control.set_affinity(pid, &cpus)
    }

    /// Domain-wide bandwidth on the machine cgroup.
    pub fn setup_global_cpu(&self) -> Result<()> {
        let tune = &self.def.cputune;
        let (period, quota) = bandwidth(tune.global_period, tune.global_quota);
        self.require_cpu_controller(period, quota)?;
        let Some(cgroup) = self.cgroup else {
            return Ok(());
        };
        if period.is_some() || quota.is_some() {
            cgroup.set_cpu_bandwidth(period, quota)?;
        }
        Ok(())
    }
}

/// Thread id per vcpu index, 0 where no thread was found.
pub fn vcpu_pids(max_vcpus: usize, threads: &[ThreadInfo]) -> Vec<i32> {
    let mut pids = vec![0; max_vcpus];
    for thread in threads {
        if let Some(id) = thread.vcpu_id() {
            if let Some(slot) = pids.get_mut(id) {
                *slot = thread.tid;
            }
        }
    }
    pids
}

/// Widens the emulator group to all host nodes and puts the saved nodes
/// back on drop.
pub struct AllNodesGuard {
    emulator: Cgroup,
    saved: String,
}

impl AllNodesGuard {
    /// Allow the emulator group to allocate on every node.
    ///
    /// Returns `None` on hosts without NUMA or without the cpuset
    /// controller.
    pub fn allow(cgroup: Option<&Cgroup>, host: &HostTopology) -> Result<Option<Self>> {
        let Some(cgroup) = cgroup else {
            return Ok(None);
        };
        if !host.numa_available() || !cgroup.has_controller(Controller::Cpuset) {
            return Ok(None);
        }
        let all = host.numa_nodes()?.format();
        let emulator = cgroup.thread_group(ThreadGroup::Emulator)?;
        let saved = emulator.cpuset_mems()?;
        emulator.set_cpuset_mems(&all)?;
        tracing::debug!(path = emulator.path(), saved = %saved, "allowed all NUMA nodes");
        Ok(Some(Self { emulator, saved }))
    }
}

impl Drop for AllNodesGuard {
    fn drop(&mut self) {
        if let Err(e) = self.emulator.set_cpuset_mems(&self.saved) {
            tracing::warn!(path = self.emulator.path(), error = %e, "cannot restore emulator nodes");
        }
    }
}
