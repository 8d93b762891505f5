//! Domain lifecycle: start, stop and the state-changing operations.
//!
//! Every function here that changes a domain either takes a job itself or
//! expects the caller to hold one. The domain mutex is only held for short
//! sections and never across VMM calls or thread joins.

pub mod binder;
pub mod reconnect;
pub mod watcher;

pub use binder::{Binder, SystemThreads, ThreadControl};
pub use watcher::WatcherHandle;

use crate::bitmap::Bitmap;
use crate::cgroup::{sanitize_component, Cgroup, Controller};
use crate::domain::def::{DomainDef, Placement};
use crate::domain::{persist, Domain, DomainInner, DomainState, JobKind, StateReason};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::monitor::body::{build_vm_config, check_supported_devices};
use crate::monitor::launcher;
use crate::monitor::{EventHandler, Monitor, MonitorPaths};
use crate::network;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Weak};

/// Machine name of a run: the systemd machine when the VMM lives in a
/// `machine-*.scope`, `ch-<id>-<name>` otherwise.
pub fn machine_name(proc_root: &Path, pid: i32, id: i32, name: &str) -> String {
    if let Some(machine) = systemd_machine(proc_root, pid) {
        return machine;
    }
    format!("ch-{}-{}", id, sanitize_component(name))
}

fn systemd_machine(proc_root: &Path, pid: i32) -> Option<String> {
    let raw = std::fs::read_to_string(proc_root.join(pid.to_string()).join("cgroup")).ok()?;
    raw.lines()
        .filter_map(|line| line.rsplit('/').next())
        .find_map(|leaf| {
            leaf.strip_prefix("machine-")
                .and_then(|rest| rest.strip_suffix(".scope"))
        })
        .map(|escaped| escaped.replace("\\x2d", "-"))
}

/// Placement inputs captured from a locked domain.
struct BindSnapshot {
    def: DomainDef,
    pid: i32,
    cgroup: Option<Cgroup>,
    auto_cpuset: Option<Bitmap>,
    auto_nodeset: Option<Bitmap>,
}

impl BindSnapshot {
    fn capture(inner: &DomainInner) -> Self {
        Self {
            def: inner.def.clone(),
            pid: inner.pid,
            cgroup: inner.runtime.cgroup.clone(),
            auto_cpuset: inner.runtime.auto_cpuset.clone(),
            auto_nodeset: inner.runtime.auto_nodeset.clone(),
        }
    }

    fn binder<'a>(&'a self, driver: &'a Driver) -> Binder<'a> {
        Binder {
            def: &self.def,
            cgroup: self.cgroup.as_ref(),
            auto_cpuset: self.auto_cpuset.as_ref(),
            auto_nodeset: self.auto_nodeset.as_ref(),
            host: &driver.host,
            control: driver.threads.as_ref(),
        }
    }
}

/// Bind the threads of the monitor's last scan and record the vcpu table.
fn bind_threads(
    driver: &Driver,
    domain: &Domain,
    monitor: &Monitor,
    validate_vcpus: bool,
) -> Result<()> {
    let (snapshot, bound) = {
        let inner = domain.lock();
        (BindSnapshot::capture(&inner), inner.runtime.bound_tids.clone())
    };
    let threads = monitor.threads();
    let pids = snapshot.binder(driver).setup_threads(&threads, &bound)?;

    if validate_vcpus {
        for (id, vcpu) in snapshot.def.vcpus.iter().enumerate() {
            if vcpu.online && pids.get(id).copied().unwrap_or(0) == 0 {
                tracing::warn!(domain = %domain.name(), vcpu = id, "online vcpu has no thread");
            }
        }
    }

    let mut inner = domain.lock();
    inner.runtime.vcpu_pids = pids;
    inner.runtime.bound_tids = threads.iter().map(|t| t.tid).collect();
    persist::save_status(&driver.config, &inner)
}

/// Rescan VMM threads and rebind when the set changed.
///
/// The caller holds a modify job. Returns whether a rebind happened.
pub fn refresh_and_bind(driver: &Driver, domain: &Domain, validate_vcpus: bool) -> Result<bool> {
    let Some(monitor) = domain.monitor() else {
        return Ok(false);
    };
    let def = domain.lock().def.clone();
    if monitor.refresh_threads(&def)? == 0 {
        return Ok(false);
    }
    bind_threads(driver, domain, &monitor, validate_vcpus)?;
    Ok(true)
}

/// Pull state and console PTYs from `vm.info`.
pub fn sync_info(domain: &Domain, monitor: &Monitor) -> Result<()> {
    let info = monitor.info()?;
    let mut inner = domain.lock();
    if let Some(state) = info.domain_state() {
        if state != inner.state {
            inner.set_state(state, StateReason::Unknown);
        }
    }
    if let Some(pty) = info.console_pty() {
        if let Some(console) = inner.def.consoles.first_mut() {
            console.path = Some(pty.to_path_buf());
        }
    }
    if let Some(pty) = info.serial_pty() {
        if let Some(serial) = inner.def.serials.first_mut() {
            serial.path = Some(pty.to_path_buf());
        }
    }
    Ok(())
}

fn auto_placement(driver: &Driver, def: &DomainDef) -> Result<(Option<Bitmap>, Option<Bitmap>)> {
    let numa_auto = def
        .numatune
        .as_ref()
        .is_some_and(|t| t.placement == Placement::Auto);
    if def.placement != Placement::Auto && !numa_auto {
        return Ok((None, None));
    }
    let nodes = driver.host.numa_nodes()?;
    let cpus = driver.host.nodeset_to_cpuset(&nodes)?;
    tracing::debug!(domain = %def.name, cpus = %cpus, nodes = %nodes, "auto placement");
    Ok((Some(cpus), Some(nodes)))
}

fn setup_cgroup(
    driver: &Driver,
    def: &DomainDef,
    machine: &str,
    pid: i32,
    auto_nodeset: Option<&Bitmap>,
) -> Result<Option<Cgroup>> {
    let Some(root) = driver.cgroups.as_ref() else {
        return Ok(None);
    };
    let group = root.create_machine(def.partition(), machine)?;
    let applied = (|| -> Result<()> {
        group.add_task(pid)?;
        group.apply_domain_tuning(def)?;
        if group.has_controller(Controller::Cpuset) {
            if let Some(nodes) = def.strict_nodeset(auto_nodeset) {
                group.set_cpuset_mems(&nodes.format())?;
            }
        }
        Ok(())
    })();
    match applied {
        Ok(()) => Ok(Some(group)),
        Err(e) => {
            if let Err(undo) = group.remove() {
                tracing::debug!(error = %undo, "cannot remove machine cgroup");
            }
            Err(e)
        }
    }
}

/// Start a domain. The caller holds a modify job.
///
/// Any failure stops the domain with reason `failed` and returns the
/// original error.
pub fn start(driver: &Arc<Driver>, domain: &Arc<Domain>, reason: StateReason) -> Result<()> {
    if domain.is_active() {
        return Err(Error::operation_invalid(format!(
            "domain '{}' is already running",
            domain.name()
        )));
    }
    tracing::info!(domain = %domain.name(), "starting domain");

    match boot(driver, domain, reason) {
        Ok(()) => {
            tracing::info!(domain = %domain.name(), pid = domain.id(), "domain started");
            Ok(())
        }
        Err(e) => {
            tracing::error!(domain = %domain.name(), error = %e, "start failed");
            stop(driver, domain, StateReason::Failed);
            Err(e)
        }
    }
}

fn boot(driver: &Arc<Driver>, domain: &Arc<Domain>, reason: StateReason) -> Result<()> {
    let config = &driver.config;
    let mut def = domain.lock().def.clone();
    check_supported_devices(&def)?;

    tracing::debug!(domain = %def.name, "preparing network devices");
    let tapfds = network::prepare_interfaces(config, driver.net.as_ref(), &mut def)?;
    let raw: Vec<Vec<RawFd>> = tapfds
        .iter()
        .map(|fds| fds.iter().map(AsRawFd::as_raw_fd).collect())
        .collect();
    {
        let mut inner = domain.lock();
        inner.def = def.clone();
        inner.runtime.tapfds = tapfds;
    }
    network::start_interfaces(config, driver.net.as_ref(), &def)?;

    tracing::debug!(domain = %def.name, "preparing host devices");
    driver.hostdevs.prepare(domain.name(), &def.hostdevs)?;

    let body = build_vm_config(&def, &raw, driver.host.sysfs_root())?;
    let binary = launcher::resolve_emulator(def.emulator.as_deref(), &config.emulator)?;
    let paths = MonitorPaths::for_domain(config, domain.name());
    let pidfile = paths.pidfile.clone();
    let pass_fds: Vec<RawFd> = raw.iter().flatten().copied().collect();

    let monitor = Arc::new(Monitor::launch(
        &binary,
        paths,
        &pass_fds,
        driver.scanner.clone(),
        Box::new(DomainEvents::new(driver, domain)),
    )?);
    let pid = monitor.pid();
    {
        let mut inner = domain.lock();
        inner.runtime.monitor = Some(Arc::clone(&monitor));
        inner.runtime.pidfile = Some(pidfile);
        inner.pid = pid;
    }

    monitor.create_vm(&body)?;

    let machine = machine_name(driver.scanner.proc_root(), pid, pid, domain.name());
    let (auto_cpuset, auto_nodeset) = auto_placement(driver, &def)?;
    {
        let mut inner = domain.lock();
        inner.id = pid;
        inner.runtime.machine_name = Some(machine.clone());
        inner.runtime.auto_cpuset = auto_cpuset;
        inner.runtime.auto_nodeset = auto_nodeset.clone();
    }

    let cgroup = setup_cgroup(driver, &def, &machine, pid, auto_nodeset.as_ref())?;
    domain.lock().runtime.cgroup = cgroup;

    BindSnapshot::capture(&domain.lock())
        .binder(driver)
        .init_affinity(pid)?;

    monitor.boot()?;
    monitor.refresh_threads(&def)?;
    sync_info(domain, &monitor)?;
    bind_threads(driver, domain, &monitor, true)?;

    BindSnapshot::capture(&domain.lock())
        .binder(driver)
        .setup_global_cpu()?;

    let watcher = WatcherHandle::spawn(driver, domain)?;

    let mut inner = domain.lock();
    inner.runtime.watcher = Some(watcher);
    inner.set_state(DomainState::Running, reason);
    persist::save_status(config, &inner)
}

/// Tear down everything a run owns and mark the domain shut off.
///
/// Safe to call on a half-started domain and from the event loop thread.
pub fn stop(driver: &Driver, domain: &Domain, reason: StateReason) {
    let (runtime, def, pid) = {
        let mut inner = domain.lock();
        tracing::debug!(domain = %domain.name(), pid = inner.pid, reason = %reason, "stopping domain");
        (
            std::mem::take(&mut inner.runtime),
            inner.def.clone(),
            inner.pid,
        )
    };

    if let Some(watcher) = runtime.watcher {
        watcher.stop();
    }
    match runtime.monitor {
        Some(monitor) => monitor.close(),
        None if pid > 0 && launcher::pid_alive(pid) => {
            if let Err(e) = launcher::kill_painfully(pid) {
                tracing::warn!(domain = %domain.name(), pid, error = %e, "VMM did not terminate");
            }
        }
        None => {}
    }

    driver.hostdevs.reattach(domain.name(), &def.hostdevs);
    network::release_interfaces(&driver.config, driver.net.as_ref(), &def);

    if let Some(cgroup) = runtime.cgroup {
        if let Err(e) = cgroup.remove() {
            tracing::warn!(domain = %domain.name(), error = %e, "failed to remove cgroup");
        }
    }

    let pidfile = runtime
        .pidfile
        .unwrap_or_else(|| driver.config.pid_file(domain.name()));
    {
        let mut inner = domain.lock();
        inner.pid = -1;
        inner.id = -1;
        if let Some(next) = inner.new_def.take() {
            inner.def = next;
        }
        inner.set_state(DomainState::Shutoff, reason);
    }

    if let Err(e) = persist::remove_status(&driver.config, domain.name()) {
        tracing::warn!(domain = %domain.name(), error = %e, "failed to remove status document");
    }
    if let Err(e) = std::fs::remove_file(&pidfile) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(domain = %domain.name(), error = %e, "failed to remove pidfile");
        }
    }

    // tap fds close here
    drop(runtime.tapfds);
    tracing::info!(domain = %domain.name(), reason = %reason, "domain stopped");
}

/// Drop an inactive transient domain from the registry.
pub fn remove_if_transient(driver: &Driver, domain: &Domain) {
    let remove = {
        let inner = domain.lock();
        !inner.persistent && !inner.is_active()
    };
    if remove {
        driver.domains.remove(domain);
    }
}

fn active_monitor(domain: &Domain) -> Result<Arc<Monitor>> {
    let inner = domain.lock();
    if !inner.is_active() {
        return Err(Error::operation_invalid("domain is not running"));
    }
    inner
        .runtime
        .monitor
        .clone()
        .ok_or_else(|| Error::internal("domain has no monitor"))
}

/// Ask the guest to shut down.
pub fn shutdown(driver: &Driver, domain: &Domain) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let monitor = active_monitor(domain)?;
    let state = domain.state().0;
    if !state.can_shutdown() {
        return Err(Error::operation_invalid(
            "only running or paused domains can be shut down",
        ));
    }
    monitor.shutdown()?;

    let mut inner = domain.lock();
    inner.set_state(DomainState::Shutdown, StateReason::User);
    persist::save_status(&driver.config, &inner)
}

/// Reboot the guest.
pub fn reboot(driver: &Driver, domain: &Domain) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let monitor = active_monitor(domain)?;
    let state = domain.state().0;
    if !state.can_reboot() {
        return Err(Error::operation_unsupported(
            "only running or paused domains can be rebooted",
        ));
    }
    monitor.reboot()?;

    let reason = if state == DomainState::Running {
        StateReason::Booted
    } else {
        StateReason::Unpaused
    };
    let mut inner = domain.lock();
    inner.set_state(DomainState::Running, reason);
    persist::save_status(&driver.config, &inner)
}

/// Pause the guest.
pub fn suspend(driver: &Driver, domain: &Domain) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let monitor = active_monitor(domain)?;
    if !domain.state().0.can_suspend() {
        return Err(Error::operation_invalid("only running domains can be suspended"));
    }
    monitor.pause()?;

    let mut inner = domain.lock();
    inner.set_state(DomainState::Paused, StateReason::User);
    persist::save_status(&driver.config, &inner)
}

/// Resume a paused guest.
pub fn resume(driver: &Driver, domain: &Domain) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let monitor = active_monitor(domain)?;
    if !domain.state().0.can_resume() {
        return Err(Error::operation_invalid("only paused domains can be resumed"));
    }
    monitor.resume()?;

    let mut inner = domain.lock();
    inner.set_state(DomainState::Running, StateReason::Unpaused);
    persist::save_status(&driver.config, &inner)
}

/// Kill the VMM and stop the domain.
pub fn destroy(driver: &Driver, domain: &Domain) -> Result<()> {
    {
        let _job = domain.begin_job(JobKind::Destroy, driver.config.job_timeout)?;
        if !domain.is_active() {
            return Err(Error::operation_invalid("domain is not running"));
        }
        stop(driver, domain, StateReason::Destroyed);
    }
    remove_if_transient(driver, domain);
    Ok(())
}

/// Reacts to VMM events on behalf of one domain.
pub struct DomainEvents {
    driver: Weak<Driver>,
    domain: Weak<Domain>,
}

impl DomainEvents {
    /// Handler holding weak references to `driver` and `domain`.
    pub fn new(driver: &Arc<Driver>, domain: &Arc<Domain>) -> Self {
        Self {
            driver: Arc::downgrade(driver),
            domain: Arc::downgrade(domain),
        }
    }

    fn upgrade(&self) -> Option<(Arc<Driver>, Arc<Domain>)> {
        Some((self.driver.upgrade()?, self.domain.upgrade()?))
    }

    fn stop_with(&self, driver: &Driver, domain: &Domain, reason: StateReason) {
        {
            let Ok(_job) = domain.begin_job(JobKind::Modify, driver.config.job_timeout) else {
                tracing::warn!(domain = %domain.name(), "failed to mark the domain as shut off");
                return;
            };
            if !domain.is_active() {
                return;
            }
            stop(driver, domain, reason);
            let inner = domain.lock();
            if inner.persistent {
                if let Err(e) = persist::save_config(&driver.config, &inner.def) {
                    tracing::warn!(domain = %domain.name(), error = %e, "failed to persist the domain after shutdown");
                }
            }
        }
        remove_if_transient(driver, domain);
    }
}

impl EventHandler for DomainEvents {
    fn rebind(&self, validate_vcpus: bool) {
        let Some((driver, domain)) = self.upgrade() else {
            return;
        };
        let Ok(_job) = domain.begin_job(JobKind::Modify, driver.config.job_timeout) else {
            tracing::warn!(domain = %domain.name(), "cannot rebind threads, domain busy");
            return;
        };
        if !domain.is_active() {
            return;
        }
        if let Err(e) = refresh_and_bind(&driver, &domain, validate_vcpus) {
            tracing::warn!(domain = %domain.name(), error = %e, "thread rebind failed");
        }
    }

    fn shutdown(&self, only_if_requested: bool) {
        let Some((driver, domain)) = self.upgrade() else {
            return;
        };
        if only_if_requested && domain.state().0 != DomainState::Shutdown {
            tracing::debug!(domain = %domain.name(), "guest shutdown not requested, ignoring");
            return;
        }
        self.stop_with(&driver, &domain, StateReason::Shutdown);
    }

    fn vmm_gone(&self) {
        let Some((driver, domain)) = self.upgrade() else {
            return;
        };
        let pid = domain.lock().pid;
        if pid > 0 && launcher::pid_alive(pid) {
            return;
        }
        tracing::warn!(domain = %domain.name(), pid, "VMM exited unexpectedly");
        self.stop_with(&driver, &domain, StateReason::Crashed);
    }
}
