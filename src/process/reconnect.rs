//! Re-adopting VMMs that outlived a driver restart.
//!
//! Each domain whose status document names a pid gets its own `init-<name>`
//! thread, so one stuck VMM does not hold up the others. Once every thread
//! is done, inactive transient domains are dropped and autostart domains
//! are booted.

use super::{auto_placement, machine_name, remove_if_transient, stop, sync_info, DomainEvents};
use crate::domain::{persist, Domain, DomainState, JobKind, StateReason};
use crate::driver::Driver;
use crate::error::Result;
use crate::monitor::{Monitor, MonitorPaths};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Spawn a reconnect thread for every domain with a recorded pid.
pub fn reconnect_all(driver: &Arc<Driver>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for domain in driver.domains.list() {
        if domain.lock().pid <= 0 {
            continue;
        }
        let thread_driver = Arc::clone(driver);
        let thread_domain = Arc::clone(&domain);
        let spawned = std::thread::Builder::new()
            .name(format!("init-{}", domain.name()))
            .spawn(move || reconnect_one(&thread_driver, &thread_domain));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!(domain = %domain.name(), error = %e, "could not create reconnect thread");
                stop(driver, &domain, StateReason::Failed);
                remove_if_transient(driver, &domain);
            }
        }
    }
    handles
}

/// Reconnect everything, wait for it, then start autostart domains.
pub fn reconnect_and_autostart(driver: &Arc<Driver>) {
    for handle in reconnect_all(driver) {
        if handle.join().is_err() {
            tracing::warn!("reconnect thread panicked");
        }
    }
    for domain in driver.domains.list() {
        remove_if_transient(driver, &domain);
    }
    autostart(driver);
}

/// Start persistent, inactive domains marked for autostart.
pub fn autostart(driver: &Arc<Driver>) {
    for domain in driver.domains.list() {
        let wanted = {
            let inner = domain.lock();
            inner.persistent && inner.autostart && !inner.is_active()
        };
        if !wanted {
            continue;
        }
        let result = domain
            .begin_job(JobKind::Modify, driver.config.job_timeout)
            .and_then(|_job| super::start(driver, &domain, StateReason::Booted));
        if let Err(e) = result {
            tracing::error!(domain = %domain.name(), error = %e, "failed to autostart domain");
        }
    }
}

fn reconnect_one(driver: &Arc<Driver>, domain: &Arc<Domain>) {
    tracing::debug!(domain = %domain.name(), "reconnecting");
    match domain.begin_job(JobKind::Modify, driver.config.job_timeout) {
        Ok(_job) => {
            if let Err(e) = reattach(driver, domain) {
                tracing::error!(domain = %domain.name(), error = %e, "failed to reconnect");
                // the status document said running; whatever is left goes
                stop(driver, domain, StateReason::Unknown);
            }
        }
        Err(e) => {
            tracing::error!(domain = %domain.name(), error = %e, "failed to reconnect");
            stop(driver, domain, StateReason::Unknown);
        }
    }
    remove_if_transient(driver, domain);
}

fn reattach(driver: &Arc<Driver>, domain: &Arc<Domain>) -> Result<()> {
    let def = domain.lock().def.clone();
    driver.hostdevs.update_active(domain.name(), &def.hostdevs)?;

    let paths = MonitorPaths::for_domain(&driver.config, domain.name());
    let pidfile = paths.pidfile.clone();
    let monitor = Arc::new(Monitor::reconnect(
        paths,
        driver.scanner.clone(),
        Box::new(DomainEvents::new(driver, domain)),
    )?);
    let pid = monitor.pid();

    let (auto_cpuset, auto_nodeset) = auto_placement(driver, &def)?;
    {
        let mut inner = domain.lock();
        inner.runtime.monitor = Some(Arc::clone(&monitor));
        inner.runtime.pidfile = Some(pidfile);
        inner.pid = pid;
        inner.id = pid;
        if inner.runtime.machine_name.is_none() {
            inner.runtime.machine_name = Some(machine_name(
                driver.scanner.proc_root(),
                pid,
                pid,
                domain.name(),
            ));
        }
        inner.runtime.auto_cpuset = auto_cpuset;
        inner.runtime.auto_nodeset = auto_nodeset;
    }
    tracing::debug!(domain = %domain.name(), pid, "monitor reopened");

    if let Some(root) = driver.cgroups.as_ref() {
        let group = root.attach(driver.scanner.proc_root(), pid)?;
        group.restore_mems(&driver.host.numa_nodes()?)?;
        domain.lock().runtime.cgroup = Some(group);
    }

    sync_info(domain, &monitor)?;

    let (state, reason) = domain.state();
    if state == DomainState::Shutdown
        || (state == DomainState::Paused && reason == StateReason::ShuttingDown)
    {
        tracing::debug!(domain = %domain.name(), "finishing shutdown sequence");
        stop(driver, domain, StateReason::Daemon);
        return Ok(());
    }

    persist::save_status(&driver.config, &domain.lock())?;

    let watcher = super::WatcherHandle::spawn(driver, domain)?;
    domain.lock().runtime.watcher = Some(watcher);
    tracing::info!(domain = %domain.name(), pid, "reconnected to running domain");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddMode, DomainDef};
    use crate::process::tests::{test_driver, FakeVmm};

    fn recorded(driver: &Driver, name: &str, pid: i32, persistent: bool) -> Arc<Domain> {
        let (dom, _) = driver
            .domains
            .add(DomainDef::new(name, 1, 131072), AddMode::Define)
            .unwrap();
        let mut inner = dom.lock();
        inner.persistent = persistent;
        inner.pid = pid;
        inner.set_state(DomainState::Running, StateReason::Booted);
        drop(inner);
        dom
    }

    #[test]
    fn test_reconnect_running_domain() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let mut vmm = FakeVmm::start(&driver.config, "vm1");
        let dom = recorded(&driver, "vm1", vmm.pid(), true);

        for handle in reconnect_all(&driver) {
            handle.join().unwrap();
        }

        assert_eq!(dom.id(), vmm.pid());
        assert_eq!(dom.state().0, DomainState::Running);
        {
            let inner = dom.lock();
            assert!(inner.runtime.watcher.is_some());
            assert_eq!(
                inner.runtime.machine_name.as_deref(),
                Some(format!("ch-{}-vm1", vmm.pid()).as_str())
            );
        }
        assert!(driver.config.status_file("vm1").exists());
        assert_eq!(vmm.api.paths()[..2], ["/api/v1/vmm.ping", "/api/v1/vm.info"]);

        stop(&driver, &dom, StateReason::Destroyed);
        assert!(!dom.is_active());
        let _ = vmm.child.wait();
    }

    #[test]
    fn test_reconnect_finishes_pending_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let mut vmm = FakeVmm::start(&driver.config, "vm1");
        vmm.api.reply("vm.info", 200, r#"{"state":"Shutdown","config":{}}"#);
        let dom = recorded(&driver, "vm1", vmm.pid(), false);

        reconnect_and_autostart(&driver);

        assert_eq!(dom.state(), (DomainState::Shutoff, StateReason::Daemon));
        assert!(driver.domains.find_by_name("vm1").is_none());
        let _ = vmm.child.wait();
    }

    #[test]
    fn test_reconnect_without_vmm_leaves_domain_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let transient = recorded(&driver, "gone", 999_999, false);
        let persistent = recorded(&driver, "kept", 999_998, true);

        reconnect_and_autostart(&driver);

        assert!(!transient.is_active());
        assert!(driver.domains.find_by_name("gone").is_none());
        assert!(driver.domains.find_by_name("kept").is_some());
        assert_eq!(persistent.state(), (DomainState::Shutoff, StateReason::Unknown));
    }

    #[test]
    fn test_autostart_failure_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (dom, _) = driver
            .domains
            .add(DomainDef::new("auto", 1, 131072), AddMode::Define)
            .unwrap();
        {
            let mut inner = dom.lock();
            inner.persistent = true;
            inner.autostart = true;
        }

        // no kernel: start fails and the domain stays defined and off
        autostart(&driver);
        assert_eq!(dom.state(), (DomainState::Shutoff, StateReason::Failed));
        assert!(driver.domains.find_by_name("auto").is_some());
    }
}
