//! CPU pinning and NUMA memory tuning.
//!
//! Every setter takes a modify job, then applies the live part (cgroup
//! first, then the thread itself) and the persistent part separately.

use super::api::Affect;
use super::Driver;
use crate::bitmap::Bitmap;
use crate::cgroup::{Cgroup, Controller, ThreadGroup};
use crate::domain::def::{NumaMode, NumaTune, Placement};
use crate::domain::{persist, Domain, JobKind};
use crate::error::{Error, Result};
use crate::hotplug::edit_persistent;
use crate::process::binder::effective_mask;
use serde::Serialize;

/// NUMA memory parameters of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumaParams {
    /// Memory mode.
    pub mode: NumaMode,
    /// Nodes memory comes from; `None` leaves the nodeset unchanged.
    pub nodeset: Option<Bitmap>,
}

fn cpuset_group(cgroup: Option<Cgroup>) -> Option<Cgroup> {
    cgroup.filter(|c| c.has_controller(Controller::Cpuset))
}

pub(super) fn vcpu_pin_info(driver: &Driver, domain: &Domain, affect: Affect) -> Result<Vec<Bitmap>> {
    let host = driver.host.online_cpus()?;
    let inner = domain.lock();
    let (live, _) = affect.resolve(inner.is_active(), inner.persistent)?;
    let def = if live { &inner.def } else { inner.persistent_def() };
    let auto = live.then_some(inner.runtime.auto_cpuset.as_ref()).flatten();
    Ok(def
        .vcpus
        .iter()
        .map(|vcpu| effective_mask(vcpu.cpumask.as_ref(), def, auto).unwrap_or_else(|| host.clone()))
        .collect())
}

pub(super) fn emulator_pin_info(driver: &Driver, domain: &Domain, affect: Affect) -> Result<Bitmap> {
    let host = driver.host.online_cpus()?;
    let inner = domain.lock();
    let (live, _) = affect.resolve(inner.is_active(), inner.persistent)?;
    let def = if live { &inner.def } else { inner.persistent_def() };
    let auto = live.then_some(inner.runtime.auto_cpuset.as_ref()).flatten();
    Ok(effective_mask(def.cputune.emulatorpin.as_ref(), def, auto).unwrap_or(host))
}

pub(super) fn pin_vcpu(
    driver: &Driver,
    domain: &Domain,
    vcpu: usize,
    cpus: &Bitmap,
    affect: Affect,
) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let (live, config) = {
        let inner = domain.lock();
        let (live, config) = affect.resolve(inner.is_active(), inner.persistent)?;
        if config {
            let max = inner.persistent_def().max_vcpus();
            if vcpu >= max {
                return Err(Error::invalid_argument(format!(
                    "vcpu {} is out of range of persistent cpu count {}",
                    vcpu, max
                )));
            }
        }
        (live, config)
    };
    if cpus.is_empty() {
        return Err(Error::invalid_argument("Empty cpu list for pinning"));
    }

    if live {
        let (tid, online, cgroup) = {
            let inner = domain.lock();
            let max = inner.def.max_vcpus();
            if vcpu >= max {
                return Err(Error::invalid_argument(format!(
                    "vcpu {} is out of range of live cpu count {}",
                    vcpu, max
                )));
            }
            if !inner.runtime.has_vcpu_pids() {
                return Err(Error::operation_invalid("cpu affinity is not supported"));
            }
            (
                inner.runtime.vcpu_pid(vcpu),
                inner.def.vcpus[vcpu].online,
                cpuset_group(inner.runtime.cgroup.clone()),
            )
        };

        // offline vcpus only get the definition updated
        if online {
            if let Some(cgroup) = cgroup {
                cgroup.thread_group(ThreadGroup::Vcpu(vcpu))?.set_cpuset_cpus(cpus)?;
            }
            if let Some(tid) = tid {
                driver.threads.set_affinity(tid, cpus)?;
            }
        }

        let mut inner = domain.lock();
        inner.def.vcpus[vcpu].cpumask = Some(cpus.clone());
        persist::save_status(&driver.config, &inner)?;
        tracing::debug!(domain = %domain.name(), vcpu, cpus = %cpus, "pinned live vcpu");
    }

    if config {
        let mut inner = domain.lock();
        let def = edit_persistent(&mut inner, |def| {
            if let Some(v) = def.vcpus.get_mut(vcpu) {
                v.cpumask = Some(cpus.clone());
            }
        });
        persist::save_config(&driver.config, &def)?;
    }
    Ok(())
}

pub(super) fn pin_emulator(driver: &Driver, domain: &Domain, cpus: &Bitmap, affect: Affect) -> Result<()> {
    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let (live, config) = {
        let inner = domain.lock();
        affect.resolve(inner.is_active(), inner.persistent)?
    };
    if cpus.is_empty() {
        return Err(Error::invalid_argument("Empty cpu list for pinning"));
    }

    if live {
        let (pid, cgroup) = {
            let inner = domain.lock();
            (inner.pid, cpuset_group(inner.runtime.cgroup.clone()))
        };
        if let Some(cgroup) = cgroup {
            cgroup
                .thread_group(ThreadGroup::Emulator)
                .and_then(|group| group.set_cpuset_cpus(cpus))
                .map_err(|e| {
                    tracing::debug!(error = %e, "emulator cpuset not written");
                    Error::operation_invalid("failed to set cpuset.cpus in cgroup for emulator threads")
                })?;
        }
        driver.threads.set_affinity(pid, cpus)?;

        let mut inner = domain.lock();
        inner.def.cputune.emulatorpin = Some(cpus.clone());
        persist::save_status(&driver.config, &inner)?;
        tracing::debug!(domain = %domain.name(), cpus = %cpus, "pinned emulator");
    }

    if config {
        let mut inner = domain.lock();
        let def = edit_persistent(&mut inner, |def| def.cputune.emulatorpin = Some(cpus.clone()));
        persist::save_config(&driver.config, &def)?;
    }
    Ok(())
}

pub(super) fn numa_parameters(domain: &Domain, affect: Affect) -> Result<NumaParams> {
    let inner = domain.lock();
    let (live, _) = affect.resolve(inner.is_active(), inner.persistent)?;
    let def = if live { &inner.def } else { inner.persistent_def() };
    let tune = def.numatune.clone().unwrap_or_default();
    let nodeset = if tune.placement == Placement::Auto && live {
        inner.runtime.auto_nodeset.clone()
    } else {
        tune.nodeset
    };
    Ok(NumaParams {
        mode: tune.mode,
        nodeset,
    })
}

pub(super) fn set_numa_parameters(
    driver: &Driver,
    domain: &Domain,
    params: &NumaParams,
    affect: Affect,
) -> Result<()> {
    if let Some(nodeset) = params.nodeset.as_ref().filter(|n| n.is_empty()) {
        return Err(Error::operation_invalid(format!(
            "Invalid nodeset of 'numatune': '{}'",
            nodeset
        )));
    }

    let _job = domain.begin_job(JobKind::Modify, driver.config.job_timeout)?;
    let (live, config) = {
        let inner = domain.lock();
        affect.resolve(inner.is_active(), inner.persistent)?
    };

    if live {
        set_numa_live(driver, domain, params)?;
    }

    if config {
        let mut inner = domain.lock();
        let def = edit_persistent(&mut inner, |def| {
            let tune = def.numatune.get_or_insert_with(NumaTune::default);
            tune.mode = params.mode;
            if let Some(nodeset) = &params.nodeset {
                tune.nodeset = Some(nodeset.clone());
                tune.placement = Placement::Static;
            }
        });
        persist::save_config(&driver.config, &def)?;
    }
    Ok(())
}

fn set_numa_live(driver: &Driver, domain: &Domain, params: &NumaParams) -> Result<()> {
    if !driver.config.privileged {
        return Err(Error::operation_unsupported(
            "NUMA tuning is not available in session mode",
        ));
    }
    let (cgroup, mode, online) = {
        let inner = domain.lock();
        let online: Vec<usize> = inner
            .def
            .vcpus
            .iter()
            .enumerate()
            .filter(|(_, v)| v.online)
            .map(|(i, _)| i)
            .collect();
        let mode = inner.def.numatune.as_ref().map(|t| t.mode).unwrap_or_default();
        (cpuset_group(inner.runtime.cgroup.clone()), mode, online)
    };
    let cgroup =
        cgroup.ok_or_else(|| Error::operation_invalid("cgroup cpuset controller is not mounted"))?;

    if params.mode != mode {
        return Err(Error::operation_invalid(
            "can't change numatune mode for running domain",
        ));
    }
    let Some(nodeset) = &params.nodeset else {
        return Ok(());
    };
    if mode != NumaMode::Strict {
        return Err(Error::operation_invalid(
            "change of nodeset for running domain requires strict numa mode",
        ));
    }

    let host_nodes = driver.host.numa_nodes()?;
    if let Some(node) = nodeset.iter().find(|n| !host_nodes.is_set(*n)) {
        return Err(Error::invalid_argument(format!(
            "NUMA node {} is unavailable",
            node
        )));
    }

    let mems = nodeset.format();
    cgroup.thread_group(ThreadGroup::Emulator)?.set_cpuset_mems(&mems)?;
    for vcpu in online {
        cgroup.thread_group(ThreadGroup::Vcpu(vcpu))?.set_cpuset_mems(&mems)?;
    }
    let iothreads = cgroup
        .children()
        .into_iter()
        .filter_map(|name| name.strip_prefix("iothread").and_then(|n| n.parse().ok()));
    for id in iothreads {
        cgroup.thread_group(ThreadGroup::Iothread(id))?.set_cpuset_mems(&mems)?;
    }
    cgroup.set_cpuset_mems(&mems)?;

    let mut inner = domain.lock();
    let tune = inner.def.numatune.get_or_insert_with(NumaTune::default);
    tune.nodeset = Some(nodeset.clone());
    tune.placement = Placement::Static;
    persist::save_status(&driver.config, &inner)?;
    tracing::debug!(domain = %domain.name(), nodes = %mems, "moved domain memory nodes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddMode, DomainDef};
    use crate::error::ErrorKind;
    use crate::process::tests::{privileged_driver, test_driver};
    use std::sync::Arc;

    fn bitmap(s: &str) -> Bitmap {
        Bitmap::parse(s).unwrap()
    }

    fn persistent(driver: &Driver, def: DomainDef) -> Arc<Domain> {
        let (dom, _) = driver.domains.add(def, AddMode::Define).unwrap();
        dom.lock().persistent = true;
        dom
    }

    /// Mark `dom` running under `pid` with known vcpu threads and a cgroup.
    fn running(driver: &Driver, dom: &Domain, pid: i32) -> Option<Cgroup> {
        let cgroup = driver
            .cgroups
            .as_ref()
            .map(|root| root.create_machine("/machine", &format!("ch-{}-vm1", pid)).unwrap());
        let mut inner = dom.lock();
        let max = inner.def.max_vcpus() as i32;
        inner.pid = pid;
        inner.id = pid;
        inner.runtime.vcpu_pids = (1..=max).map(|i| pid + i).collect();
        inner.runtime.cgroup = cgroup.clone();
        cgroup
    }

    fn cgroup_file(group: &Cgroup, file: &str) -> String {
        std::fs::read_to_string(group.dir().join(file)).unwrap()
    }

    #[test]
    fn test_pin_info_falls_back_to_host_cpus() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let mut def = DomainDef::new("vm1", 2, 131072);
        def.vcpus[1].cpumask = Some(bitmap("2-3"));
        let dom = persistent(&driver, def);

        let masks = vcpu_pin_info(&driver, &dom, Affect::Current).unwrap();
        assert_eq!(masks, vec![bitmap("0-3"), bitmap("2-3")]);
        assert_eq!(emulator_pin_info(&driver, &dom, Affect::Current).unwrap(), bitmap("0-3"));

        dom.lock().def.cpumask = Some(bitmap("1"));
        assert_eq!(emulator_pin_info(&driver, &dom, Affect::Config).unwrap(), bitmap("1"));
    }

    #[test]
    fn test_pin_vcpu_config() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 2, 131072));

        pin_vcpu(&driver, &dom, 1, &bitmap("1"), Affect::Config).unwrap();
        let saved = DomainDef::from_json(
            &std::fs::read_to_string(driver.config.config_file("vm1")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.vcpus[1].cpumask, Some(bitmap("1")));

        let err = pin_vcpu(&driver, &dom, 5, &bitmap("1"), Affect::Config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("persistent cpu count 2"), "{}", err);

        let err = pin_vcpu(&driver, &dom, 0, &Bitmap::new(), Affect::Config).unwrap_err();
        assert!(err.to_string().contains("Empty cpu list"), "{}", err);

        let err = pin_vcpu(&driver, &dom, 0, &bitmap("1"), Affect::Live).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationInvalid);
    }

    #[test]
    fn test_pin_vcpu_live_moves_cgroup_and_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, threads) = privileged_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 2, 131072));
        let cgroup = running(&driver, &dom, 1000).unwrap();

        pin_vcpu(&driver, &dom, 1, &bitmap("2"), Affect::Live).unwrap();
        let vcpu1 = cgroup.thread_group(ThreadGroup::Vcpu(1)).unwrap();
        assert_eq!(cgroup_file(&vcpu1, "cpuset.cpus"), "2");
        assert_eq!(threads.calls(), vec!["affinity 1002 2"]);
        assert_eq!(dom.lock().def.vcpus[1].cpumask, Some(bitmap("2")));
        assert!(driver.config.status_file("vm1").exists());
        // persistent config untouched
        assert!(!driver.config.config_file("vm1").exists());

        dom.lock().runtime.vcpu_pids.clear();
        let err = pin_vcpu(&driver, &dom, 0, &bitmap("2"), Affect::Live).unwrap_err();
        assert!(err.to_string().contains("cpu affinity is not supported"), "{}", err);
    }

    #[test]
    fn test_pin_offline_vcpu_only_updates_definition() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, threads) = privileged_driver(dir.path());
        let mut def = DomainDef::new("vm1", 2, 131072);
        def.set_online_vcpus(1);
        let dom = persistent(&driver, def);
        running(&driver, &dom, 1000);

        pin_vcpu(&driver, &dom, 1, &bitmap("3"), Affect::Live).unwrap();
        assert!(threads.calls().is_empty());
        assert_eq!(dom.lock().def.vcpus[1].cpumask, Some(bitmap("3")));
    }

    #[test]
    fn test_pin_emulator_live() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, threads) = privileged_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 1, 131072));
        let cgroup = running(&driver, &dom, 1000).unwrap();

        pin_emulator(&driver, &dom, &bitmap("0-1"), Affect::Both).unwrap();
        let emulator = cgroup.thread_group(ThreadGroup::Emulator).unwrap();
        assert_eq!(cgroup_file(&emulator, "cpuset.cpus"), "0-1");
        assert_eq!(threads.calls(), vec!["affinity 1000 0-1"]);
        assert_eq!(emulator_pin_info(&driver, &dom, Affect::Live).unwrap(), bitmap("0-1"));

        // the running definition and the next-start one both carry the pin
        let inner = dom.lock();
        assert_eq!(inner.def.cputune.emulatorpin, Some(bitmap("0-1")));
        assert_eq!(
            inner.new_def.as_ref().unwrap().cputune.emulatorpin,
            Some(bitmap("0-1"))
        );
    }

    #[test]
    fn test_numa_parameters_report_auto_nodeset() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 1, 131072));

        let params = numa_parameters(&dom, Affect::Current).unwrap();
        assert_eq!(params, NumaParams { mode: NumaMode::Strict, nodeset: None });

        {
            let mut inner = dom.lock();
            inner.def.numatune = Some(NumaTune {
                mode: NumaMode::Strict,
                nodeset: None,
                placement: Placement::Auto,
            });
            inner.id = 1000;
            inner.runtime.auto_nodeset = Some(bitmap("1"));
        }
        let params = numa_parameters(&dom, Affect::Live).unwrap();
        assert_eq!(params.nodeset, Some(bitmap("1")));
    }

    #[test]
    fn test_set_numa_live_moves_every_group() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _) = privileged_driver(dir.path());
        let mut def = DomainDef::new("vm1", 2, 131072);
        def.numatune = Some(NumaTune {
            mode: NumaMode::Strict,
            nodeset: Some(bitmap("0")),
            placement: Placement::Static,
        });
        let dom = persistent(&driver, def);
        let cgroup = running(&driver, &dom, 1000).unwrap();
        let iothread = cgroup.thread_group(ThreadGroup::Iothread(1004)).unwrap();

        let params = NumaParams {
            mode: NumaMode::Strict,
            nodeset: Some(bitmap("1")),
        };
        set_numa_parameters(&driver, &dom, &params, Affect::Live).unwrap();
        let emulator = cgroup.thread_group(ThreadGroup::Emulator).unwrap();
        let vcpu0 = cgroup.thread_group(ThreadGroup::Vcpu(0)).unwrap();
        for group in [&emulator, &vcpu0, &iothread, &cgroup] {
            assert_eq!(group.cpuset_mems().unwrap(), "1", "{}", group.path());
        }
        assert_eq!(numa_parameters(&dom, Affect::Live).unwrap().nodeset, Some(bitmap("1")));

        let err = set_numa_parameters(
            &driver,
            &dom,
            &NumaParams { mode: NumaMode::Interleave, nodeset: None },
            Affect::Live,
        )
        .unwrap_err();
        assert!(err.to_string().contains("can't change numatune mode"), "{}", err);

        let err = set_numa_parameters(
            &driver,
            &dom,
            &NumaParams { mode: NumaMode::Strict, nodeset: Some(bitmap("0,5")) },
            Affect::Live,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = set_numa_parameters(
            &driver,
            &dom,
            &NumaParams { mode: NumaMode::Strict, nodeset: Some(Bitmap::new()) },
            Affect::Live,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid nodeset"), "{}", err);
    }

    #[test]
    fn test_set_numa_live_needs_privileged_driver() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 1, 131072));
        running(&driver, &dom, 1000);

        let params = NumaParams {
            mode: NumaMode::Strict,
            nodeset: Some(bitmap("0")),
        };
        let err = set_numa_parameters(&driver, &dom, &params, Affect::Live).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationUnsupported);
    }

    #[test]
    fn test_set_numa_config() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let dom = persistent(&driver, DomainDef::new("vm1", 1, 131072));

        let params = NumaParams {
            mode: NumaMode::Interleave,
            nodeset: Some(bitmap("0")),
        };
        set_numa_parameters(&driver, &dom, &params, Affect::Config).unwrap();
        let saved = DomainDef::from_json(
            &std::fs::read_to_string(driver.config.config_file("vm1")).unwrap(),
        )
        .unwrap();
        let tune = saved.numatune.unwrap();
        assert_eq!(tune.mode, NumaMode::Interleave);
        assert_eq!(tune.nodeset, Some(bitmap("0")));
    }
}
