//! vcpu count changes, live and persistent.

use crate::domain::{persist, Domain, DomainDef, DomainInner};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::process::binder::AllNodesGuard;

/// Resize the vcpus of a running domain. The caller holds a modify job.
///
/// The emulator cgroup may allocate on every host node for the duration of
/// the resize; new vcpu threads are bound by the `resized` event.
pub fn set_vcpus_live(driver: &Driver, domain: &Domain, nvcpus: usize) -> Result<()> {
    let (max, current, cgroup, monitor) = {
        let inner = domain.lock();
        if !inner.is_active() {
            return Err(Error::operation_invalid("domain is not running"));
        }
        let monitor = inner
            .runtime
            .monitor
            .clone()
            .ok_or_else(|| Error::internal("domain has no monitor"))?;
        (
            inner.def.max_vcpus(),
            inner.def.online_vcpus(),
            inner.runtime.cgroup.clone(),
            monitor,
        )
    };

    if nvcpus < 1 || nvcpus > max {
        return Err(Error::invalid_argument(format!(
            "requested vcpus is greater than max allowable vcpus for the live domain: {} > {}",
            nvcpus, max
        )));
    }

    let _nodes = AllNodesGuard::allow(cgroup.as_ref(), &driver.host)?;
    tracing::debug!(domain = %domain.name(), from = current, to = nvcpus, "resizing vcpus");
    monitor.resize(nvcpus)?;

    let mut inner = domain.lock();
    inner.def.set_online_vcpus(nvcpus);
    persist::save_status(&driver.config, &inner)
}

/// Change the online vcpu count of the persistent definition.
pub fn set_vcpus_config(driver: &Driver, domain: &Domain, nvcpus: usize) -> Result<()> {
    let mut inner = domain.lock();
    require_persistent(&inner)?;
    let max = inner.persistent_def().max_vcpus();
    if nvcpus < 1 || nvcpus > max {
        return Err(Error::invalid_argument(format!(
            "requested vcpus is greater than max allowable vcpus for the persistent domain: {} > {}",
            nvcpus, max
        )));
    }
    let def = edit_persistent(&mut inner, |def| def.set_online_vcpus(nvcpus));
    persist::save_config(&driver.config, &def)
}

/// Change the maximum vcpu count. Only the persistent definition can be
/// changed; online vcpus beyond the new maximum are dropped.
pub fn set_max_vcpus(driver: &Driver, domain: &Domain, nvcpus: usize, live: bool) -> Result<()> {
    if live {
        return Err(Error::operation_unsupported(
            "maximum vcpu count of a live domain can't be modified",
        ));
    }
    if nvcpus == 0 {
        return Err(Error::invalid_argument("maximum vcpu count must be at least 1"));
    }
    let mut inner = domain.lock();
    require_persistent(&inner)?;
    let def = edit_persistent(&mut inner, |def| {
        def.set_max_vcpus(nvcpus);
        if def.online_vcpus() == 0 {
            def.set_online_vcpus(1);
        }
    });
    persist::save_config(&driver.config, &def)
}

fn require_persistent(inner: &DomainInner) -> Result<()> {
    if !inner.persistent {
        return Err(Error::operation_invalid(
            "cannot change persistent config of a transient domain",
        ));
    }
    Ok(())
}

/// Apply `edit` to the definition used by the next start and return it.
pub(crate) fn edit_persistent(inner: &mut DomainInner, edit: impl FnOnce(&mut DomainDef)) -> DomainDef {
    if inner.is_active() {
        let mut next = inner.persistent_def().clone();
        edit(&mut next);
        inner.new_def = Some(next.clone());
        next
    } else {
        edit(&mut inner.def);
        inner.def.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AddMode, StateReason};
    use crate::error::ErrorKind;
    use crate::process::tests::{attach, test_driver, FakeVmm};
    use crate::process::stop;

    #[test]
    fn test_live_resize_updates_online_vcpus() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let mut def = DomainDef::new("vm1", 4, 131072);
        def.set_online_vcpus(2);
        let (dom, _) = driver.domains.add(def, AddMode::Live).unwrap();
        let mut vmm = FakeVmm::start(&driver.config, "vm1");
        attach(&driver, &dom, &vmm);

        set_vcpus_live(&driver, &dom, 3).unwrap();
        assert_eq!(dom.lock().def.online_vcpus(), 3);
        assert!(dom.lock().def.vcpus[2].online);
        assert!(!dom.lock().def.vcpus[3].online);

        let seen = vmm.api.seen.lock().clone();
        let resize = seen.iter().find(|s| s.path == "/api/v1/vm.resize").unwrap();
        assert_eq!(resize.method, "PUT");
        assert_eq!(resize.body, r#"{"desired_vcpus":3}"#);
        assert!(driver.config.status_file("vm1").exists());

        stop(&driver, &dom, StateReason::Destroyed);
        let _ = vmm.child.wait();
    }

    #[test]
    fn test_live_resize_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (dom, _) = driver
            .domains
            .add(DomainDef::new("vm1", 2, 131072), AddMode::Live)
            .unwrap();
        let mut vmm = FakeVmm::start(&driver.config, "vm1");
        attach(&driver, &dom, &vmm);

        for n in [0, 3] {
            let err = set_vcpus_live(&driver, &dom, n).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        let err = set_vcpus_live(&driver, &dom, 3).unwrap_err();
        assert!(err.to_string().contains("3 > 2"), "{}", err);
        assert!(!vmm.api.paths().iter().any(|p| p.ends_with("vm.resize")));

        stop(&driver, &dom, StateReason::Destroyed);
        let _ = vmm.child.wait();
    }

    #[test]
    fn test_live_resize_requires_running_domain() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (dom, _) = driver
            .domains
            .add(DomainDef::new("vm1", 2, 131072), AddMode::Define)
            .unwrap();
        let err = set_vcpus_live(&driver, &dom, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationInvalid);
    }

    #[test]
    fn test_config_changes_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (dom, _) = driver
            .domains
            .add(DomainDef::new("vm1", 2, 131072), AddMode::Define)
            .unwrap();
        dom.lock().persistent = true;

        set_max_vcpus(&driver, &dom, 8, false).unwrap();
        set_vcpus_config(&driver, &dom, 6).unwrap();
        let saved = std::fs::read_to_string(driver.config.config_file("vm1")).unwrap();
        let def: DomainDef = serde_json::from_str(&saved).unwrap();
        assert_eq!(def.max_vcpus(), 8);
        assert_eq!(def.online_vcpus(), 6);

        set_max_vcpus(&driver, &dom, 4, false).unwrap();
        assert_eq!(dom.lock().def.online_vcpus(), 4);

        assert_eq!(
            set_max_vcpus(&driver, &dom, 4, true).unwrap_err().kind(),
            ErrorKind::OperationUnsupported
        );
        assert_eq!(
            set_vcpus_config(&driver, &dom, 5).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_edit_persistent_on_active_domain_goes_to_next_def() {
        let dom = Domain::new(DomainDef::new("vm1", 2, 131072));
        let mut inner = dom.lock();
        inner.id = 10;
        let next = edit_persistent(&mut inner, |def| def.set_max_vcpus(4));
        assert_eq!(next.max_vcpus(), 4);
        assert_eq!(inner.def.max_vcpus(), 2);
        assert_eq!(inner.new_def.as_ref().unwrap().max_vcpus(), 4);
    }
}
