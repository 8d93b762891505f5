//! Driver-wide state and the capability interface.
//!
//! [`Driver`] owns everything shared between domains: configuration, the
//! registry, host topology, the cgroup root, and the host seams used for
//! thread placement and networking. [`ChDriver`] is the handle callers use.

mod api;
mod tuning;
pub mod version;

pub use api::{Affect, ChDriver, DomainInfo, DomainRef, Feature, HypervisorDriver, ListFilter};
pub use tuning::NumaParams;

use crate::cgroup::CgroupRoot;
use crate::config::DriverConfig;
use crate::domain::{persist, AddMode, DomainList};
use crate::error::Result;
use crate::host::{HostTopology, SYSFS_ROOT};
use crate::hostdev::HostdevManager;
use crate::monitor::launcher;
use crate::monitor::threads::{ThreadScanner, PROC_ROOT};
use crate::network::{NetBackend, SystemNet};
use crate::process::{SystemThreads, ThreadControl};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Host facilities the driver works against.
pub struct HostEnv {
    /// sysfs mount.
    pub sysfs: PathBuf,
    /// procfs mount.
    pub proc_root: PathBuf,
    /// devfs mount.
    pub dev_root: PathBuf,
    /// Affinity and scheduler calls.
    pub threads: Box<dyn ThreadControl>,
    /// Host network operations.
    pub net: Box<dyn NetBackend>,
}

impl HostEnv {
    /// The real host.
    pub fn system() -> Self {
        Self {
            sysfs: PathBuf::from(SYSFS_ROOT),
            proc_root: PathBuf::from(PROC_ROOT),
            dev_root: PathBuf::from("/dev"),
            threads: Box::new(SystemThreads),
            net: Box::new(SystemNet::new(SYSFS_ROOT)),
        }
    }
}

/// State shared by every domain of one driver instance.
pub struct Driver {
    pub(crate) config: DriverConfig,
    pub(crate) domains: DomainList,
    pub(crate) host: HostTopology,
    pub(crate) cgroups: Option<CgroupRoot>,
    pub(crate) scanner: ThreadScanner,
    pub(crate) threads: Box<dyn ThreadControl>,
    pub(crate) hostdevs: HostdevManager,
    pub(crate) net: Box<dyn NetBackend>,
    version: OnceLock<u64>,
}

impl Driver {
    /// Driver on the real host.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_env(config, HostEnv::system())
    }

    /// Driver on an explicit host environment.
    ///
    /// cgroups are only used by privileged drivers on hosts that expose at
    /// least one usable controller.
    pub fn with_env(config: DriverConfig, env: HostEnv) -> Self {
        let cgroups = if config.privileged {
            let root = CgroupRoot::new(&config.cgroup_root, &config.cgroup_controllers, &env.proc_root);
            if root.is_available() {
                Some(root)
            } else {
                tracing::warn!(mount = %config.cgroup_root.display(), "no usable cgroup controllers");
                None
            }
        } else {
            None
        };

        Self {
            domains: DomainList::new(),
            host: HostTopology::new(&env.sysfs),
            cgroups,
            scanner: ThreadScanner::new(&env.proc_root),
            threads: env.threads,
            hostdevs: HostdevManager::new(&env.sysfs, &env.dev_root),
            net: env.net,
            version: OnceLock::new(),
            config,
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Domain registry.
    pub fn domains(&self) -> &DomainList {
        &self.domains
    }

    /// Host topology.
    pub fn host(&self) -> &HostTopology {
        &self.host
    }

    /// Load status documents, then persistent configs.
    ///
    /// Domains found in both keep their live definition; the config becomes
    /// the definition for the next start when it differs.
    pub fn load_state(&self) -> Result<()> {
        for doc in persist::load_all_status(&self.config)? {
            let dom = Arc::new(doc.into_domain());
            tracing::debug!(domain = %dom.name(), pid = dom.lock().pid, "loaded status");
            if let Err(e) = self.domains.insert(dom) {
                tracing::warn!(error = %e, "ignoring duplicate status document");
            }
        }

        for (def, autostart) in persist::load_all_configs(&self.config)? {
            let name = def.name.clone();
            match self.domains.find_by_name(&name) {
                Some(dom) => {
                    let mut inner = dom.lock();
                    if inner.def != def {
                        inner.new_def = Some(def);
                    }
                    inner.persistent = true;
                    inner.autostart = autostart;
                }
                None => match self.domains.add(def, AddMode::Define) {
                    Ok((dom, _)) => {
                        let mut inner = dom.lock();
                        inner.persistent = true;
                        inner.autostart = autostart;
                    }
                    Err(e) => tracing::warn!(domain = %name, error = %e, "ignoring config"),
                },
            }
        }

        tracing::info!(domains = self.domains.len(), "driver state loaded");
        Ok(())
    }

    /// VMM version, detected once.
    pub fn version(&self) -> Result<u64> {
        if let Some(v) = self.version.get() {
            return Ok(*v);
        }
        let binary = launcher::resolve_emulator(None, &self.config.emulator)?;
        let v = version::detect(&binary)?;
        Ok(*self.version.get_or_init(|| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainDef, DomainState, StateReason};
    use crate::process::tests::test_driver;

    #[test]
    fn test_load_state_merges_status_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());

        // a running transient domain and a stopped persistent one
        let live = crate::domain::Domain::new(DomainDef::new("live", 2, 131072));
        {
            let mut inner = live.lock();
            inner.pid = 4242;
            inner.set_state(DomainState::Running, StateReason::Booted);
            persist::save_status(&driver.config, &inner).unwrap();
        }
        let stored = DomainDef::new("stored", 1, 131072);
        persist::save_config(&driver.config, &stored).unwrap();
        persist::set_autostart(&driver.config, "stored", true).unwrap();

        // config of the running domain with a pending change
        let mut pending = live.lock().def.clone();
        pending.set_max_vcpus(4);
        persist::save_config(&driver.config, &pending).unwrap();

        driver.load_state().unwrap();
        assert_eq!(driver.domains.len(), 2);

        let dom = driver.domains.find_by_name("live").unwrap();
        let inner = dom.lock();
        assert_eq!(inner.pid, 4242);
        assert!(inner.persistent);
        assert_eq!(inner.def.max_vcpus(), 2);
        assert_eq!(inner.persistent_def().max_vcpus(), 4);
        drop(inner);

        let dom = driver.domains.find_by_name("stored").unwrap();
        let inner = dom.lock();
        assert!(inner.persistent);
        assert!(inner.autostart);
        assert_eq!(inner.pid, -1);
        assert_eq!(inner.def, stored);
    }

    #[test]
    fn test_session_driver_has_no_cgroups() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        assert!(driver.cgroups.is_none());
        assert_eq!(driver.config().uri(), "ch:///session");
    }
}
