//! The capability interface and its Cloud-Hypervisor implementation.

use super::tuning::{self, NumaParams};
use super::Driver;
use crate::bitmap::Bitmap;
use crate::config::DriverConfig;
use crate::domain::def::{ChrType, DomainDef};
use crate::domain::{persist, AddMode, Domain, DomainState, JobKind, StateReason};
use crate::error::{Error, Result};
use crate::host::NodeInfo;
use crate::hotplug;
use crate::monitor::body::check_supported_devices;
use crate::process;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Public identity of a domain, as handed out by lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRef {
    /// Domain name.
    pub name: String,
    /// Domain UUID.
    pub uuid: Uuid,
    /// Domain id, -1 when inactive.
    pub id: i32,
}

impl DomainRef {
    fn of(dom: &Domain) -> Self {
        Self {
            name: dom.name().to_string(),
            uuid: dom.uuid(),
            id: dom.id(),
        }
    }
}

/// Summary returned by [`HypervisorDriver::get_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainInfo {
    /// Current state.
    pub state: DomainState,
    /// Reason for the state.
    pub reason: StateReason,
    /// Maximum memory in KiB.
    pub max_mem_kib: u64,
    /// Current memory in KiB.
    pub memory_kib: u64,
    /// Online vcpus.
    pub nr_virt_cpu: usize,
    /// CPU time in ns; not tracked.
    pub cpu_time: u64,
}

/// Which definition an operation affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affect {
    /// Live when running, persistent otherwise.
    #[default]
    Current,
    /// Only the running domain.
    Live,
    /// Only the persistent definition.
    Config,
    /// Both.
    Both,
}

impl Affect {
    /// Resolve to `(live, config)` for a domain.
    pub(crate) fn resolve(self, active: bool, persistent: bool) -> Result<(bool, bool)> {
        let (live, config) = match self {
            Affect::Current => (active, !active),
            Affect::Live => (true, false),
            Affect::Config => (false, true),
            Affect::Both => (true, true),
        };
        if live && !active {
            return Err(Error::operation_invalid("domain is not running"));
        }
        if config && !persistent {
            return Err(Error::operation_invalid(
                "transient domains do not have any persistent config",
            ));
        }
        Ok((live, config))
    }
}

/// Domain list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    /// Every domain.
    #[default]
    All,
    /// Running domains.
    Active,
    /// Defined, not running.
    Inactive,
}

/// Optional driver features callers may ask about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Typed parameters may carry strings.
    TypedParamString,
    /// Migration protocol version 1.
    MigrationV1,
    /// Migration protocol version 2.
    MigrationV2,
    /// Migration protocol version 3.
    MigrationV3,
    /// Peer-to-peer migration.
    MigrationP2p,
    /// Offline migration.
    MigrationOffline,
    /// Migration with typed parameters.
    MigrationParams,
    /// Direct migration.
    MigrationDirect,
    /// Migration change protection.
    MigrateChangeProtection,
    /// Migratable definition export.
    XmlMigratable,
    /// File descriptor passing.
    FdPassing,
    /// Remote transport.
    Remote,
}

/// Operations a virtualization daemon needs from a hypervisor driver.
pub trait HypervisorDriver: Send + Sync {
    /// Connection URI served by this driver.
    fn uri(&self) -> &'static str;

    /// Hypervisor type name.
    fn type_name(&self) -> &'static str;

    /// Encoded hypervisor version.
    fn version(&self) -> Result<u64>;

    /// Host name.
    fn hostname(&self) -> Result<String>;

    /// Host CPU and memory summary.
    fn node_info(&self) -> Result<NodeInfo>;

    /// Online host CPUs.
    fn node_cpu_map(&self) -> Result<Bitmap>;

    /// Whether an optional feature is available.
    fn supports_feature(&self, feature: Feature) -> bool;

    /// Number of running domains.
    fn num_of_domains(&self) -> usize;

    /// Domains matching `filter`, sorted by name.
    fn list_domains(&self, filter: ListFilter) -> Vec<DomainRef>;

    /// Find a running domain by id.
    fn lookup_by_id(&self, id: i32) -> Result<DomainRef>;

    /// Find a domain by UUID.
    fn lookup_by_uuid(&self, uuid: &Uuid) -> Result<DomainRef>;

    /// Find a domain by name.
    fn lookup_by_name(&self, name: &str) -> Result<DomainRef>;

    /// Define or update a persistent domain.
    fn define(&self, def: DomainDef) -> Result<DomainRef>;

    /// Remove the persistent definition.
    fn undefine(&self, dom: &DomainRef) -> Result<()>;

    /// Create and start a domain from a definition.
    fn create(&self, def: DomainDef) -> Result<DomainRef>;

    /// Start a defined domain.
    fn start(&self, dom: &DomainRef) -> Result<()>;

    /// Ask the guest to shut down.
    fn shutdown(&self, dom: &DomainRef) -> Result<()>;

    /// Reboot the guest.
    fn reboot(&self, dom: &DomainRef) -> Result<()>;

    /// Pause the guest.
    fn suspend(&self, dom: &DomainRef) -> Result<()>;

    /// Resume the guest.
    fn resume(&self, dom: &DomainRef) -> Result<()>;

    /// Kill the VMM.
    fn destroy(&self, dom: &DomainRef) -> Result<()>;

    /// State and reason.
    fn get_state(&self, dom: &DomainRef) -> Result<(DomainState, StateReason)>;

    /// State, memory and vcpu summary.
    fn get_info(&self, dom: &DomainRef) -> Result<DomainInfo>;

    /// Live definition, or the persistent one when `inactive`.
    fn get_def(&self, dom: &DomainRef, inactive: bool) -> Result<DomainDef>;

    /// Autostart flag.
    fn get_autostart(&self, dom: &DomainRef) -> Result<bool>;

    /// Set the autostart flag.
    fn set_autostart(&self, dom: &DomainRef, enable: bool) -> Result<()>;

    /// vcpu count, or the maximum.
    fn get_vcpus(&self, dom: &DomainRef, affect: Affect, maximum: bool) -> Result<usize>;

    /// Change the vcpu count, or the maximum.
    fn set_vcpus(&self, dom: &DomainRef, nvcpus: usize, affect: Affect, maximum: bool) -> Result<()>;

    /// Effective pinning of every vcpu.
    fn vcpu_pin_info(&self, dom: &DomainRef, affect: Affect) -> Result<Vec<Bitmap>>;

    /// Pin one vcpu.
    fn pin_vcpu(&self, dom: &DomainRef, vcpu: usize, cpus: &Bitmap, affect: Affect) -> Result<()>;

    /// Effective emulator pinning.
    fn emulator_pin_info(&self, dom: &DomainRef, affect: Affect) -> Result<Bitmap>;

    /// Pin the emulator threads.
    fn pin_emulator(&self, dom: &DomainRef, cpus: &Bitmap, affect: Affect) -> Result<()>;

    /// NUMA mode and nodeset.
    fn numa_parameters(&self, dom: &DomainRef, affect: Affect) -> Result<NumaParams>;

    /// Change NUMA mode or nodeset.
    fn set_numa_parameters(&self, dom: &DomainRef, params: &NumaParams, affect: Affect) -> Result<()>;

    /// PTY path of a console or serial device.
    fn console_path(&self, dom: &DomainRef, dev_name: Option<&str>) -> Result<PathBuf>;
}

static ACTIVE: Mutex<Option<Arc<Driver>>> = parking_lot::const_mutex(None);

/// Connection handle onto the Cloud-Hypervisor driver.
#[derive(Clone)]
pub struct ChDriver {
    inner: Arc<Driver>,
}

impl ChDriver {
    /// Wrap an existing driver without registering it.
    pub fn new(inner: Arc<Driver>) -> Self {
        Self { inner }
    }

    /// Bring the driver up: query the VMM version, load state, reconnect to
    /// running VMMs and optionally autostart domains. The driver becomes
    /// the instance [`ChDriver::open`] connects to.
    pub fn initialize(config: DriverConfig, autostart: bool) -> Result<Self> {
        config.ensure_dirs()?;
        let driver = Arc::new(Driver::new(config));
        driver.version()?;
        Self::register(driver, autostart)
    }

    /// Register an already-built driver as the active instance.
    pub fn register(driver: Arc<Driver>, autostart: bool) -> Result<Self> {
        driver.load_state()?;
        if autostart {
            process::reconnect::reconnect_and_autostart(&driver);
        } else {
            for handle in process::reconnect::reconnect_all(&driver) {
                if handle.join().is_err() {
                    tracing::warn!("reconnect thread panicked");
                }
            }
        }
        *ACTIVE.lock() = Some(Arc::clone(&driver));
        tracing::info!(uri = driver.config.uri(), "driver initialized");
        Ok(Self::new(driver))
    }

    /// Connect to the active driver.
    ///
    /// `uri` must be the driver's own URI when given.
    pub fn open(uri: Option<&str>) -> Result<Self> {
        let driver = ACTIVE
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("Cloud-Hypervisor state driver is not active"))?;
        if let Some(uri) = uri {
            if uri != driver.config.uri() {
                return Err(Error::invalid_argument(format!(
                    "unexpected URI '{}', this driver serves '{}'",
                    uri,
                    driver.config.uri()
                )));
            }
        }
        Ok(Self::new(driver))
    }

    /// Drop the active driver instance.
    pub fn cleanup() {
        if ACTIVE.lock().take().is_some() {
            tracing::debug!("driver cleaned up");
        }
    }

    /// The shared driver state.
    pub fn driver(&self) -> &Arc<Driver> {
        &self.inner
    }

    fn domain(&self, dom: &DomainRef) -> Result<Arc<Domain>> {
        self.inner
            .domains
            .find_by_uuid(&dom.uuid)
            .ok_or_else(|| Error::NoDomain {
                key: "uuid",
                value: dom.uuid.to_string(),
            })
    }
}

impl HypervisorDriver for ChDriver {
    fn uri(&self) -> &'static str {
        self.inner.config.uri()
    }

    fn type_name(&self) -> &'static str {
        "CH"
    }

    fn version(&self) -> Result<u64> {
        self.inner.version()
    }

    fn hostname(&self) -> Result<String> {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    fn node_info(&self) -> Result<NodeInfo> {
        let meminfo = self.inner.scanner.proc_root().join("meminfo");
        self.inner.host.node_info(&meminfo)
    }

    fn node_cpu_map(&self) -> Result<Bitmap> {
        self.inner.host.online_cpus()
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::TypedParamString)
    }

    fn num_of_domains(&self) -> usize {
        self.inner.domains.count_active()
    }

    fn list_domains(&self, filter: ListFilter) -> Vec<DomainRef> {
        let mut refs: Vec<DomainRef> = self
            .inner
            .domains
            .list()
            .iter()
            .filter(|dom| match filter {
                ListFilter::All => true,
                ListFilter::Active => dom.is_active(),
                ListFilter::Inactive => !dom.is_active(),
            })
            .map(|dom| DomainRef::of(dom))
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        refs
    }

    fn lookup_by_id(&self, id: i32) -> Result<DomainRef> {
        self.inner
            .domains
            .find_by_id(id)
            .map(|dom| DomainRef::of(&dom))
            .ok_or_else(|| Error::NoDomain {
                key: "id",
                value: id.to_string(),
            })
    }

    fn lookup_by_uuid(&self, uuid: &Uuid) -> Result<DomainRef> {
        self.inner
            .domains
            .find_by_uuid(uuid)
            .map(|dom| DomainRef::of(&dom))
            .ok_or_else(|| Error::NoDomain {
                key: "uuid",
                value: uuid.to_string(),
            })
    }

    fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        self.inner
            .domains
            .find_by_name(name)
            .map(|dom| DomainRef::of(&dom))
            .ok_or_else(|| Error::no_domain_name(name))
    }

    fn define(&self, def: DomainDef) -> Result<DomainRef> {
        def.validate()?;
        check_supported_devices(&def)?;
        let config = &self.inner.config;

        let (dom, old) = self.inner.domains.add(def.clone(), AddMode::Define)?;
        let was_persistent = std::mem::replace(&mut dom.lock().persistent, true);

        if let Err(e) = persist::save_config(config, &def) {
            let mut inner = dom.lock();
            inner.persistent = was_persistent;
            let removable = old.is_none() && !inner.is_active();
            drop(inner);
            if removable {
                self.inner.domains.remove(&dom);
            }
            return Err(e);
        }

        let event = if old.is_some() { "updated" } else { "added" };
        tracing::info!(domain = %def.name, event, "domain defined");
        Ok(DomainRef::of(&dom))
    }

    fn undefine(&self, dom: &DomainRef) -> Result<()> {
        let domain = self.domain(dom)?;
        let config = &self.inner.config;
        {
            let mut inner = domain.lock();
            if !inner.persistent {
                return Err(Error::operation_invalid("cannot undefine transient domain"));
            }
            persist::delete_config(config, domain.name())?;
            persist::set_autostart(config, domain.name(), false)?;
            inner.autostart = false;
            inner.persistent = false;
            inner.new_def = None;
        }
        // an active domain stays until it stops, then goes as transient
        process::remove_if_transient(&self.inner, &domain);
        tracing::info!(domain = %dom.name, "domain undefined");
        Ok(())
    }

    fn create(&self, def: DomainDef) -> Result<DomainRef> {
        def.validate()?;
        check_supported_devices(&def)?;
        let (domain, _) = self.inner.domains.add(def, AddMode::Live)?;

        let result = domain
            .begin_job(JobKind::Modify, self.inner.config.job_timeout)
            .and_then(|_job| process::start(&self.inner, &domain, StateReason::Booted));
        if let Err(e) = result {
            process::remove_if_transient(&self.inner, &domain);
            return Err(e);
        }
        Ok(DomainRef::of(&domain))
    }

    fn start(&self, dom: &DomainRef) -> Result<()> {
        let domain = self.domain(dom)?;
        let _job = domain.begin_job(JobKind::Modify, self.inner.config.job_timeout)?;
        process::start(&self.inner, &domain, StateReason::Booted)
    }

    fn shutdown(&self, dom: &DomainRef) -> Result<()> {
        process::shutdown(&self.inner, &*self.domain(dom)?)
    }

    fn reboot(&self, dom: &DomainRef) -> Result<()> {
        process::reboot(&self.inner, &*self.domain(dom)?)
    }

    fn suspend(&self, dom: &DomainRef) -> Result<()> {
        process::suspend(&self.inner, &*self.domain(dom)?)
    }

    fn resume(&self, dom: &DomainRef) -> Result<()> {
        process::resume(&self.inner, &*self.domain(dom)?)
    }

    fn destroy(&self, dom: &DomainRef) -> Result<()> {
        process::destroy(&self.inner, &*self.domain(dom)?)
    }

    fn get_state(&self, dom: &DomainRef) -> Result<(DomainState, StateReason)> {
        Ok(self.domain(dom)?.state())
    }

    fn get_info(&self, dom: &DomainRef) -> Result<DomainInfo> {
        let domain = self.domain(dom)?;
        let inner = domain.lock();
        Ok(DomainInfo {
            state: inner.state,
            reason: inner.reason,
            max_mem_kib: inner.def.memory_kib,
            memory_kib: inner.def.memory_kib,
            nr_virt_cpu: inner.def.online_vcpus(),
            cpu_time: 0,
        })
    }

    fn get_def(&self, dom: &DomainRef, inactive: bool) -> Result<DomainDef> {
        let domain = self.domain(dom)?;
        let inner = domain.lock();
        Ok(if inactive {
            inner.persistent_def().clone()
        } else {
            inner.def.clone()
        })
    }

    fn get_autostart(&self, dom: &DomainRef) -> Result<bool> {
        Ok(self.domain(dom)?.lock().autostart)
    }

    fn set_autostart(&self, dom: &DomainRef, enable: bool) -> Result<()> {
        let domain = self.domain(dom)?;
        {
            let inner = domain.lock();
            if !inner.persistent {
                return Err(Error::operation_invalid(
                    "cannot set autostart for transient domain",
                ));
            }
            if inner.autostart == enable {
                return Ok(());
            }
        }
        let _job = domain.begin_job(JobKind::Modify, self.inner.config.job_timeout)?;
        persist::set_autostart(&self.inner.config, domain.name(), enable)?;
        domain.lock().autostart = enable;
        tracing::debug!(domain = %dom.name, enable, "autostart changed");
        Ok(())
    }

    fn get_vcpus(&self, dom: &DomainRef, affect: Affect, maximum: bool) -> Result<usize> {
        let domain = self.domain(dom)?;
        let inner = domain.lock();
        let (live, _) = affect.resolve(inner.is_active(), inner.persistent)?;
        let def = if live { &inner.def } else { inner.persistent_def() };
        Ok(if maximum {
            def.max_vcpus()
        } else {
            def.online_vcpus()
        })
    }

    fn set_vcpus(&self, dom: &DomainRef, nvcpus: usize, affect: Affect, maximum: bool) -> Result<()> {
        let domain = self.domain(dom)?;
        let _job = domain.begin_job(JobKind::Modify, self.inner.config.job_timeout)?;
        let (live, config) = {
            let inner = domain.lock();
            affect.resolve(inner.is_active(), inner.persistent)?
        };

        if maximum {
            return hotplug::set_max_vcpus(&self.inner, &domain, nvcpus, live);
        }
        if live {
            hotplug::set_vcpus_live(&self.inner, &domain, nvcpus)?;
        }
        if config {
            hotplug::set_vcpus_config(&self.inner, &domain, nvcpus)?;
        }
        Ok(())
    }

    fn vcpu_pin_info(&self, dom: &DomainRef, affect: Affect) -> Result<Vec<Bitmap>> {
        tuning::vcpu_pin_info(&self.inner, &*self.domain(dom)?, affect)
    }

    fn pin_vcpu(&self, dom: &DomainRef, vcpu: usize, cpus: &Bitmap, affect: Affect) -> Result<()> {
        tuning::pin_vcpu(&self.inner, &*self.domain(dom)?, vcpu, cpus, affect)
    }

    fn emulator_pin_info(&self, dom: &DomainRef, affect: Affect) -> Result<Bitmap> {
        tuning::emulator_pin_info(&self.inner, &*self.domain(dom)?, affect)
    }

    fn pin_emulator(&self, dom: &DomainRef, cpus: &Bitmap, affect: Affect) -> Result<()> {
        tuning::pin_emulator(&self.inner, &*self.domain(dom)?, cpus, affect)
    }

    fn numa_parameters(&self, dom: &DomainRef, affect: Affect) -> Result<NumaParams> {
        tuning::numa_parameters(&*self.domain(dom)?, affect)
    }

    fn set_numa_parameters(&self, dom: &DomainRef, params: &NumaParams, affect: Affect) -> Result<()> {
        tuning::set_numa_parameters(&self.inner, &*self.domain(dom)?, params, affect)
    }

    fn console_path(&self, dom: &DomainRef, dev_name: Option<&str>) -> Result<PathBuf> {
        let domain = self.domain(dom)?;
        let inner = domain.lock();
        if !inner.is_active() {
            return Err(Error::operation_invalid("domain is not running"));
        }
        let def = &inner.def;
        let chr = match dev_name {
            Some(name) => def
                .consoles
                .iter()
                .chain(def.serials.iter())
                .find(|c| c.alias.as_deref() == Some(name)),
            None => def
                .consoles
                .first()
                .filter(|c| c.chr_type == ChrType::Pty)
                .or_else(|| def.serials.first()),
        };
        let label = dev_name.unwrap_or("(default)");
        let chr = chr.ok_or_else(|| {
            Error::internal(format!("cannot find character device {}", label))
        })?;
        if chr.chr_type != ChrType::Pty {
            return Err(Error::internal(format!(
                "character device {} is not using a PTY",
                label
            )));
        }
        chr.path
            .clone()
            .ok_or_else(|| Error::internal(format!("character device {} has no PTY yet", label)))
    }
}
