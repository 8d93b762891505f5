//! Domain objects and their bookkeeping.
//!
//! This module provides the per-guest record and the pieces around it:
//! - [`DomainDef`]: the guest definition
//! - [`Domain`]: the shared, lock-protected record with its job slot
//! - [`DomainList`]: the driver-wide registry
//! - persistence of status/config documents and the per-domain log

pub mod def;
mod job;
pub mod log;
pub mod persist;
mod registry;
pub mod state;

use crate::bitmap::Bitmap;
use crate::cgroup::Cgroup;
use crate::monitor::Monitor;
use crate::process::watcher::WatcherHandle;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub use def::DomainDef;
pub use job::{Job, JobGuard, JobKind};
pub use registry::{AddMode, DomainList};
pub use state::{DomainState, StateReason};

/// Per-run resources of an active domain.
#[derive(Default)]
pub struct Runtime {
    /// VMM control handle.
    pub monitor: Option<Arc<Monitor>>,
    /// Domain cgroup.
    pub cgroup: Option<Cgroup>,
    /// Machine name anchoring the cgroup.
    pub machine_name: Option<String>,
    /// VMM pidfile.
    pub pidfile: Option<PathBuf>,
    /// Auto-placement CPU set.
    pub auto_cpuset: Option<Bitmap>,
    /// Auto-placement node set.
    pub auto_nodeset: Option<Bitmap>,
    /// Thread id per vcpu index, 0 when unknown.
    pub vcpu_pids: Vec<i32>,
    /// Threads already placed by the binder.
    pub bound_tids: Vec<i32>,
    /// Tap fds per interface index.
    pub tapfds: Vec<Vec<OwnedFd>>,
    /// Thread watcher.
    pub watcher: Option<WatcherHandle>,
}

impl Runtime {
    /// True when at least one vcpu thread id is known.
    pub fn has_vcpu_pids(&self) -> bool {
        self.vcpu_pids.iter().any(|pid| *pid > 0)
    }

    /// Thread id of a vcpu.
    pub fn vcpu_pid(&self, vcpu: usize) -> Option<i32> {
        self.vcpu_pids.get(vcpu).copied().filter(|pid| *pid > 0)
    }
}

/// Mutable part of a domain, guarded by the domain mutex.
pub struct DomainInner {
    /// Active definition.
    pub def: DomainDef,
    /// Persistent definition waiting for the next start.
    pub new_def: Option<DomainDef>,
    /// VMM pid, -1 when inactive.
    pub pid: i32,
    /// Domain id (= pid), -1 when inactive.
    pub id: i32,
    /// Current state.
    pub state: DomainState,
    /// Reason for the current state.
    pub reason: StateReason,
    /// Has a persistent config.
    pub persistent: bool,
    /// Started with the driver.
    pub autostart: bool,
    /// Per-run resources.
    pub runtime: Runtime,
    pub(crate) job: Job,
}

impl DomainInner {
    /// Check if the domain has a running VMM.
    pub fn is_active(&self) -> bool {
        self.id != -1
    }

    /// Set state and reason.
    pub fn set_state(&mut self, state: DomainState, reason: StateReason) {
        tracing::debug!(
            domain = %self.def.name,
            from = %self.state,
            to = %state,
            reason = %reason,
            "state change"
        );
        self.state = state;
        self.reason = reason;
    }

    /// Definition that persists across runs.
    pub fn persistent_def(&self) -> &DomainDef {
        self.new_def.as_ref().unwrap_or(&self.def)
    }
}

/// Shared domain record.
pub struct Domain {
    name: String,
    uuid: Uuid,
    inner: Mutex<DomainInner>,
    job_cond: Condvar,
}

impl Domain {
    /// Create an inactive domain from a definition.
    pub fn new(def: DomainDef) -> Self {
        Self {
            name: def.name.clone(),
            uuid: def.uuid,
            inner: Mutex::new(DomainInner {
                def,
                new_def: None,
                pid: -1,
                id: -1,
                state: DomainState::Shutoff,
                reason: StateReason::Unknown,
                persistent: false,
                autostart: false,
                runtime: Runtime::default(),
                job: Job::default(),
            }),
            job_cond: Condvar::new(),
        }
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Domain UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Lock the mutable part.
    pub fn lock(&self) -> MutexGuard<'_, DomainInner> {
        self.inner.lock()
    }

    /// Check if the domain has a running VMM.
    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    /// Current state and reason.
    pub fn state(&self) -> (DomainState, StateReason) {
        let inner = self.lock();
        (inner.state, inner.reason)
    }

    /// Domain id, -1 when inactive.
    pub fn id(&self) -> i32 {
        self.lock().id
    }

    /// Monitor handle, if active.
    pub fn monitor(&self) -> Option<Arc<Monitor>> {
        self.lock().runtime.monitor.clone()
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_domain_is_inactive() {
        let dom = Domain::new(DomainDef::new("t1", 2, 1024));
        assert_eq!(dom.name(), "t1");
        assert!(!dom.is_active());
        assert_eq!(dom.id(), -1);
        assert_eq!(dom.state(), (DomainState::Shutoff, StateReason::Unknown));
        assert!(dom.monitor().is_none());
    }

    #[test]
    fn test_persistent_def_prefers_pending() {
        let dom = Domain::new(DomainDef::new("t1", 2, 1024));
        let mut inner = dom.lock();
        assert_eq!(inner.persistent_def().max_vcpus(), 2);
        inner.new_def = Some(DomainDef::new("t1", 4, 1024));
        assert_eq!(inner.persistent_def().max_vcpus(), 4);
    }

    #[test]
    fn test_vcpu_pid_lookup() {
        let mut runtime = Runtime::default();
        assert!(!runtime.has_vcpu_pids());
        runtime.vcpu_pids = vec![100, 0];
        assert!(runtime.has_vcpu_pids());
        assert_eq!(runtime.vcpu_pid(0), Some(100));
        assert_eq!(runtime.vcpu_pid(1), None);
        assert_eq!(runtime.vcpu_pid(5), None);
    }
}
