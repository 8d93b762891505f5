//! Driver-wide domain registry.
//!
//! Lock order is always registry first, then a domain's own mutex.

use super::{Domain, DomainDef};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How a definition enters the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// `define`: becomes the persistent definition.
    Define,
    /// `create`: becomes the live definition; refused if already active.
    Live,
}

/// Registry of all known domains, keyed by name.
#[derive(Default)]
pub struct DomainList {
    domains: RwLock<HashMap<String, Arc<Domain>>>,
}

impl DomainList {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a domain.
    ///
    /// Returns the domain and the definition it replaced, if any.
    pub fn add(&self, def: DomainDef, mode: AddMode) -> Result<(Arc<Domain>, Option<DomainDef>)> {
        let mut domains = self.domains.write();

        if let Some(other) = domains
            .values()
            .find(|d| d.uuid() == def.uuid && d.name() != def.name)
        {
            return Err(Error::operation_invalid(format!(
                "domain '{}' is already defined with uuid {}",
                other.name(),
                def.uuid
            )));
        }

        let existing = match domains.get(&def.name) {
            Some(dom) => Arc::clone(dom),
            None => {
                let dom = Arc::new(Domain::new(def));
                domains.insert(dom.name().to_string(), Arc::clone(&dom));
                return Ok((dom, None));
            }
        };

        if existing.uuid() != def.uuid {
            return Err(Error::operation_invalid(format!(
                "domain '{}' already exists with uuid {}",
                existing.name(),
                existing.uuid()
            )));
        }

        let old = {
            let mut inner = existing.lock();
            match mode {
                AddMode::Live => {
                    if inner.is_active() {
                        return Err(Error::operation_invalid(format!(
                            "domain '{}' is already active",
                            def.name
                        )));
                    }
                    // the persistent definition comes back after shutoff
                    if inner.persistent && inner.new_def.is_none() {
                        inner.new_def = Some(inner.def.clone());
                    }
                    Some(std::mem::replace(&mut inner.def, def))
                }
                AddMode::Define => {
                    if inner.is_active() {
                        inner.new_def.replace(def)
                    } else {
                        Some(std::mem::replace(&mut inner.def, def))
                    }
                }
            }
        };

        Ok((existing, old))
    }

    /// Insert an already-built domain object (used when loading state).
    pub fn insert(&self, dom: Arc<Domain>) -> Result<()> {
        let mut domains = self.domains.write();
        if domains.contains_key(dom.name()) {
            return Err(Error::operation_invalid(format!(
                "domain '{}' already exists",
                dom.name()
            )));
        }
        domains.insert(dom.name().to_string(), dom);
        Ok(())
    }

    /// Remove a domain.
    pub fn remove(&self, dom: &Domain) {
        let mut domains = self.domains.write();
        if domains
            .get(dom.name())
            .is_some_and(|d| std::ptr::eq(d.as_ref(), dom))
        {
            domains.remove(dom.name());
            tracing::debug!(domain = %dom.name(), "removed from registry");
        }
    }

    /// Find by name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.read().get(name).cloned()
    }

    /// Find by UUID.
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Domain>> {
        self.domains
            .read()
            .values()
            .find(|d| d.uuid() == *uuid)
            .cloned()
    }

    /// Find an active domain by id.
    pub fn find_by_id(&self, id: i32) -> Option<Arc<Domain>> {
        if id < 0 {
            return None;
        }
        self.domains
            .read()
            .values()
            .find(|d| d.id() == id)
            .cloned()
    }

    /// Snapshot of all domains, sorted by name.
    pub fn list(&self) -> Vec<Arc<Domain>> {
        let mut all: Vec<_> = self.domains.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of active domains.
    pub fn count_active(&self) -> usize {
        self.domains.read().values().filter(|d| d.is_active()).count()
    }

    /// Number of domains.
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    /// True when the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
