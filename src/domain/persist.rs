//! On-disk domain documents.
//!
//! Three documents per domain:
//! - `<config_dir>/<name>.json`: the persistent definition
//! - `<state_dir>/<name>.json`: the status document of an active domain
//! - `<autostart_dir>/<name>.json`: symlink to the config when autostarted
//!
//! Writes go to a `.tmp` sibling and are renamed into place.

use super::{Domain, DomainDef, DomainInner, DomainState, StateReason};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Live status of an active domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDoc {
    /// Active definition.
    pub def: DomainDef,
    /// VMM pid.
    pub pid: i32,
    /// State when saved.
    pub state: DomainState,
    /// Reason when saved.
    pub reason: StateReason,
    /// Has a persistent config.
    #[serde(default)]
    pub persistent: bool,
    /// Machine name of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// Known vcpu thread ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vcpu_pids: Vec<i32>,
}

impl StatusDoc {
    /// Snapshot the status of a locked domain.
    pub fn capture(inner: &DomainInner) -> Self {
        Self {
            def: inner.def.clone(),
            pid: inner.pid,
            state: inner.state,
            reason: inner.reason,
            persistent: inner.persistent,
            machine_name: inner.runtime.machine_name.clone(),
            vcpu_pids: inner.runtime.vcpu_pids.clone(),
        }
    }

    /// Rebuild an inactive-but-reconnectable domain object.
    ///
    /// `id` stays -1 until the reconnect engine has reopened the monitor.
    pub fn into_domain(self) -> Domain {
        let dom = Domain::new(self.def);
        {
            let mut inner = dom.lock();
            inner.pid = self.pid;
            inner.state = self.state;
            inner.reason = self.reason;
            inner.persistent = self.persistent;
            inner.runtime.machine_name = self.machine_name;
            inner.runtime.vcpu_pids = self.vcpu_pids;
        }
        dom
    }
}

/// Write `data` to `path` through a temporary file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Save the status document of a locked domain.
pub fn save_status(config: &DriverConfig, inner: &DomainInner) -> Result<()> {
    let doc = StatusDoc::capture(inner);
    let data = serde_json::to_vec_pretty(&doc)?;
    write_atomic(&config.status_file(&doc.def.name), &data)?;
    tracing::debug!(domain = %doc.def.name, pid = doc.pid, "saved status");
    Ok(())
}

/// Remove the status document.
pub fn remove_status(config: &DriverConfig, name: &str) -> Result<()> {
    remove_if_exists(&config.status_file(name))
}

/// Save a persistent definition.
pub fn save_config(config: &DriverConfig, def: &DomainDef) -> Result<()> {
    let data = serde_json::to_vec_pretty(def)?;
    write_atomic(&config.config_file(&def.name), &data)
}

/// Delete a persistent definition and its autostart link.
pub fn delete_config(config: &DriverConfig, name: &str) -> Result<()> {
    remove_if_exists(&config.autostart_link(name))?;
    remove_if_exists(&config.config_file(name))
}

/// Create or remove the autostart link.
pub fn set_autostart(config: &DriverConfig, name: &str, enable: bool) -> Result<()> {
    let link = config.autostart_link(name);
    if !enable {
        return remove_if_exists(&link);
    }

    std::fs::create_dir_all(&config.autostart_dir)?;
    remove_if_exists(&link)?;
    std::os::unix::fs::symlink(config.config_file(name), &link).map_err(|e| {
        Error::internal(format!(
            "failed to create autostart link {}: {}",
            link.display(),
            e
        ))
    })
}

/// Whether an autostart link exists.
pub fn is_autostart(config: &DriverConfig, name: &str) -> bool {
    config.autostart_link(name).symlink_metadata().is_ok()
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json") && p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Load every status document in the state dir.
///
/// Unreadable documents are skipped with a warning.
pub fn load_all_status(config: &DriverConfig) -> Result<Vec<StatusDoc>> {
    let mut docs = Vec::new();
    for path in json_files(&config.state_dir)? {
        let parsed = std::fs::read(&path)
            .map_err(Error::from)
            .and_then(|raw| serde_json::from_slice::<StatusDoc>(&raw).map_err(Error::from));
        match parsed {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping status document")
            }
        }
    }
    Ok(docs)
}

/// Load every persistent definition with its autostart flag.
pub fn load_all_configs(config: &DriverConfig) -> Result<Vec<(DomainDef, bool)>> {
    let mut defs = Vec::new();
    for path in json_files(&config.config_dir)? {
        let parsed = std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| DomainDef::from_json(&raw));
        match parsed {
            Ok(def) => {
                let autostart = is_autostart(config, &def.name);
                defs.push((def, autostart));
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping domain config")
            }
        }
    }
    Ok(defs)
}
