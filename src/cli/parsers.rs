//! Shared CLI argument parsers.
//!
//! Parsers and small helpers used by several commands, so that domain
//! lookup and cpu-list validation behave the same everywhere.

use clap::Args;
use chvirt::bitmap::Bitmap;
use chvirt::domain::def::NumaMode;
use chvirt::domain::DomainDef;
use chvirt::driver::{Affect, DomainRef, HypervisorDriver};
use chvirt::Error;
use std::path::Path;
use uuid::Uuid;

/// Parse a cpu or node list (e.g. "0-3,6").
pub fn parse_bitmap(s: &str) -> Result<Bitmap, String> {
    let map = Bitmap::parse(s).map_err(|e| e.to_string())?;
    if map.is_empty() {
        return Err(format!("empty list: '{}'", s));
    }
    Ok(map)
}

/// Parse a NUMA memory mode.
pub fn parse_numa_mode(s: &str) -> Result<NumaMode, String> {
    match s {
        "strict" => Ok(NumaMode::Strict),
        "preferred" => Ok(NumaMode::Preferred),
        "interleave" => Ok(NumaMode::Interleave),
        "restrictive" => Ok(NumaMode::Restrictive),
        other => Err(format!(
            "unknown mode '{}' (strict, preferred, interleave, restrictive)",
            other
        )),
    }
}

/// Read a JSON domain definition.
pub fn read_def(path: &Path) -> chvirt::Result<DomainDef> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid_argument(format!("{}: {}", path.display(), e)))?;
    DomainDef::from_json(&raw)
}

/// Resolve a domain by id, UUID, or name, in that order.
pub fn lookup(driver: &dyn HypervisorDriver, key: &str) -> chvirt::Result<DomainRef> {
    if let Ok(id) = key.parse::<i32>() {
        if let Ok(dom) = driver.lookup_by_id(id) {
            return Ok(dom);
        }
    }
    if let Ok(uuid) = key.parse::<Uuid>() {
        return driver.lookup_by_uuid(&uuid);
    }
    driver.lookup_by_name(key)
}

/// Which definition a change applies to.
#[derive(Args, Debug, Clone, Copy)]
pub struct AffectArgs {
    /// Apply to the running domain.
    #[arg(long)]
    pub live: bool,

    /// Apply to the persistent definition.
    #[arg(long)]
    pub persistent: bool,
}

impl AffectArgs {
    /// Map the flags onto an [`Affect`]; neither flag means current.
    pub fn affect(&self) -> Affect {
        match (self.live, self.persistent) {
            (true, true) => Affect::Both,
            (true, false) => Affect::Live,
            (false, true) => Affect::Config,
            (false, false) => Affect::Current,
        }
    }
}
