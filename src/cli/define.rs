//! Define and undefine commands.

use super::parsers::{lookup, read_def};
use chvirt::driver::{ChDriver, HypervisorDriver};
use clap::Args;
use std::path::PathBuf;

/// Define or update a persistent domain from a JSON definition.
#[derive(Args, Debug)]
pub struct DefineCmd {
    /// Definition file.
    pub file: PathBuf,
}

impl DefineCmd {
    /// Execute the define command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let def = read_def(&self.file)?;
        let dom = driver.define(def)?;
        println!("Domain '{}' defined from {}", dom.name, self.file.display());
        Ok(())
    }
}

/// Remove the persistent definition of a domain.
#[derive(Args, Debug)]
pub struct UndefineCmd {
    /// Domain name, UUID or id.
    pub domain: String,
}

impl UndefineCmd {
    /// Execute the undefine command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        driver.undefine(&dom)?;
        println!("Domain '{}' has been undefined", dom.name);
        Ok(())
    }
}
