//! Create command implementation.

use super::parsers::read_def;
use chvirt::driver::{ChDriver, HypervisorDriver};
use clap::Args;
use std::path::PathBuf;

/// Start a transient domain from a JSON definition.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// Definition file.
    pub file: PathBuf,

    /// Also keep the definition as a persistent domain.
    #[arg(long)]
    pub define: bool,
}

impl CreateCmd {
    /// Execute the create command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let def = read_def(&self.file)?;
        let dom = if self.define {
            let dom = driver.define(def)?;
            driver.start(&dom)?;
            driver.lookup_by_uuid(&dom.uuid)?
        } else {
            driver.create(def)?
        };
        println!("Domain '{}' created from {} (id {})", dom.name, self.file.display(), dom.id);
        Ok(())
    }
}
