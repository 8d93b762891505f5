//! Autostart command implementation.

use super::parsers::lookup;
use chvirt::driver::{ChDriver, HypervisorDriver};
use clap::Args;

/// Mark a persistent domain to start with the driver.
#[derive(Args, Debug)]
pub struct AutostartCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Turn autostart off.
    #[arg(long)]
    pub disable: bool,
}

impl AutostartCmd {
    /// Execute the autostart command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        driver.set_autostart(&dom, !self.disable)?;
        if self.disable {
            println!("Domain '{}' unmarked as autostarted", dom.name);
        } else {
            println!("Domain '{}' marked as autostarted", dom.name);
        }
        Ok(())
    }
}
