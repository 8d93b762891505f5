//! Start, shutdown, reboot, suspend, resume and destroy.

use super::parsers::lookup;
use chvirt::driver::{ChDriver, HypervisorDriver};
use clap::Args;

/// A state change of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Boot a defined domain.
    Start,
    /// Graceful guest shutdown.
    Shutdown,
    /// Guest reboot.
    Reboot,
    /// Pause.
    Suspend,
    /// Unpause.
    Resume,
    /// Kill the VMM.
    Destroy,
}

impl Action {
    fn done(&self) -> &'static str {
        match self {
            Action::Start => "started",
            Action::Shutdown => "is being shutdown",
            Action::Reboot => "is being rebooted",
            Action::Suspend => "suspended",
            Action::Resume => "resumed",
            Action::Destroy => "destroyed",
        }
    }
}

/// Target of a state change.
#[derive(Args, Debug)]
pub struct DomainArg {
    /// Domain name, UUID or id.
    pub domain: String,
}

impl DomainArg {
    /// Apply `action` to the domain.
    pub fn run(self, driver: &ChDriver, action: Action) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        match action {
            Action::Start => driver.start(&dom)?,
            Action::Shutdown => driver.shutdown(&dom)?,
            Action::Reboot => driver.reboot(&dom)?,
            Action::Suspend => driver.suspend(&dom)?,
            Action::Resume => driver.resume(&dom)?,
            Action::Destroy => driver.destroy(&dom)?,
        }
        println!("Domain '{}' {}", dom.name, action.done());
        Ok(())
    }
}
