//! CLI command implementations.

pub mod autostart;
pub mod config;
pub mod create;
pub mod daemon;
pub mod define;
pub mod info;
pub mod lifecycle;
pub mod list;
pub mod numa;
pub mod parsers;
pub mod vcpu;

use chvirt::driver::ChDriver;
use clap::Subcommand;
use lifecycle::{Action, DomainArg};

/// Commands that run against an initialized driver.
#[derive(Subcommand, Debug)]
pub enum DomainCommand {
    /// Define or update a persistent domain.
    Define(define::DefineCmd),

    /// Remove a persistent definition.
    Undefine(define::UndefineCmd),

    /// Create and start a domain from a definition file.
    Create(create::CreateCmd),

    /// Start a defined domain.
    Start(DomainArg),

    /// Gracefully shut down a domain.
    Shutdown(DomainArg),

    /// Reboot a domain.
    Reboot(DomainArg),

    /// Pause a domain.
    Suspend(DomainArg),

    /// Resume a paused domain.
    Resume(DomainArg),

    /// Forcefully stop a domain.
    Destroy(DomainArg),

    /// Change the number of vcpus.
    Setvcpus(vcpu::SetvcpusCmd),

    /// Show or change vcpu pinning.
    PinVcpu(vcpu::PinVcpuCmd),

    /// Show or change emulator pinning.
    PinEmulator(vcpu::PinEmulatorCmd),

    /// Show or change NUMA memory parameters.
    Numatune(numa::NumatuneCmd),

    /// Show domain information.
    Info(info::InfoCmd),

    /// List domains.
    #[command(alias = "ls")]
    List(list::ListCmd),

    /// Mark a domain to start with the driver.
    Autostart(autostart::AutostartCmd),

    /// Print a domain definition.
    Dumpdef(info::DumpdefCmd),

    /// Print the PTY of a console or serial device.
    Console(info::ConsoleCmd),

    /// Show versions and host capacity.
    Version(info::VersionCmd),
}

impl DomainCommand {
    /// Run the command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        match self {
            DomainCommand::Define(cmd) => cmd.run(driver),
            DomainCommand::Undefine(cmd) => cmd.run(driver),
            DomainCommand::Create(cmd) => cmd.run(driver),
            DomainCommand::Start(arg) => arg.run(driver, Action::Start),
            DomainCommand::Shutdown(arg) => arg.run(driver, Action::Shutdown),
            DomainCommand::Reboot(arg) => arg.run(driver, Action::Reboot),
            DomainCommand::Suspend(arg) => arg.run(driver, Action::Suspend),
            DomainCommand::Resume(arg) => arg.run(driver, Action::Resume),
            DomainCommand::Destroy(arg) => arg.run(driver, Action::Destroy),
            DomainCommand::Setvcpus(cmd) => cmd.run(driver),
            DomainCommand::PinVcpu(cmd) => cmd.run(driver),
            DomainCommand::PinEmulator(cmd) => cmd.run(driver),
            DomainCommand::Numatune(cmd) => cmd.run(driver),
            DomainCommand::Info(cmd) => cmd.run(driver),
            DomainCommand::List(cmd) => cmd.run(driver),
            DomainCommand::Autostart(cmd) => cmd.run(driver),
            DomainCommand::Dumpdef(cmd) => cmd.run(driver),
            DomainCommand::Console(cmd) => cmd.run(driver),
            DomainCommand::Version(cmd) => cmd.run(driver),
        }
    }
}
