//! Daemon command implementation.

use chvirt::config::DriverConfig;
use chvirt::driver::{ChDriver, HypervisorDriver, ListFilter};
use clap::Args;
use nix::sys::signal::{SigSet, Signal};

/// Run the driver in the foreground until SIGINT or SIGTERM.
///
/// Running domains are reconnected on startup and left running on exit.
#[derive(Args, Debug)]
pub struct DaemonCmd {
    /// Do not start autostart domains.
    #[arg(long)]
    pub no_autostart: bool,
}

impl DaemonCmd {
    /// Execute the daemon command.
    pub fn run(self, config: DriverConfig) -> chvirt::Result<()> {
        // blocked before any driver thread exists so only sigwait sees them
        let mut signals = SigSet::empty();
        signals.add(Signal::SIGINT);
        signals.add(Signal::SIGTERM);
        signals.thread_block()?;

        let driver = ChDriver::initialize(config, !self.no_autostart)?;
        tracing::info!(
            uri = driver.uri(),
            domains = driver.list_domains(ListFilter::All).len(),
            active = driver.num_of_domains(),
            "daemon ready"
        );
        println!("Serving {} (Ctrl-C to exit)", driver.uri());

        let signal = signals.wait()?;
        tracing::info!(signal = signal.as_str(), "shutting down");
        ChDriver::cleanup();
        Ok(())
    }
}
