//! Read-only domain and host queries.

use super::parsers::lookup;
use chvirt::driver::{version, ChDriver, HypervisorDriver};
use clap::Args;

/// Show domain information.
#[derive(Args, Debug)]
pub struct InfoCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl InfoCmd {
    /// Execute the info command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let info = driver.get_info(&dom)?;
        let autostart = driver.get_autostart(&dom)?;

        if self.json {
            let mut value = serde_json::to_value(&info)?;
            value["name"] = serde_json::json!(dom.name);
            value["uuid"] = serde_json::json!(dom.uuid);
            value["id"] = serde_json::json!(dom.id);
            value["autostart"] = serde_json::json!(autostart);
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        let id = if dom.id < 0 {
            "-".to_string()
        } else {
            dom.id.to_string()
        };
        println!("{:<16}{}", "Id:", id);
        println!("{:<16}{}", "Name:", dom.name);
        println!("{:<16}{}", "UUID:", dom.uuid);
        println!("{:<16}{} ({})", "State:", info.state, info.reason);
        println!("{:<16}{}", "CPU(s):", info.nr_virt_cpu);
        println!("{:<16}{} KiB", "Max memory:", info.max_mem_kib);
        println!("{:<16}{} KiB", "Used memory:", info.memory_kib);
        println!("{:<16}{}", "Autostart:", if autostart { "enable" } else { "disable" });
        Ok(())
    }
}

/// Print a domain definition as JSON.
#[derive(Args, Debug)]
pub struct DumpdefCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Show the definition used by the next start.
    #[arg(long)]
    pub inactive: bool,
}

impl DumpdefCmd {
    /// Execute the dumpdef command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let def = driver.get_def(&dom, self.inactive)?;
        println!("{}", serde_json::to_string_pretty(&def)?);
        Ok(())
    }
}

/// Print the PTY of a console or serial device.
#[derive(Args, Debug)]
pub struct ConsoleCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Device alias; the first console or serial when omitted.
    #[arg(long)]
    pub device: Option<String>,
}

impl ConsoleCmd {
    /// Execute the console command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let path = driver.console_path(&dom, self.device.as_deref())?;
        println!("{}", path.display());
        Ok(())
    }
}

/// Show versions and host capacity.
#[derive(Args, Debug)]
pub struct VersionCmd {}

impl VersionCmd {
    /// Execute the version command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        println!("chvirt {}", chvirt::VERSION);
        println!("Using URI: {}", driver.uri());
        println!(
            "Running hypervisor: {} {}",
            driver.type_name(),
            version::format(driver.version()?)
        );
        let node = driver.node_info()?;
        println!(
            "Host {}: {} CPU(s) ({}), {} NUMA node(s), {} KiB memory",
            driver.hostname()?,
            node.cpus,
            driver.node_cpu_map()?,
            node.nodes,
            node.memory_kib
        );
        Ok(())
    }
}
