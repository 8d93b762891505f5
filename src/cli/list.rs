//! List command implementation.

use chvirt::driver::{ChDriver, HypervisorDriver, ListFilter};
use clap::Args;

/// List domains.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Include inactive domains.
    #[arg(short, long, conflicts_with = "inactive")]
    pub all: bool,

    /// Only inactive domains.
    #[arg(long)]
    pub inactive: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, driver: &ChDriver) -> chvirt::Result<()> {
        let filter = if self.all {
            ListFilter::All
        } else if self.inactive {
            ListFilter::Inactive
        } else {
            ListFilter::Active
        };
        let domains = driver.list_domains(filter);

        if self.json {
            let mut rows = Vec::with_capacity(domains.len());
            for dom in &domains {
                let info = driver.get_info(dom)?;
                rows.push(serde_json::json!({
                    "id": dom.id,
                    "name": dom.name,
                    "uuid": dom.uuid,
                    "state": info.state,
                    "reason": info.reason,
                    "vcpus": info.nr_virt_cpu,
                    "memory_kib": info.memory_kib,
                    "autostart": driver.get_autostart(dom)?,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        println!("{:<6} {:<24} {:<10}", "ID", "NAME", "STATE");
        println!("{}", "-".repeat(42));
        for dom in &domains {
            let (state, _) = driver.get_state(dom)?;
            let id = if dom.id < 0 {
                "-".to_string()
            } else {
                dom.id.to_string()
            };
            println!("{:<6} {:<24} {:<10}", id, truncate(&dom.name, 22), state);
        }
        Ok(())
    }
}

/// Truncate a string to max length, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}
