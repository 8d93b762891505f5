//! NUMA tuning command.

use super::parsers::{lookup, parse_bitmap, parse_numa_mode, AffectArgs};
use chvirt::bitmap::Bitmap;
use chvirt::domain::def::NumaMode;
use chvirt::driver::{ChDriver, HypervisorDriver, NumaParams};
use clap::Args;

/// Show or change NUMA memory parameters.
#[derive(Args, Debug)]
pub struct NumatuneCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Memory mode.
    #[arg(long, value_parser = parse_numa_mode)]
    pub mode: Option<NumaMode>,

    /// Node list.
    #[arg(long, value_parser = parse_bitmap)]
    pub nodeset: Option<Bitmap>,

    #[command(flatten)]
    pub affect: AffectArgs,
}

impl NumatuneCmd {
    /// Execute the numatune command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let affect = self.affect.affect();
        let current = driver.numa_parameters(&dom, affect)?;

        if self.mode.is_none() && self.nodeset.is_none() {
            println!("numa_mode      : {}", mode_name(current.mode));
            println!(
                "numa_nodeset   : {}",
                current.nodeset.map(|n| n.format()).unwrap_or_default()
            );
            return Ok(());
        }

        let params = NumaParams {
            mode: self.mode.unwrap_or(current.mode),
            nodeset: self.nodeset,
        };
        driver.set_numa_parameters(&dom, &params, affect)
    }
}

fn mode_name(mode: NumaMode) -> &'static str {
    match mode {
        NumaMode::Strict => "strict",
        NumaMode::Preferred => "preferred",
        NumaMode::Interleave => "interleave",
        NumaMode::Restrictive => "restrictive",
    }
}
