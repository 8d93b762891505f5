//! vcpu count and pinning commands.

use super::parsers::{lookup, parse_bitmap, AffectArgs};
use chvirt::bitmap::Bitmap;
use chvirt::driver::{ChDriver, HypervisorDriver};
use clap::Args;

/// Change the number of vcpus.
#[derive(Args, Debug)]
pub struct SetvcpusCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// New vcpu count.
    pub count: usize,

    /// Change the maximum instead of the online count.
    #[arg(long)]
    pub maximum: bool,

    #[command(flatten)]
    pub affect: AffectArgs,
}

impl SetvcpusCmd {
    /// Execute the setvcpus command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        driver.set_vcpus(&dom, self.count, self.affect.affect(), self.maximum)?;
        let what = if self.maximum { "maximum vcpus" } else { "vcpus" };
        println!("Domain '{}' {} set to {}", dom.name, what, self.count);
        Ok(())
    }
}

/// Show or change vcpu pinning.
#[derive(Args, Debug)]
pub struct PinVcpuCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// vcpu index; all vcpus are shown when omitted.
    pub vcpu: Option<usize>,

    /// Host cpu list to pin to.
    #[arg(value_parser = parse_bitmap)]
    pub cpulist: Option<Bitmap>,

    #[command(flatten)]
    pub affect: AffectArgs,
}

impl PinVcpuCmd {
    /// Execute the pin-vcpu command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let affect = self.affect.affect();
        if let (Some(vcpu), Some(cpus)) = (self.vcpu, &self.cpulist) {
            driver.pin_vcpu(&dom, vcpu, cpus, affect)?;
            return Ok(());
        }

        println!("{:<6} {}", "VCPU", "CPU AFFINITY");
        println!("{}", "-".repeat(24));
        for (vcpu, mask) in driver.vcpu_pin_info(&dom, affect)?.iter().enumerate() {
            if self.vcpu.map_or(true, |v| v == vcpu) {
                println!("{:<6} {}", vcpu, mask);
            }
        }
        Ok(())
    }
}

/// Show or change emulator thread pinning.
#[derive(Args, Debug)]
pub struct PinEmulatorCmd {
    /// Domain name, UUID or id.
    pub domain: String,

    /// Host cpu list to pin to; the current pinning is shown when omitted.
    #[arg(value_parser = parse_bitmap)]
    pub cpulist: Option<Bitmap>,

    #[command(flatten)]
    pub affect: AffectArgs,
}

impl PinEmulatorCmd {
    /// Execute the pin-emulator command.
    pub fn run(self, driver: &ChDriver) -> chvirt::Result<()> {
        let dom = lookup(driver, &self.domain)?;
        let affect = self.affect.affect();
        match &self.cpulist {
            Some(cpus) => driver.pin_emulator(&dom, cpus, affect),
            None => {
                println!("emulator: CPU Affinity");
                println!("       *: {}", driver.emulator_pin_info(&dom, affect)?);
                Ok(())
            }
        }
    }
}
