//! Host-side networking for guest interfaces.
//!
//! Before the VMM starts, every interface that needs a tap gets one: opened
//! through the tun driver, given a host-side MAC and MTU, brought up and
//! attached to its bridge. The resulting fds are inherited by the VMM.
//! Once the VMM runs, bridge FDB entries and host addresses are added.

mod command;
pub mod tap;

pub use command::{run, run_ignore_errors};

use crate::config::DriverConfig;
use crate::domain::def::{DomainDef, IpDef, MacAddr, NetDef, NetType};
use crate::error::{Error, Result};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

/// Name template for driver-created taps.
pub const TAP_TEMPLATE: &str = "vnet%d";

/// Host network operations.
pub trait NetBackend: Send + Sync {
    /// Create a tap and open `queues` fds on it; returns the actual name.
    fn create_tap(
        &self,
        tun_path: &Path,
        ifname: &str,
        queues: usize,
        vnet_hdr: bool,
    ) -> Result<(String, Vec<OwnedFd>)>;

    /// Whether a host interface exists.
    fn interface_exists(&self, ifname: &str) -> bool;

    /// Set the MAC of a host interface.
    fn set_mac(&self, ifname: &str, mac: &MacAddr) -> Result<()>;

    /// Set the MTU of a host interface.
    fn set_mtu(&self, ifname: &str, mtu: u32) -> Result<()>;

    /// Bring a host interface up.
    fn set_up(&self, ifname: &str) -> Result<()>;

    /// Enslave an interface to a bridge.
    fn attach_to_bridge(&self, bridge: &str, ifname: &str) -> Result<()>;

    /// Set a bridge port flag (`learning`, `unicast_flood`).
    fn set_port_flag(&self, ifname: &str, flag: &str, enabled: bool) -> Result<()>;

    /// Drop frames from `ifname` whose source is not `mac`.
    fn allow_mac_in(&self, ifname: &str, mac: &MacAddr) -> Result<()>;

    /// Remove the rule installed by [`allow_mac_in`](Self::allow_mac_in).
    fn remove_mac_filter(&self, ifname: &str, mac: &MacAddr) -> Result<()>;

    /// Add a static bridge FDB entry for `mac` on `ifname`.
    fn fdb_add(&self, ifname: &str, mac: &MacAddr) -> Result<()>;

    /// Add an address to a host interface.
    fn add_address(&self, ifname: &str, ip: &IpDef) -> Result<()>;

    /// Run an interface up script.
    fn run_script(&self, script: &Path, ifname: &str) -> Result<()>;
}

/// [`NetBackend`] backed by the tun driver, sysfs and iproute2/ebtables.
#[derive(Debug, Clone)]
pub struct SystemNet {
    sysfs: PathBuf,
}

impl SystemNet {
    /// Backend reading interfaces from `<sysfs>/class/net`.
    pub fn new(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
        }
    }
}

impl NetBackend for SystemNet {
    fn create_tap(
        &self,
        tun_path: &Path,
        ifname: &str,
        queues: usize,
        vnet_hdr: bool,
    ) -> Result<(String, Vec<OwnedFd>)> {
        tap::create_tap(tun_path, ifname, queues, vnet_hdr)
    }

    fn interface_exists(&self, ifname: &str) -> bool {
        self.sysfs.join("class/net").join(ifname).exists()
    }

    fn set_mac(&self, ifname: &str, mac: &MacAddr) -> Result<()> {
        run("ip", &["link", "set", "dev", ifname, "address", &mac.to_string()]).map(|_| ())
    }

    fn set_mtu(&self, ifname: &str, mtu: u32) -> Result<()> {
        run("ip", &["link", "set", "dev", ifname, "mtu", &mtu.to_string()]).map(|_| ())
    }

    fn set_up(&self, ifname: &str) -> Result<()> {
        run("ip", &["link", "set", "dev", ifname, "up"]).map(|_| ())
    }

    fn attach_to_bridge(&self, bridge: &str, ifname: &str) -> Result<()> {
        run("ip", &["link", "set", "dev", ifname, "master", bridge]).map(|_| ())
    }

    fn set_port_flag(&self, ifname: &str, flag: &str, enabled: bool) -> Result<()> {
        let path = self.sysfs.join("class/net").join(ifname).join("brport").join(flag);
        std::fs::write(&path, if enabled { "1" } else { "0" }).map_err(|e| {
            Error::internal(format!("unable to set {} on {}: {}", flag, ifname, e))
        })
    }

    fn allow_mac_in(&self, ifname: &str, mac: &MacAddr) -> Result<()> {
        let mac = mac.to_string();
        run(
            "ebtables",
            &["--concurrent", "-t", "filter", "-A", "FORWARD", "-i", ifname, "-s", "!", &mac, "-j", "DROP"],
        )
        .map(|_| ())
    }

    fn remove_mac_filter(&self, ifname: &str, mac: &MacAddr) -> Result<()> {
        let mac = mac.to_string();
        run(
            "ebtables",
            &["--concurrent", "-t", "filter", "-D", "FORWARD", "-i", ifname, "-s", "!", &mac, "-j", "DROP"],
        )
        .map(|_| ())
    }

    fn fdb_add(&self, ifname: &str, mac: &MacAddr) -> Result<()> {
        run("bridge", &["fdb", "add", &mac.to_string(), "dev", ifname, "master", "temp"]).map(|_| ())
    }

    fn add_address(&self, ifname: &str, ip: &IpDef) -> Result<()> {
        let addr = format!("{}/{}", ip.address, ip.prefix);
        run("ip", &["addr", "add", &addr, "dev", ifname]).map(|_| ())
    }

    fn run_script(&self, script: &Path, ifname: &str) -> Result<()> {
        let script = script.to_string_lossy();
        run(&script, &[ifname]).map(|_| ())
    }
}

/// Fill in the bridge of `network` interfaces from the configured networks.
pub fn resolve_network(config: &DriverConfig, net: &mut NetDef) -> Result<()> {
    if net.net_type != NetType::Network {
        return Ok(());
    }
    let name = net
        .network
        .as_deref()
        .ok_or_else(|| Error::config_unsupported("network interface without a network name"))?;
    let bridge = config.networks.get(name).ok_or_else(|| {
        Error::operation_invalid(format!("network '{}' is not defined", name))
    })?;
    net.bridge = Some(bridge.clone());
    Ok(())
}

fn tun_path(config: &DriverConfig, net: &NetDef) -> Result<PathBuf> {
    match &net.tap_path {
        Some(path) if !config.privileged => Err(Error::config_unsupported(format!(
            "cannot use custom tap device {} in session mode",
            path.display()
        ))),
        Some(path) => Ok(path.clone()),
        None => Ok(PathBuf::from(tap::DEFAULT_TUN_PATH)),
    }
}

fn tap_name(net: &NetDef) -> String {
    match net.ifname.as_deref() {
        Some(name) if !name.starts_with("vnet") && !name.contains('%') => name.to_string(),
        _ => TAP_TEMPLATE.to_string(),
    }
}

fn connect_ethernet(config: &DriverConfig, backend: &dyn NetBackend, net: &mut NetDef) -> Result<Vec<OwnedFd>> {
    let tun = tun_path(config, net)?;
    let queues = net.tap_queues();

    let fds = if net.managed_tap {
        let (ifname, fds) = backend.create_tap(&tun, &tap_name(net), queues, net.is_virtio())?;
        net.ifname = Some(ifname.clone());
        backend.set_mac(&ifname, &net.mac.tap_side())?;
        backend.set_up(&ifname)?;
        fds
    } else {
        let ifname = net
            .ifname
            .clone()
            .ok_or_else(|| Error::internal("target dev must be supplied when managed_tap is false"))?;
        if !backend.interface_exists(&ifname) {
            return Err(Error::internal(format!(
                "target {} is unmanaged but does not exist",
                ifname
            )));
        }
        backend.create_tap(&tun, &ifname, queues, net.is_virtio())?.1
    };

    let ifname = net.ifname.clone().unwrap_or_default();
    if let Some(mtu) = net.mtu {
        backend.set_mtu(&ifname, mtu)?;
    }
    if let Some(script) = &net.script {
        backend.run_script(script, &ifname)?;
    }
    if config.mac_filter {
        backend.allow_mac_in(&ifname, &net.mac)?;
    }
    Ok(fds)
}

fn connect_bridge(config: &DriverConfig, backend: &dyn NetBackend, net: &mut NetDef) -> Result<Vec<OwnedFd>> {
    let tun = tun_path(config, net)?;
    let bridge = net
        .bridge
        .clone()
        .ok_or_else(|| Error::internal("missing bridge name"))?;
    if !config.privileged {
        return Err(Error::operation_unsupported("cannot connect to bridge in session mode"));
    }

    let (ifname, fds) = backend.create_tap(&tun, &tap_name(net), net.tap_queues(), net.is_virtio())?;
    net.ifname = Some(ifname.clone());
    backend.set_mac(&ifname, &net.mac.tap_side())?;
    if let Some(mtu) = net.mtu {
        backend.set_mtu(&ifname, mtu)?;
    }
    backend.attach_to_bridge(&bridge, &ifname)?;
    backend.set_up(&ifname)?;

    if manages_fdb(config, net) {
        backend.set_port_flag(&ifname, "learning", false)?;
        backend.set_port_flag(&ifname, "unicast_flood", false)?;
    }
    if config.mac_filter {
        backend.allow_mac_in(&ifname, &net.mac)?;
    }
    Ok(fds)
}

fn manages_fdb(config: &DriverConfig, net: &NetDef) -> bool {
    config.mac_table_managed && net.net_type == NetType::Network
}

/// Open the tap fds of one interface.
///
/// vhost-user interfaces get no fds. On error every fd opened for the
/// interface is closed.
pub fn prepare_interface(config: &DriverConfig, backend: &dyn NetBackend, net: &mut NetDef) -> Result<Vec<OwnedFd>> {
    match net.net_type {
        NetType::Ethernet => connect_ethernet(config, backend, net),
        NetType::Network => {
            resolve_network(config, net)?;
            connect_bridge(config, backend, net)
        }
        NetType::Bridge => connect_bridge(config, backend, net),
        NetType::Vhostuser => Ok(Vec::new()),
        NetType::User => Err(Error::config_unsupported(
            "user mode networking is not supported",
        )),
        other => Err(Error::config_unsupported(format!(
            "interface type {} is not supported",
            other.name()
        ))),
    }
}

/// Prepare every interface of `def`, in order.
pub fn prepare_interfaces(
    config: &DriverConfig,
    backend: &dyn NetBackend,
    def: &mut DomainDef,
) -> Result<Vec<Vec<OwnedFd>>> {
    let mut all = Vec::with_capacity(def.nets.len());
    for net in &mut def.nets {
        let fds = prepare_interface(config, backend, net)?;
        tracing::debug!(
            domain = %def.name,
            mac = %net.mac,
            ifname = net.ifname.as_deref().unwrap_or(""),
            fds = fds.len(),
            "interface prepared"
        );
        all.push(fds);
    }
    Ok(all)
}

/// Make interfaces reachable once the VMM holds their fds.
pub fn start_interfaces(config: &DriverConfig, backend: &dyn NetBackend, def: &DomainDef) -> Result<()> {
    for net in &def.nets {
        let Some(ifname) = net.ifname.as_deref() else {
            continue;
        };
        match net.net_type {
            NetType::Bridge | NetType::Network if manages_fdb(config, net) => {
                backend.fdb_add(ifname, &net.mac)?;
            }
            NetType::Ethernet => {
                for ip in &net.host_ips {
                    backend.add_address(ifname, ip)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Undo per-interface host state that outlives the tap fds.
pub fn release_interfaces(config: &DriverConfig, backend: &dyn NetBackend, def: &DomainDef) {
    if !config.mac_filter {
        return;
    }
    for net in &def.nets {
        if let Some(ifname) = net.ifname.as_deref() {
            if let Err(e) = backend.remove_mac_filter(ifname, &net.mac) {
                tracing::debug!(ifname, error = %e, "cannot remove mac filter");
            }
        }
    }
}
