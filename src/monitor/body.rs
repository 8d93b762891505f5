//! Request and response documents of the VMM API.

use crate::domain::def::{ChrDef, ChrType, DiskBus, DiskType, DomainDef, HostdevSource, NetType};
use crate::domain::state::DomainState;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// `vm.create` body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmConfig {
    /// vcpu counts.
    pub cpus: CpusConfig,
    /// Guest memory.
    pub memory: MemoryConfig,
    /// Kernel image.
    pub kernel: PathConfig,
    /// Kernel command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<CmdlineConfig>,
    /// Initramfs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<PathConfig>,
    /// virtio console.
    pub console: ConsoleConfig,
    /// Legacy serial port.
    pub serial: ConsoleConfig,
    /// Disks.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    /// Network interfaces.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<NetConfig>,
    /// VFIO devices.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
}

/// vcpu counts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CpusConfig {
    /// Online at boot.
    pub boot_vcpus: usize,
    /// Hot-plug ceiling.
    pub max_vcpus: usize,
}

/// Guest memory size.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Bytes.
    pub size: u64,
}

/// A path-only payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PathConfig {
    /// Path.
    pub path: PathBuf,
}

/// Kernel arguments.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CmdlineConfig {
    /// Arguments.
    pub args: String,
}

/// Console mode.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ConsoleMode {
    /// PTY allocated by the VMM.
    Pty,
    /// Discarded.
    Null,
}

/// Console or serial configuration.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ConsoleConfig {
    /// Mode.
    pub mode: ConsoleMode,
}

/// One disk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiskConfig {
    /// Image path.
    pub path: PathBuf,
    /// Read-only; only sent when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

/// One network interface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NetConfig {
    /// Guest MAC.
    pub mac: String,
    /// Inherited tap fds.
    pub fds: Vec<RawFd>,
    /// Host-side address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Host-side netmask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    /// Queue count: two per tap fd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<usize>,
    /// Queue depth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    /// IOMMU.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iommu: Option<bool>,
    /// vhost-user socket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost_socket: Option<PathBuf>,
    /// vhost-user backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost_user: Option<bool>,
}

/// One VFIO device.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// sysfs directory of the device.
    pub path: PathBuf,
}

/// `vm.resize` body.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ResizeConfig {
    /// New online vcpu count.
    pub desired_vcpus: usize,
}

/// Subset of the `vm.info` response the driver uses.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VmInfo {
    /// VMM state name (`Created`, `Running`, `Shutdown`, `Paused`).
    #[serde(default)]
    pub state: String,
    /// Config echoed back by the VMM.
    #[serde(default)]
    pub config: VmInfoConfig,
}

/// Config part of `vm.info`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VmInfoConfig {
    /// Console details.
    #[serde(default)]
    pub console: Option<VmInfoConsole>,
    /// Serial details.
    #[serde(default)]
    pub serial: Option<VmInfoConsole>,
}

/// Console details in `vm.info`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VmInfoConsole {
    /// Mode name.
    #[serde(default)]
    pub mode: String,
    /// Allocated PTY, if any.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl VmInfo {
    /// Mapped domain state; unknown names yield `None`.
    pub fn domain_state(&self) -> Option<DomainState> {
        DomainState::from_vmm(&self.state)
    }

    /// PTY of the console.
    pub fn console_pty(&self) -> Option<&Path> {
        pty_of(self.config.console.as_ref())
    }

    /// PTY of the serial port.
    pub fn serial_pty(&self) -> Option<&Path> {
        pty_of(self.config.serial.as_ref())
    }
}

fn pty_of(console: Option<&VmInfoConsole>) -> Option<&Path> {
    console
        .filter(|c| c.mode == "Pty")
        .and_then(|c| c.file.as_deref())
}

/// Reject device classes the VMM cannot run.
pub fn check_supported_devices(def: &DomainDef) -> Result<()> {
    let unsupported = &def.unsupported;
    let checks = [
        (unsupported.graphics, "graphics"),
        (unsupported.controllers, "controllers"),
        (unsupported.filesystems, "filesystems"),
        (unsupported.inputs, "inputs"),
        (unsupported.sounds, "sounds"),
        (unsupported.videos, "videos"),
    ];
    for (count, class) in checks {
        if count > 0 {
            return Err(Error::config_unsupported(format!(
                "cloud-hypervisor doesn't support {}",
                class
            )));
        }
    }
    if def.consoles.len() > 1 {
        return Err(Error::config_unsupported(
            "cloud-hypervisor doesn't support multiple consoles",
        ));
    }
    Ok(())
}

fn is_pty(chr: &[ChrDef]) -> bool {
    chr.first().is_some_and(|c| c.chr_type == ChrType::Pty)
}

fn console_configs(def: &DomainDef) -> Result<(ConsoleConfig, ConsoleConfig)> {
    if is_pty(&def.consoles) && is_pty(&def.serials) {
        return Err(Error::config_unsupported(
            "only a single console or serial can be configured for this domain",
        ));
    }
    if def.consoles.len() > 1 {
        return Err(Error::config_unsupported(
            "only a single console can be configured for this domain",
        ));
    }
    if def.serials.len() > 1 {
        return Err(Error::config_unsupported(
            "only a single serial can be configured for this domain",
        ));
    }

    let mode = |pty: bool| ConsoleConfig {
        mode: if pty { ConsoleMode::Pty } else { ConsoleMode::Null },
    };
    Ok((mode(is_pty(&def.consoles)), mode(is_pty(&def.serials))))
}

/// Convert an IPv4 prefix length to a dotted netmask.
pub fn prefix_to_netmask(addr: &IpAddr, prefix: u8) -> Result<String> {
    match addr {
        IpAddr::V4(_) if prefix <= 32 => {
            let bits = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            Ok(Ipv4Addr::from(bits).to_string())
        }
        _ => Err(Error::internal(format!(
            "failed to translate net prefix {} to netmask",
            prefix
        ))),
    }
}

/// Sysfs directory of a PCI device.
pub fn pci_sysfs_path(sysfs: &Path, address: &crate::domain::def::PciAddress) -> PathBuf {
    sysfs.join(format!("bus/pci/devices/{}/", address))
}

/// Build the `vm.create` body.
///
/// `tapfds[i]` holds the fds opened for `def.nets[i]`.
pub fn build_vm_config(def: &DomainDef, tapfds: &[Vec<RawFd>], sysfs: &Path) -> Result<VmConfig> {
    let kernel = def
        .os
        .kernel
        .clone()
        .ok_or_else(|| Error::internal("kernel image path in this domain is not defined"))?;

    let (console, serial) = console_configs(def)?;

    let mut disks = Vec::with_capacity(def.disks.len());
    for disk in &def.disks {
        if disk.disk_type != DiskType::File {
            return Err(Error::config_unsupported(format!(
                "unsupported disk type for '{}'",
                disk.path.display()
            )));
        }
        if disk.bus != DiskBus::Virtio {
            return Err(Error::invalid_argument(format!(
                "only virtio bus types are supported for '{}'",
                disk.path.display()
            )));
        }
        disks.push(DiskConfig {
            path: disk.path.clone(),
            readonly: disk.readonly.then_some(true),
        });
    }

    let mut net = Vec::with_capacity(def.nets.len());
    for (i, netdef) in def.nets.iter().enumerate() {
        let fds = tapfds.get(i).cloned().unwrap_or_default();
        let mut cfg = NetConfig {
            mac: netdef.mac.to_string(),
            fds: Vec::new(),
            ip: None,
            mask: None,
            num_queues: None,
            queue_size: None,
            iommu: netdef.iommu.then_some(true),
            vhost_socket: None,
            vhost_user: None,
        };

        match netdef.net_type {
            NetType::Ethernet => {
                if netdef.ips.len() > 1 {
                    return Err(Error::config_unsupported(
                        "ethernet type supports a single guest ip",
                    ));
                }
                if let [ip] = netdef.host_ips.as_slice() {
                    cfg.ip = Some(ip.address.to_string());
                    cfg.mask = Some(prefix_to_netmask(&ip.address, ip.prefix)?);
                }
            }
            NetType::Vhostuser => {
                let socket_type = netdef.vhost_socket_type.as_deref().unwrap_or("unix");
                let path = netdef.vhost_path.as_ref().filter(|_| socket_type == "unix");
                match path {
                    Some(path) => {
                        cfg.vhost_socket = Some(path.clone());
                        cfg.vhost_user = Some(true);
                    }
                    None => {
                        return Err(Error::config_unsupported(
                            "vhost_user type support UNIX socket in this CH",
                        ))
                    }
                }
            }
            NetType::Network | NetType::Bridge => {}
            other => {
                return Err(Error::config_unsupported(format!(
                    "unsupported network type '{}'",
                    other.name()
                )))
            }
        }

        if !fds.is_empty() {
            cfg.num_queues = Some(2 * fds.len());
        }
        cfg.fds = fds;

        match (netdef.rx_queue_size, netdef.tx_queue_size) {
            (None, None) => {}
            (Some(rx), Some(tx)) if rx == tx => cfg.queue_size = Some(rx),
            (rx, tx) => {
                return Err(Error::config_unsupported(format!(
                    "virtio rx_queue_size option {} is not same with tx_queue_size {}",
                    rx.unwrap_or(0),
                    tx.unwrap_or(0)
                )))
            }
        }

        net.push(cfg);
    }

    let mut devices = Vec::with_capacity(def.hostdevs.len());
    for hostdev in &def.hostdevs {
        if let HostdevSource::Pci { address } = &hostdev.source {
            let path = pci_sysfs_path(sysfs, address);
            if !path.exists() {
                return Err(Error::internal(format!(
                    "host pci device {} not found",
                    path.display()
                )));
            }
            devices.push(DeviceConfig { path });
        }
    }

    Ok(VmConfig {
        cpus: CpusConfig {
            boot_vcpus: def.online_vcpus(),
            max_vcpus: def.max_vcpus(),
        },
        memory: MemoryConfig {
            size: def.memory_kib * 1024,
        },
        kernel: PathConfig { path: kernel },
        cmdline: def.os.cmdline.clone().map(|args| CmdlineConfig { args }),
        initramfs: def.os.initrd.clone().map(|path| PathConfig { path }),
        console,
        serial,
        disks,
        net,
        devices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::def::{DiskDef, IpDef, MacAddr, NetDef};
    use serde_json::json;

    fn net(net_type: NetType) -> NetDef {
        NetDef {
            net_type,
            mac: MacAddr::parse("52:54:00:aa:bb:cc").unwrap(),
            network: None,
            bridge: None,
            ifname: None,
            managed_tap: true,
            tap_path: None,
            mtu: None,
            queues: None,
            rx_queue_size: None,
            tx_queue_size: None,
            iommu: false,
            ips: Vec::new(),
            host_ips: Vec::new(),
            vhost_path: None,
            vhost_socket_type: None,
            script: None,
            model: "virtio".into(),
        }
    }

    fn minimal() -> DomainDef {
        let mut def = DomainDef::new("t1", 1, 131072);
        def.os.kernel = Some("/img/vmlinux".into());
        def.disks.push(DiskDef {
            path: "/img/rootfs".into(),
            readonly: false,
            disk_type: DiskType::File,
            bus: DiskBus::Virtio,
        });
        def.nets.push(net(NetType::Network));
        def
    }

    #[test]
    fn test_minimal_boot_body() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = build_vm_config(&minimal(), &[vec![17]], dir.path()).unwrap();
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(
            value,
            json!({
                "cpus": { "boot_vcpus": 1, "max_vcpus": 1 },
                "memory": { "size": 134217728u64 },
                "kernel": { "path": "/img/vmlinux" },
                "console": { "mode": "Null" },
                "serial": { "mode": "Null" },
                "disks": [ { "path": "/img/rootfs" } ],
                "net": [ { "mac": "52:54:00:aa:bb:cc", "fds": [17], "num_queues": 2 } ]
            })
        );
    }

    #[test]
    fn test_missing_kernel_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut def = minimal();
        def.os.kernel = None;
        let err = build_vm_config(&def, &[], dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn test_console_modes() {
        let dir = tempfile::tempdir().unwrap();
        let pty = ChrDef {
            chr_type: ChrType::Pty,
            path: None,
            alias: None,
        };

        let mut def = minimal();
        def.consoles.push(pty.clone());
        let cfg = build_vm_config(&def, &[], dir.path()).unwrap();
        assert_eq!(cfg.console.mode, ConsoleMode::Pty);
        assert_eq!(cfg.serial.mode, ConsoleMode::Null);

        def.serials.push(pty);
        let err = build_vm_config(&def, &[], dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigUnsupported);
    }

    #[test]
    fn test_queue_sizes_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut def = minimal();
        def.nets[0].rx_queue_size = Some(256);
        def.nets[0].tx_queue_size = Some(256);
        let cfg = build_vm_config(&def, &[vec![3, 4]], dir.path()).unwrap();
        assert_eq!(cfg.net[0].queue_size, Some(256));
        assert_eq!(cfg.net[0].num_queues, Some(4));

        def.nets[0].tx_queue_size = Some(512);
        let err = build_vm_config(&def, &[vec![3]], dir.path()).unwrap_err();
        assert!(err.to_string().contains("not same with"));
    }

    #[test]
    fn test_ethernet_host_ip() {
        let dir = tempfile::tempdir().unwrap();
        let mut def = minimal();
        def.nets[0] = net(NetType::Ethernet);
        def.nets[0].host_ips.push(IpDef {
            address: "192.168.10.1".parse().unwrap(),
            prefix: 24,
        });
        let cfg = build_vm_config(&def, &[vec![5]], dir.path()).unwrap();
        assert_eq!(cfg.net[0].ip.as_deref(), Some("192.168.10.1"));
        assert_eq!(cfg.net[0].mask.as_deref(), Some("255.255.255.0"));

        def.nets[0].ips = vec![
            IpDef { address: "10.0.0.2".parse().unwrap(), prefix: 24 },
            IpDef { address: "10.0.0.3".parse().unwrap(), prefix: 24 },
        ];
        assert!(build_vm_config(&def, &[vec![5]], dir.path()).is_err());
    }

    #[test]
    fn test_vhost_user_needs_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut def = minimal();
        def.nets[0] = net(NetType::Vhostuser);
        def.nets[0].vhost_path = Some("/run/vhost.sock".into());
        let cfg = build_vm_config(&def, &[], dir.path()).unwrap();
        assert_eq!(cfg.net[0].vhost_user, Some(true));
        assert!(cfg.net[0].fds.is_empty());
        assert_eq!(cfg.net[0].num_queues, None);

        def.nets[0].vhost_socket_type = Some("tcp".into());
        assert!(build_vm_config(&def, &[], dir.path()).is_err());
    }

    #[test]
    fn test_user_networking_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut def = minimal();
        def.nets[0] = net(NetType::User);
        let err = build_vm_config(&def, &[], dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigUnsupported);
    }

    #[test]
    fn test_pci_device_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let address = crate::domain::def::PciAddress {
            domain: 0,
            bus: 0x3b,
            slot: 0,
            function: 1,
        };
        let mut def = minimal();
        def.hostdevs.push(crate::domain::def::HostdevDef {
            source: HostdevSource::Pci { address },
            managed: true,
        });
        assert!(build_vm_config(&def, &[vec![3]], dir.path()).is_err());

        std::fs::create_dir_all(pci_sysfs_path(dir.path(), &address)).unwrap();
        let cfg = build_vm_config(&def, &[vec![3]], dir.path()).unwrap();
        assert!(cfg.devices[0].path.ends_with("0000:3b:00.1"));
    }

    #[test]
    fn test_device_validation() {
        let mut def = minimal();
        assert!(check_supported_devices(&def).is_ok());
        def.unsupported.graphics = 1;
        let err = check_supported_devices(&def).unwrap_err();
        assert!(err.to_string().contains("graphics"));
    }

    #[test]
    fn test_vm_info_parsing() {
        let info: VmInfo = serde_json::from_value(json!({
            "state": "Running",
            "config": {
                "console": { "mode": "Pty", "file": "/dev/pts/7" },
                "serial": { "mode": "Null", "file": null }
            },
            "memory_actual_size": 1
        }))
        .unwrap();
        assert_eq!(info.domain_state(), Some(DomainState::Running));
        assert_eq!(info.console_pty(), Some(Path::new("/dev/pts/7")));
        assert_eq!(info.serial_pty(), None);
    }

    #[test]
    fn test_netmask() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(prefix_to_netmask(&v4, 16).unwrap(), "255.255.0.0");
        assert_eq!(prefix_to_netmask(&v4, 0).unwrap(), "0.0.0.0");
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(prefix_to_netmask(&v6, 64).is_err());
    }
}
