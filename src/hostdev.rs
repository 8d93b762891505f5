//! PCI passthrough bookkeeping.
//!
//! Devices handed to a guest are bound to `vfio-pci` before the VMM starts
//! and given back to their host driver when it stops. The manager tracks
//! which domain holds each device so two guests never share one.

use crate::domain::def::{HostdevDef, HostdevSource, PciAddress};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Driver used for passthrough.
pub const VFIO_DRIVER: &str = "vfio-pci";

/// A PCI device held by a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveDevice {
    owner: String,
    managed: bool,
}

/// Tracks passthrough devices across domains.
#[derive(Debug)]
pub struct HostdevManager {
    sysfs: PathBuf,
    dev_root: PathBuf,
    active: Mutex<HashMap<PciAddress, ActiveDevice>>,
}

fn pci_addresses(hostdevs: &[HostdevDef]) -> Result<Vec<(PciAddress, bool)>> {
    hostdevs
        .iter()
        .map(|h| match &h.source {
            HostdevSource::Pci { address } => Ok((*address, h.managed)),
            HostdevSource::Usb { .. } => Err(Error::config_unsupported(
                "USB host devices are not supported",
            )),
            HostdevSource::Mdev { .. } => Err(Error::config_unsupported(
                "mediated host devices are not supported",
            )),
        })
        .collect()
}

impl HostdevManager {
    /// Manager over `<sysfs>` and `<dev_root>/vfio/vfio`.
    pub fn new(sysfs: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            dev_root: dev_root.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Host has an IOMMU and the VFIO container device.
    pub fn supports_vfio(&self) -> bool {
        let has_iommu = std::fs::read_dir(self.sysfs.join("kernel/iommu_groups"))
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        has_iommu && self.dev_root.join("vfio/vfio").exists()
    }

    fn device_dir(&self, addr: &PciAddress) -> PathBuf {
        self.sysfs.join("bus/pci/devices").join(addr.to_string())
    }

    /// Name of the driver currently bound to a device.
    pub fn current_driver(&self, addr: &PciAddress) -> Option<String> {
        std::fs::read_link(self.device_dir(addr).join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    /// Domain holding a device.
    pub fn owner(&self, addr: &PciAddress) -> Option<String> {
        self.active.lock().get(addr).map(|d| d.owner.clone())
    }

    fn write_attr(path: &Path, value: &str) -> Result<()> {
        std::fs::write(path, value)
            .map_err(|e| Error::internal(format!("cannot write {}: {}", path.display(), e)))
    }

    fn unbind(&self, addr: &PciAddress) -> Result<()> {
        let dir = self.device_dir(addr);
        if self.current_driver(addr).is_some() {
            Self::write_attr(&dir.join("driver/unbind"), &addr.to_string())?;
        }
        Ok(())
    }

    fn bind_vfio(&self, addr: &PciAddress) -> Result<()> {
        if self.current_driver(addr).as_deref() == Some(VFIO_DRIVER) {
            return Ok(());
        }
        let dir = self.device_dir(addr);
        Self::write_attr(&dir.join("driver_override"), VFIO_DRIVER)?;
        self.unbind(addr)?;
        Self::write_attr(&self.sysfs.join("bus/pci/drivers_probe"), &addr.to_string())
    }

    fn rebind_host(&self, addr: &PciAddress) -> Result<()> {
        let dir = self.device_dir(addr);
        Self::write_attr(&dir.join("driver_override"), "\n")?;
        self.unbind(addr)?;
        Self::write_attr(&self.sysfs.join("bus/pci/drivers_probe"), &addr.to_string())
    }

    /// Detach managed devices from the host and mark all of them active.
    pub fn prepare(&self, domain: &str, hostdevs: &[HostdevDef]) -> Result<()> {
        if hostdevs.is_empty() {
            return Ok(());
        }
        let devices = pci_addresses(hostdevs)?;
        if !self.supports_vfio() {
            return Err(Error::config_unsupported(
                "host doesn't support passthrough of host PCI devices",
            ));
        }

        let mut active = self.active.lock();
        for (addr, _) in &devices {
            if !self.device_dir(addr).exists() {
                return Err(Error::invalid_argument(format!("PCI device {} not found", addr)));
            }
            if let Some(dev) = active.get(addr) {
                if dev.owner != domain {
                    return Err(Error::operation_invalid(format!(
                        "PCI device {} is in use by domain {}",
                        addr, dev.owner
                    )));
                }
            }
        }

        let mut done: Vec<PciAddress> = Vec::new();
        for (addr, managed) in &devices {
            if *managed {
                if let Err(e) = self.bind_vfio(addr) {
                    for prev in &done {
                        if let Err(undo) = self.rebind_host(prev) {
                            tracing::warn!(device = %prev, error = %undo, "cannot return device to host");
                        }
                        active.remove(prev);
                    }
                    return Err(e);
                }
            } else if self.current_driver(addr).as_deref() != Some(VFIO_DRIVER) {
                tracing::warn!(device = %addr, "unmanaged device is not bound to {}", VFIO_DRIVER);
            }
            active.insert(
                *addr,
                ActiveDevice {
                    owner: domain.to_string(),
                    managed: *managed,
                },
            );
            if *managed {
                done.push(*addr);
            }
            tracing::debug!(domain, device = %addr, managed, "host device prepared");
        }
        Ok(())
    }

    /// Give a domain's devices back to the host.
    pub fn reattach(&self, domain: &str, hostdevs: &[HostdevDef]) {
        let Ok(devices) = pci_addresses(hostdevs) else {
            return;
        };
        let mut active = self.active.lock();
        for (addr, _) in devices {
            match active.get(&addr) {
                Some(dev) if dev.owner == domain => {
                    if dev.managed {
                        if let Err(e) = self.rebind_host(&addr) {
                            tracing::warn!(device = %addr, error = %e, "cannot reattach device to host");
                        }
                    }
                    active.remove(&addr);
                }
                _ => {}
            }
        }
    }

    /// Record devices of a domain that is already running.
    pub fn update_active(&self, domain: &str, hostdevs: &[HostdevDef]) -> Result<()> {
        let devices = pci_addresses(hostdevs)?;
        let mut active = self.active.lock();
        for (addr, managed) in devices {
            active.insert(
                addr,
                ActiveDevice {
                    owner: domain.to_string(),
                    managed,
                },
            );
        }
        Ok(())
    }
}
