//! Guest definitions.
//!
//! A [`DomainDef`] is the JSON document a caller hands to `define` or
//! `create`. The same type is written back as the persistent config and as
//! part of the live status document.

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use uuid::Uuid;

/// Complete definition of one guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainDef {
    /// Guest name, unique per driver.
    pub name: String,

    /// Stable identity.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,

    /// VMM binary override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<PathBuf>,

    /// Guest memory in KiB.
    pub memory_kib: u64,

    /// Virtual CPUs; the length is the maximum vcpu count.
    #[serde(deserialize_with = "deserialize_vcpus")]
    pub vcpus: Vec<VcpuDef>,

    /// Domain-wide CPU mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpumask: Option<Bitmap>,

    /// CPU placement mode.
    #[serde(default)]
    pub placement: Placement,

    /// Boot configuration.
    #[serde(default)]
    pub os: OsDef,

    /// Block devices.
    #[serde(default)]
    pub disks: Vec<DiskDef>,

    /// Network interfaces.
    #[serde(default)]
    pub nets: Vec<NetDef>,

    /// Passthrough host devices.
    #[serde(default)]
    pub hostdevs: Vec<HostdevDef>,

    /// Console devices.
    #[serde(default)]
    pub consoles: Vec<ChrDef>,

    /// Serial devices.
    #[serde(default)]
    pub serials: Vec<ChrDef>,

    /// CPU tuning.
    #[serde(default)]
    pub cputune: CpuTune,

    /// NUMA memory placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numatune: Option<NumaTune>,

    /// Memory limits.
    #[serde(default)]
    pub memtune: MemTune,

    /// Block I/O tuning.
    #[serde(default)]
    pub blkio: BlkioTune,

    /// cgroup partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceDef>,

    /// Devices the definition format can express but the VMM cannot run.
    #[serde(default, skip_serializing_if = "UnsupportedDevices::is_empty")]
    pub unsupported: UnsupportedDevices,
}

/// One virtual CPU.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VcpuDef {
    /// Whether the vcpu is plugged in.
    pub online: bool,

    /// Pinning mask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpumask: Option<Bitmap>,

    /// Scheduler for this vcpu's thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched: Option<SchedDef>,
}

/// Scheduler policy and priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedDef {
    /// Policy.
    pub policy: SchedPolicy,
    /// Real-time priority (fifo/rr only).
    #[serde(default)]
    pub priority: i32,
}

/// Linux scheduler policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_OTHER.
    Other,
    /// SCHED_BATCH.
    Batch,
    /// SCHED_IDLE.
    Idle,
    /// SCHED_FIFO.
    Fifo,
    /// SCHED_RR.
    Rr,
}

impl SchedPolicy {
    /// The libc policy constant.
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Rr => libc::SCHED_RR,
        }
    }
}

/// CPU placement mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Masks come from the definition.
    #[default]
    Static,
    /// Masks are computed by the driver.
    Auto,
}

/// Boot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OsDef {
    /// Kernel image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    /// Initramfs image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<PathBuf>,
    /// Kernel command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

/// Disk bus.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    /// virtio-blk.
    #[default]
    Virtio,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// Disk source type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// Plain file.
    #[default]
    File,
    /// Block device.
    Block,
    /// Network volume.
    Network,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// One disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskDef {
    /// Image path.
    pub path: PathBuf,
    /// Read-only flag.
    #[serde(default)]
    pub readonly: bool,
    /// Source type.
    #[serde(default, rename = "type")]
    pub disk_type: DiskType,
    /// Bus.
    #[serde(default)]
    pub bus: DiskBus,
}

/// Network interface type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    /// Pre-made or driver-made tap with no bridge.
    Ethernet,
    /// Tap attached to a host bridge.
    Bridge,
    /// Named network resolved to a bridge.
    Network,
    /// vhost-user backend.
    Vhostuser,
    /// User-mode networking.
    User,
    /// macvtap.
    Direct,
    /// Passthrough NIC.
    Hostdev,
    /// Anything else.
    #[serde(other)]
    Other,
}

impl NetType {
    /// Type name as written in definitions.
    pub fn name(&self) -> &'static str {
        match self {
            NetType::Ethernet => "ethernet",
            NetType::Bridge => "bridge",
            NetType::Network => "network",
            NetType::Vhostuser => "vhostuser",
            NetType::User => "user",
            NetType::Direct => "direct",
            NetType::Hostdev => "hostdev",
            NetType::Other => "other",
        }
    }
}

/// An IP address with prefix length.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpDef {
    /// Address.
    pub address: std::net::IpAddr,
    /// Prefix length.
    #[serde(default)]
    pub prefix: u8,
}

/// One network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetDef {
    /// Interface type.
    #[serde(rename = "type")]
    pub net_type: NetType,
    /// Guest MAC address.
    pub mac: MacAddr,
    /// Network name (type network).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Bridge name (type bridge, or resolved from a network).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Host-side interface name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
    /// Whether the driver creates the tap.
    #[serde(default = "default_true")]
    pub managed_tap: bool,
    /// Custom tun device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_path: Option<PathBuf>,
    /// MTU for the host side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// virtio queue pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queues: Option<usize>,
    /// rx queue size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_queue_size: Option<u32>,
    /// tx queue size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_queue_size: Option<u32>,
    /// IOMMU for the device.
    #[serde(default)]
    pub iommu: bool,
    /// Guest-side addresses (ethernet).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpDef>,
    /// Host-side addresses (ethernet).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_ips: Vec<IpDef>,
    /// vhost-user socket path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost_path: Option<PathBuf>,
    /// vhost-user socket type; only `unix` is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost_socket_type: Option<String>,
    /// Script run after the tap comes up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Device model.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "virtio".to_string()
}

impl NetDef {
    /// Whether the model is virtio.
    pub fn is_virtio(&self) -> bool {
        self.model == "virtio"
    }

    /// Number of tap queues to open.
    pub fn tap_queues(&self) -> usize {
        self.queues.filter(|q| *q > 0).unwrap_or(1)
    }
}

/// Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Parse `aa:bb:cc:dd:ee:ff`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::invalid_argument(format!("invalid mac address '{}'", s)));
        }
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| Error::invalid_argument(format!("invalid mac address '{}'", s)))?;
        }
        Ok(Self(out))
    }

    /// MAC for the host side of a tap: the guest MAC with a distinct first byte.
    pub fn tap_side(&self) -> MacAddr {
        let mut addr = self.0;
        addr[0] = if addr[0] == 0xFE { 0xFA } else { 0xFE };
        MacAddr(addr)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MacAddr::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// PCI address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PciAddress {
    /// Domain.
    #[serde(default)]
    pub domain: u16,
    /// Bus.
    pub bus: u8,
    /// Slot.
    pub slot: u8,
    /// Function.
    pub function: u8,
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// Host device source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostdevSource {
    /// PCI function.
    Pci {
        /// Address.
        address: PciAddress,
    },
    /// USB device.
    Usb {
        /// Bus number.
        bus: u16,
        /// Device number.
        device: u16,
    },
    /// Mediated device.
    Mdev {
        /// mdev UUID.
        uuid: Uuid,
    },
}

/// One passthrough host device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostdevDef {
    /// Source.
    pub source: HostdevSource,
    /// Driver detaches and reattaches the device.
    #[serde(default = "default_true")]
    pub managed: bool,
}

/// Character device backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChrType {
    /// Pseudo terminal.
    Pty,
    /// Discard.
    Null,
    /// File.
    File,
    /// UNIX socket.
    Unix,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// One console or serial device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChrDef {
    /// Backend type.
    #[serde(rename = "type")]
    pub chr_type: ChrType,
    /// Live PTY path, filled in from the VMM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Device alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// CPU tuning knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuTune {
    /// cpu shares for the whole domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// vcpu bandwidth period (µs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// vcpu bandwidth quota (µs, negative = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// Domain-wide period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_period: Option<u64>,
    /// Domain-wide quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_quota: Option<i64>,
    /// Emulator thread period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator_period: Option<u64>,
    /// Emulator thread quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator_quota: Option<i64>,
    /// I/O thread period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iothread_period: Option<u64>,
    /// I/O thread quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iothread_quota: Option<i64>,
    /// Emulator pinning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulatorpin: Option<Bitmap>,
    /// Emulator scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulatorsched: Option<SchedDef>,
}

/// NUMA memory mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NumaMode {
    /// Allocate only from the nodeset.
    #[default]
    Strict,
    /// Prefer the nodeset.
    Preferred,
    /// Interleave across the nodeset.
    Interleave,
    /// Restrict through cgroups only.
    Restrictive,
}

/// NUMA tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NumaTune {
    /// Memory mode.
    #[serde(default)]
    pub mode: NumaMode,
    /// Explicit nodeset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodeset: Option<Bitmap>,
    /// Nodeset placement.
    #[serde(default)]
    pub placement: Placement,
}

/// Memory limits, all in KiB.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemTune {
    /// Hard limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_limit_kib: Option<u64>,
    /// Soft limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_limit_kib: Option<u64>,
    /// Swap hard limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_hard_limit_kib: Option<u64>,
}

impl MemTune {
    /// True when any limit is set.
    pub fn is_set(&self) -> bool {
        self.hard_limit_kib.is_some()
            || self.soft_limit_kib.is_some()
            || self.swap_hard_limit_kib.is_some()
    }
}

/// Block I/O tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlkioTune {
    /// Weight, 100..=1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// cgroup partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDef {
    /// Absolute partition path, e.g. `/machine`.
    pub partition: String,
}

/// Counts of device classes the VMM cannot run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnsupportedDevices {
    /// Graphics adapters.
    pub graphics: usize,
    /// Explicit controllers.
    pub controllers: usize,
    /// Shared filesystems.
    pub filesystems: usize,
    /// Input devices.
    pub inputs: usize,
    /// Sound cards.
    pub sounds: usize,
    /// Video adapters.
    pub videos: usize,
}

impl UnsupportedDevices {
    /// True when no unsupported device is present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VcpusRepr {
    Count(usize),
    Sized { max: usize, current: usize },
    List(Vec<VcpuDef>),
}

fn deserialize_vcpus<'de, D>(deserializer: D) -> std::result::Result<Vec<VcpuDef>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match VcpusRepr::deserialize(deserializer)? {
        VcpusRepr::Count(n) => vcpu_list(n, n),
        VcpusRepr::Sized { max, current } => vcpu_list(max, current),
        VcpusRepr::List(list) => list,
    })
}

fn vcpu_list(max: usize, current: usize) -> Vec<VcpuDef> {
    (0..max)
        .map(|i| VcpuDef {
            online: i < current,
            ..Default::default()
        })
        .collect()
}

impl DomainDef {
    /// Create a minimal definition.
    pub fn new(name: impl Into<String>, vcpus: usize, memory_kib: u64) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            emulator: None,
            memory_kib,
            vcpus: vcpu_list(vcpus, vcpus),
            cpumask: None,
            placement: Placement::Static,
            os: OsDef::default(),
            disks: Vec::new(),
            nets: Vec::new(),
            hostdevs: Vec::new(),
            consoles: Vec::new(),
            serials: Vec::new(),
            cputune: CpuTune::default(),
            numatune: None,
            memtune: MemTune::default(),
            blkio: BlkioTune::default(),
            resource: None,
            unsupported: UnsupportedDevices::default(),
        }
    }

    /// Parse a JSON definition and validate it.
    pub fn from_json(raw: &str) -> Result<Self> {
        let def: DomainDef = serde_json::from_str(raw)
            .map_err(|e| Error::invalid_argument(format!("malformed domain definition: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("domain name must not be empty"));
        }
        if self.name.contains(['\n', '/']) {
            return Err(Error::invalid_argument(format!(
                "domain name '{}' contains illegal characters",
                self.name.escape_debug()
            )));
        }
        if self.memory_kib == 0 {
            return Err(Error::invalid_argument("memory must be greater than zero"));
        }
        if self.vcpus.is_empty() {
            return Err(Error::invalid_argument("at least one vcpu is required"));
        }
        if self.online_vcpus() == 0 {
            return Err(Error::invalid_argument("at least one vcpu must be online"));
        }
        if let Some(resource) = &self.resource {
            if !resource.partition.starts_with('/') {
                return Err(Error::config_unsupported(format!(
                    "resource partition '{}' must start with '/'",
                    resource.partition
                )));
            }
        }
        Ok(())
    }

    /// Maximum vcpu count.
    pub fn max_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    /// Number of online vcpus.
    pub fn online_vcpus(&self) -> usize {
        self.vcpus.iter().filter(|v| v.online).count()
    }

    /// Mark the first `n` vcpus online and the rest offline.
    pub fn set_online_vcpus(&mut self, n: usize) {
        for (i, vcpu) in self.vcpus.iter_mut().enumerate() {
            vcpu.online = i < n;
        }
    }

    /// Resize the vcpu list, keeping existing entries.
    pub fn set_max_vcpus(&mut self, max: usize) {
        self.vcpus.resize_with(max, VcpuDef::default);
    }

    /// Strict NUMA nodeset, if the definition requests one.
    pub fn strict_nodeset(&self, auto_nodeset: Option<&Bitmap>) -> Option<Bitmap> {
        let tune = self.numatune.as_ref()?;
        if tune.mode != NumaMode::Strict {
            return None;
        }
        match tune.placement {
            Placement::Auto => auto_nodeset.cloned(),
            Placement::Static => tune.nodeset.clone(),
        }
    }

    /// Resource partition, defaulting to `/machine`.
    pub fn partition(&self) -> &str {
        self.resource
            .as_ref()
            .map(|r| r.partition.as_str())
            .unwrap_or("/machine")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "name": "t1",
        "vcpus": 1,
        "memory_kib": 131072,
        "os": { "kernel": "/img/vmlinux" },
        "disks": [ { "path": "/img/rootfs", "readonly": false } ],
        "nets": [ { "type": "network", "mac": "52:54:00:11:22:33", "network": "default" } ]
    }"#;

    #[test]
    fn test_parse_minimal() {
        let def = DomainDef::from_json(MINIMAL).unwrap();
        assert_eq!(def.name, "t1");
        assert_eq!(def.max_vcpus(), 1);
        assert_eq!(def.online_vcpus(), 1);
        assert_eq!(def.nets[0].net_type, NetType::Network);
        assert!(def.nets[0].managed_tap);
        assert!(def.nets[0].is_virtio());
        assert_eq!(def.nets[0].tap_queues(), 1);
        assert_eq!(def.disks[0].bus, DiskBus::Virtio);
        assert_eq!(def.partition(), "/machine");
    }

    #[test]
    fn test_vcpu_forms() {
        let sized: DomainDef = serde_json::from_str(
            r#"{"name":"a","memory_kib":1,"vcpus":{"max":4,"current":1}}"#,
        )
        .unwrap();
        assert_eq!(sized.max_vcpus(), 4);
        assert_eq!(sized.online_vcpus(), 1);

        let list: DomainDef = serde_json::from_str(
            r#"{"name":"a","memory_kib":1,"vcpus":[{"online":true,"cpumask":"2-3"},{"online":false}]}"#,
        )
        .unwrap();
        assert_eq!(list.vcpus[0].cpumask.as_ref().unwrap().format(), "2-3");
        assert!(!list.vcpus[1].online);
    }

    #[test]
    fn test_set_online_vcpus() {
        let mut def = DomainDef::new("a", 4, 1024);
        def.set_online_vcpus(3);
        let online: Vec<bool> = def.vcpus.iter().map(|v| v.online).collect();
        assert_eq!(online, vec![true, true, true, false]);
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let mut def = DomainDef::new("bad\nname", 1, 1024);
        assert!(def.validate().is_err());

        def.name = "ok".into();
        def.memory_kib = 0;
        assert!(def.validate().is_err());

        def.memory_kib = 1024;
        def.set_online_vcpus(0);
        assert!(def.validate().is_err());

        def.set_online_vcpus(1);
        def.resource = Some(ResourceDef {
            partition: "machine".into(),
        });
        let err = def.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigUnsupported);
    }

    #[test]
    fn test_malformed_json_is_invalid_argument() {
        let err = DomainDef::from_json("{").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_mac_parse_and_tap_side() {
        let mac = MacAddr::parse("52:54:00:11:22:33").unwrap();
        assert_eq!(mac.to_string(), "52:54:00:11:22:33");
        assert_eq!(mac.tap_side().to_string(), "fe:54:00:11:22:33");

        let fe = MacAddr::parse("fe:00:00:00:00:01").unwrap();
        assert_eq!(fe.tap_side().0[0], 0xFA);

        assert!(MacAddr::parse("52:54:00").is_err());
        assert!(MacAddr::parse("zz:54:00:11:22:33").is_err());
    }

    #[test]
    fn test_pci_address_display() {
        let addr = PciAddress {
            domain: 0,
            bus: 0x3b,
            slot: 0,
            function: 1,
        };
        assert_eq!(addr.to_string(), "0000:3b:00.1");
    }

    #[test]
    fn test_strict_nodeset() {
        let mut def = DomainDef::new("a", 1, 1024);
        assert!(def.strict_nodeset(None).is_none());

        def.numatune = Some(NumaTune {
            mode: NumaMode::Strict,
            nodeset: Some(Bitmap::parse("1").unwrap()),
            placement: Placement::Static,
        });
        assert_eq!(def.strict_nodeset(None).unwrap().format(), "1");

        let auto = Bitmap::parse("0").unwrap();
        def.numatune.as_mut().unwrap().placement = Placement::Auto;
        assert_eq!(def.strict_nodeset(Some(&auto)).unwrap().format(), "0");

        def.numatune.as_mut().unwrap().mode = NumaMode::Interleave;
        assert!(def.strict_nodeset(Some(&auto)).is_none());
    }

    #[test]
    fn test_serialization_roundtrip_keeps_vcpu_list() {
        let def = DomainDef::from_json(MINIMAL).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let back: DomainDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
