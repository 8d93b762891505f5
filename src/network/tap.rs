//! tap devices through the tun driver.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

/// Default clone device.
pub const DEFAULT_TUN_PATH: &str = "/dev/net/tun";

/// Kernel interface name limit, including the NUL.
pub const IFNAMSIZ: usize = 16;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

nix::ioctl_write_int!(tun_set_iff, b'T', 202);

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ {
            return Err(Error::invalid_argument(format!(
                "interface name '{}' is too long",
                name
            )));
        }
        let mut req = Self {
            name: [0; IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        req.name[..bytes.len()].copy_from_slice(bytes);
        Ok(req)
    }

    fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// tun flags for a tap with `queues` queues.
pub fn tap_flags(queues: usize, vnet_hdr: bool) -> libc::c_short {
    let mut flags = IFF_TAP | IFF_NO_PI;
    if vnet_hdr {
        flags |= IFF_VNET_HDR;
    }
    if queues > 1 {
        flags |= IFF_MULTI_QUEUE;
    }
    flags
}

/// Create (or attach to) tap `name` and open `queues` fds on it.
///
/// `name` may be a template such as `vnet%d`; the kernel-chosen name is
/// returned.
pub fn create_tap(
    tun_path: &Path,
    name: &str,
    queues: usize,
    vnet_hdr: bool,
) -> Result<(String, Vec<OwnedFd>)> {
    let queues = queues.max(1);
    let flags = tap_flags(queues, vnet_hdr);
    let mut actual = name.to_string();
    let mut fds = Vec::with_capacity(queues);

    for _ in 0..queues {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tun_path)
            .map_err(|e| {
                Error::internal(format!("unable to open {}: {}", tun_path.display(), e))
            })?;
        let mut req = IfReq::new(&actual, flags)?;
        unsafe { tun_set_iff(file.as_raw_fd(), &mut req as *mut IfReq as _) }.map_err(|e| {
            Error::internal(format!("unable to create tap device {}: {}", actual, e))
        })?;
        actual = req.name();
        fds.push(OwnedFd::from(file));
    }

    tracing::debug!(ifname = %actual, queues, "tap device ready");
    Ok((actual, fds))
}
