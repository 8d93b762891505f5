//! chvirt - Cloud-Hypervisor domain runtime.
//!
//! This crate drives `cloud-hypervisor` VMM processes for a virtualization
//! daemon: it launches and reconnects to VMMs, talks to their HTTP API over a
//! UNIX socket, follows their event stream, and places their threads with
//! cgroups and CPU affinity.
//!
//! The entry point is [`driver::ChDriver`], which implements the
//! [`driver::HypervisorDriver`] capability interface.

pub mod bitmap;
pub mod cgroup;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod host;
pub mod hostdev;
pub mod hotplug;
pub mod monitor;
pub mod network;
pub mod process;

pub use error::{Error, ErrorKind, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
