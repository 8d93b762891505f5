//! Reader thread for the VMM event FIFO.

use super::events::{Event, EventBuffer, RawEvent};
use super::launcher::pidfile_alive;
use crate::domain::log::DomainLog;
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const OPEN_RETRY: Duration = Duration::from_millis(100);
const EOF_RETRY: Duration = Duration::from_secs(1);

/// Reactions to the event stream.
///
/// Implementations take their own locks and jobs; the loop holds nothing
/// while calling them.
pub trait EventHandler: Send {
    /// Rescan VMM threads and reapply placement.
    fn rebind(&self, validate_vcpus: bool);

    /// Stop the domain after a shutdown event. With `only_if_requested` the
    /// domain is stopped only when a shutdown was asked for.
    fn shutdown(&self, only_if_requested: bool);

    /// The VMM exited without telling us.
    fn vmm_gone(&self);
}

/// Where the loop reads from and writes to.
#[derive(Debug, Clone)]
pub struct EventSource {
    /// Event FIFO.
    pub fifo: PathBuf,
    /// VMM pidfile, checked on EOF.
    pub pidfile: PathBuf,
    /// Per-domain log receiving one line per event.
    pub log: DomainLog,
}

/// Start the reader thread `mon-events-<pid>`.
pub fn spawn(
    pid: i32,
    source: EventSource,
    stop: Arc<AtomicBool>,
    handler: Box<dyn EventHandler>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(format!("mon-events-{}", pid))
        .spawn(move || run(&source, &stop, handler.as_ref()))?;
    Ok(handle)
}

/// Unblock a reader waiting in `open` on the FIFO.
pub fn wake_reader(fifo: &Path) {
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo);
}

/// Apply the reaction for one event.
pub fn dispatch(handler: &dyn EventHandler, kind: &Event) {
    match kind {
        Event::Resized => handler.rebind(false),
        k if k.needs_rebind() => handler.rebind(true),
        Event::VmmShutdown => handler.shutdown(false),
        Event::Shutdown => handler.shutdown(true),
        other => tracing::trace!(event = ?other, "informational event"),
    }
}

fn open_fifo(path: &Path, stop: &AtomicBool) -> Option<File> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match File::open(path) {
            Ok(file) => return Some(file),
            Err(e) if e.kind() == ErrorKind::Interrupted => std::thread::sleep(OPEN_RETRY),
            Err(e) => {
                tracing::error!(fifo = %path.display(), error = %e, "cannot open monitor FIFO");
                return None;
            }
        }
    }
}

fn run(source: &EventSource, stop: &AtomicBool, handler: &dyn EventHandler) {
    let Some(mut fifo) = open_fifo(&source.fifo, stop) else {
        return;
    };
    let mut buf = EventBuffer::new();
    tracing::debug!(fifo = %source.fifo.display(), "event loop running");

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let n = match fifo.read(buf.spare_mut()) {
            Ok(0) => 0,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                tracing::error!(fifo = %source.fifo.display(), error = %e, "cannot read monitor FIFO");
                break;
            }
        };

        if n == 0 && !buf.is_full() {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if pidfile_alive(&source.pidfile).is_none() {
                tracing::info!(pidfile = %source.pidfile.display(), "VMM is gone");
                handler.vmm_gone();
                break;
            }
            std::thread::sleep(EOF_RETRY);
            continue;
        }

        buf.commit(n);
        let scan = buf.validate();
        if (scan.events > 0 && !scan.incomplete) || buf.is_full() {
            for ev in buf.drain() {
                process(source, handler, &ev);
            }
        }
    }
    tracing::debug!(fifo = %source.fifo.display(), "event loop finished");
}

fn process(source: &EventSource, handler: &dyn EventHandler, ev: &RawEvent) {
    let kind = ev.kind();
    let index = kind.index();
    tracing::debug!(source = %ev.source, event = %ev.event, ev = index, "monitor event");
    if let Err(e) = source.log.append_event(&ev.source, &ev.event, index) {
        tracing::warn!(error = %e, "cannot write event to domain log");
    }
    dispatch(handler, &kind);
}
