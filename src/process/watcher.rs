//! Periodic thread rescan of an active domain.

use crate::domain::{Domain, JobKind};
use crate::driver::Driver;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Interval between rescans.
pub const TICK: Duration = Duration::from_secs(1);

/// How long a tick waits for the domain job before skipping.
const TICK_JOB_TIMEOUT: Duration = Duration::from_millis(500);

/// Owner side of a watcher thread.
#[derive(Debug)]
pub struct WatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Start watching `domain`.
    pub fn spawn(driver: &Arc<Driver>, domain: &Arc<Domain>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let driver = Arc::downgrade(driver);
        let weak = Arc::downgrade(domain);

        let thread = std::thread::Builder::new()
            .name(format!("ch-watch-{}", domain.name()))
            .spawn(move || watch(driver, weak, flag))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Whether the thread has been told to stop.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        thread.thread().unpark();
        if thread.join().is_err() {
            tracing::warn!("watcher thread panicked");
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch(driver: Weak<Driver>, domain: Weak<Domain>, stop: Arc<AtomicBool>) {
    tracing::debug!("watcher started");
    loop {
        std::thread::park_timeout(TICK);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let (Some(driver), Some(domain)) = (driver.upgrade(), domain.upgrade()) else {
            break;
        };
        if !domain.is_active() {
            break;
        }
        tick(&driver, &domain, &stop);
    }
    tracing::debug!("watcher stopped");
}

fn tick(driver: &Arc<Driver>, domain: &Arc<Domain>, stop: &AtomicBool) {
    let Ok(_job) = domain.begin_job(JobKind::Modify, TICK_JOB_TIMEOUT) else {
        tracing::trace!(domain = %domain.name(), "domain busy, skipping rescan");
        return;
    };
    if stop.load(Ordering::SeqCst) || !domain.is_active() {
        return;
    }
    match super::refresh_and_bind(driver, domain, true) {
        Ok(true) => tracing::debug!(domain = %domain.name(), "thread set changed, rebound"),
        Ok(false) => {}
        Err(e) => tracing::warn!(domain = %domain.name(), error = %e, "rescan failed"),
    }
}
