//! Driver-side handle on one VMM process.
//!
//! A [`Monitor`] bundles the API client, the event loop thread and the last
//! thread snapshot of the VMM. It is created either by launching a new VMM or
//! by reconnecting to one that survived a driver restart.

pub mod body;
pub mod client;
pub mod event_loop;
pub mod events;
pub mod launcher;
pub mod threads;

pub use body::{VmConfig, VmInfo};
pub use client::{ApiClient, Method};
pub use event_loop::{EventHandler, EventSource};
pub use events::{Event, EventBuffer, RawEvent};
pub use threads::{ThreadInfo, ThreadKind, ThreadScanner};

use crate::config::DriverConfig;
use crate::domain::def::DomainDef;
use crate::domain::log::DomainLog;
use crate::error::{Error, Result};
use launcher::LaunchRequest;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const PING_ATTEMPTS: usize = 5;
const PING_DELAY: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Control files of one VMM.
#[derive(Debug, Clone)]
pub struct MonitorPaths {
    /// API socket.
    pub api_socket: PathBuf,
    /// Event FIFO.
    pub fifo: PathBuf,
    /// Pidfile.
    pub pidfile: PathBuf,
    /// Domain log.
    pub log: DomainLog,
}

impl MonitorPaths {
    /// Standard locations for domain `name`.
    pub fn for_domain(config: &DriverConfig, name: &str) -> Self {
        Self {
            api_socket: config.api_socket(name),
            fifo: config.event_fifo(name),
            pidfile: config.pid_file(name),
            log: DomainLog::new(config.log_file(name), config.log_timestamp),
        }
    }
}

/// Handle on a running VMM.
pub struct Monitor {
    client: ApiClient,
    pid: i32,
    paths: MonitorPaths,
    stop: Arc<AtomicBool>,
    events: Mutex<Option<JoinHandle<()>>>,
    threads: Mutex<Vec<ThreadInfo>>,
    scanner: ThreadScanner,
}

impl Monitor {
    /// Launch a VMM and connect to it.
    pub fn launch(
        binary: &Path,
        paths: MonitorPaths,
        tapfds: &[RawFd],
        scanner: ThreadScanner,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self> {
        let pid = launcher::launch(&LaunchRequest {
            binary,
            api_socket: &paths.api_socket,
            fifo: &paths.fifo,
            pidfile: &paths.pidfile,
            log: &paths.log,
            pass_fds: tapfds,
        })?;

        let socket = paths.api_socket.clone();
        let fifo = paths.fifo.clone();
        Self::connect(pid, paths, scanner, handler).map_err(|e| {
            if let Err(kill) = launcher::kill_painfully(pid) {
                tracing::warn!(pid, error = %kill, "cannot kill VMM after failed connect");
            }
            let _ = std::fs::remove_file(&socket);
            let _ = std::fs::remove_file(&fifo);
            e
        })
    }

    /// Attach to a VMM started by an earlier driver instance.
    pub fn reconnect(
        paths: MonitorPaths,
        scanner: ThreadScanner,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self> {
        if !paths.api_socket.exists() {
            return Err(Error::connection(&paths.api_socket, "API socket is missing"));
        }
        let is_fifo = std::fs::symlink_metadata(&paths.fifo)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false);
        if !is_fifo {
            return Err(Error::internal(format!(
                "monitor file {} does not exist or is not a FIFO",
                paths.fifo.display()
            )));
        }
        let pid = launcher::read_pidfile(&paths.pidfile)?;
        if !launcher::pid_alive(pid) {
            return Err(Error::internal(format!("VMM process {} is not running", pid)));
        }
        Self::connect(pid, paths, scanner, handler)
    }

    fn connect(
        pid: i32,
        paths: MonitorPaths,
        scanner: ThreadScanner,
        handler: Box<dyn EventHandler>,
    ) -> Result<Self> {
        // The VMM blocks opening the FIFO until a reader shows up.
        let stop = Arc::new(AtomicBool::new(false));
        let source = EventSource {
            fifo: paths.fifo.clone(),
            pidfile: paths.pidfile.clone(),
            log: paths.log.clone(),
        };
        let handle = event_loop::spawn(pid, source, Arc::clone(&stop), handler)?;

        let monitor = Self {
            client: ApiClient::new(&paths.api_socket),
            pid,
            paths,
            stop,
            events: Mutex::new(Some(handle)),
            threads: Mutex::new(Vec::new()),
            scanner,
        };

        if let Err(e) = monitor.ping_with_retry() {
            monitor.detach();
            return Err(e);
        }
        tracing::debug!(pid, socket = %monitor.paths.api_socket.display(), "monitor connected");
        Ok(monitor)
    }

    fn ping_with_retry(&self) -> Result<()> {
        let mut last = None;
        for attempt in 1..=PING_ATTEMPTS {
            match self.ping() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "VMM ping failed");
                    last = Some(e);
                    std::thread::sleep(PING_DELAY);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::internal("VMM did not answer")))
    }

    /// VMM pid.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Control file locations.
    pub fn paths(&self) -> &MonitorPaths {
        &self.paths
    }

    /// `GET vmm.ping`
    pub fn ping(&self) -> Result<()> {
        let response = self.client.request(Method::Get, "vmm.ping", None)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Api {
                endpoint: "vmm.ping".to_string(),
                status: response.status,
            })
        }
    }

    /// `PUT vm.create`
    pub fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_value(config)?;
        self.client.put("vm.create", Some(&body))?;
        Ok(())
    }

    /// `PUT vm.boot`
    pub fn boot(&self) -> Result<()> {
        self.put_empty("vm.boot")
    }

    /// `PUT vm.shutdown`
    pub fn shutdown(&self) -> Result<()> {
        self.put_empty("vm.shutdown")
    }

    /// `PUT vm.reboot`
    pub fn reboot(&self) -> Result<()> {
        self.put_empty("vm.reboot")
    }

    /// `PUT vm.pause`
    pub fn pause(&self) -> Result<()> {
        self.put_empty("vm.pause")
    }

    /// `PUT vm.resume`
    pub fn resume(&self) -> Result<()> {
        self.put_empty("vm.resume")
    }

    /// `PUT vm.delete`
    pub fn delete(&self) -> Result<()> {
        self.put_empty("vm.delete")
    }

    /// `PUT vmm.shutdown`
    pub fn vmm_shutdown(&self) -> Result<()> {
        self.put_empty("vmm.shutdown")
    }

    /// `PUT vm.resize`
    pub fn resize(&self, vcpus: usize) -> Result<()> {
        let body = serde_json::to_value(body::ResizeConfig {
            desired_vcpus: vcpus,
        })?;
        self.client.put("vm.resize", Some(&body))?;
        Ok(())
    }

    /// `GET vm.info`
    pub fn info(&self) -> Result<VmInfo> {
        let value = self.client.get("vm.info")?;
        Ok(serde_json::from_value(value)?)
    }

    fn put_empty(&self, endpoint: &str) -> Result<()> {
        self.client.put(endpoint, None)?;
        Ok(())
    }

    /// Rescan VMM threads.
    ///
    /// Returns the number of threads when the set changed, 0 otherwise.
    pub fn refresh_threads(&self, def: &DomainDef) -> Result<usize> {
        let mut fresh = self.scanner.scan(self.pid)?;
        for thread in &mut fresh {
            if let ThreadKind::Vcpu { cpu_id, online } = &mut thread.kind {
                *online = def.vcpus.get(*cpu_id).map(|v| v.online).unwrap_or(false);
            }
        }

        let mut snapshot = self.threads.lock();
        if threads::same_tids(&snapshot, &fresh) {
            // Online flags may still have moved after a resize.
            *snapshot = fresh;
            return Ok(0);
        }

        let vcpus = fresh.iter().filter(|t| t.vcpu_id().is_some()).count();
        if vcpus != def.max_vcpus() {
            tracing::warn!(
                pid = self.pid,
                found = vcpus,
                expected = def.max_vcpus(),
                "vcpu thread count does not match the definition"
            );
        }
        *snapshot = fresh;
        Ok(snapshot.len())
    }

    /// Last thread snapshot.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.lock().clone()
    }

    /// Stop the event loop without touching the VMM.
    pub fn detach(&self) {
        self.stop.store(true, Ordering::SeqCst);
        event_loop::wake_reader(&self.paths.fifo);
        self.join_event_loop();
    }

    /// Kill the VMM, remove its socket and FIFO, and stop the event loop.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = launcher::kill_painfully(self.pid) {
            tracing::warn!(pid = self.pid, error = %e, "VMM did not terminate");
        }
        event_loop::wake_reader(&self.paths.fifo);
        let _ = std::fs::remove_file(&self.paths.api_socket);
        let _ = std::fs::remove_file(&self.paths.fifo);
        self.join_event_loop();
    }

    fn join_event_loop(&self) {
        let Some(handle) = self.events.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            event_loop::wake_reader(&self.paths.fifo);
            std::thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::warn!(pid = self.pid, "event loop still busy, detaching it");
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("pid", &self.pid)
            .field("socket", &self.paths.api_socket)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitor::client::tests::FakeApi;
    use crate::monitor::threads::tests::fake_proc;

    pub(crate) struct NoopHandler;

    impl EventHandler for NoopHandler {
        fn rebind(&self, _validate_vcpus: bool) {}
        fn shutdown(&self, _only_if_requested: bool) {}
        fn vmm_gone(&self) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        api: FakeApi,
        paths: MonitorPaths,
        proc_root: PathBuf,
        child: std::process::Child,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = MonitorPaths {
            api_socket: dir.path().join("vm-socket"),
            fifo: dir.path().join("vm-monitor-fifo"),
            pidfile: dir.path().join("vm.pid"),
            log: DomainLog::new(dir.path().join("vm.log"), false),
        };
        let api = FakeApi::start(&paths.api_socket);
        launcher::ensure_fifo(&paths.fifo).unwrap();
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&paths.pidfile, format!("{}\n", child.id())).unwrap();
        let proc_root = dir.path().join("proc");
        Fixture {
            _dir: dir,
            api,
            paths,
            proc_root,
            child,
        }
    }

    #[test]
    fn test_reconnect_pings_and_closes() {
        let mut fx = fixture();
        let monitor = Monitor::reconnect(
            fx.paths.clone(),
            ThreadScanner::new(&fx.proc_root),
            Box::new(NoopHandler),
        )
        .unwrap();
        assert_eq!(monitor.pid(), fx.child.id() as i32);
        assert_eq!(fx.api.paths(), vec!["/api/v1/vmm.ping"]);

        monitor.close();
        assert!(!fx.paths.api_socket.exists());
        assert!(!fx.paths.fifo.exists());
        let _ = fx.child.wait();
    }

    #[test]
    fn test_reconnect_requires_fifo() {
        let mut fx = fixture();
        std::fs::remove_file(&fx.paths.fifo).unwrap();
        let err = Monitor::reconnect(
            fx.paths.clone(),
            ThreadScanner::new(&fx.proc_root),
            Box::new(NoopHandler),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a FIFO"));
        let _ = fx.child.kill();
        let _ = fx.child.wait();
    }

    #[test]
    fn test_endpoints() {
        let mut fx = fixture();
        fx.api.reply("vm.info", 200, r#"{"state":"Running","config":{}}"#);
        let monitor = Monitor::reconnect(
            fx.paths.clone(),
            ThreadScanner::new(&fx.proc_root),
            Box::new(NoopHandler),
        )
        .unwrap();

        monitor.boot().unwrap();
        monitor.pause().unwrap();
        monitor.resume().unwrap();
        monitor.resize(3).unwrap();
        let info = monitor.info().unwrap();
        assert_eq!(info.domain_state(), Some(crate::domain::DomainState::Running));

        let seen = fx.api.seen.lock().clone();
        let resize = seen.iter().find(|s| s.path.ends_with("vm.resize")).unwrap();
        assert_eq!(resize.method, "PUT");
        assert_eq!(resize.body, r#"{"desired_vcpus":3}"#);
        assert_eq!(
            fx.api.paths()[1..5],
            [
                "/api/v1/vm.boot",
                "/api/v1/vm.pause",
                "/api/v1/vm.resume",
                "/api/v1/vm.resize"
            ]
        );

        monitor.close();
        let _ = fx.child.wait();
    }

    #[test]
    fn test_failed_put_reports_status() {
        let mut fx = fixture();
        fx.api.reply("vm.reboot", 500, "");
        let monitor = Monitor::reconnect(
            fx.paths.clone(),
            ThreadScanner::new(&fx.proc_root),
            Box::new(NoopHandler),
        )
        .unwrap();
        let err = monitor.reboot().unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
        monitor.close();
        let _ = fx.child.wait();
    }

    #[test]
    fn test_refresh_threads_reports_changes() {
        let mut fx = fixture();
        let pid = fx.child.id() as i32;
        let monitor = Monitor::reconnect(
            fx.paths.clone(),
            ThreadScanner::new(&fx.proc_root),
            Box::new(NoopHandler),
        )
        .unwrap();

        let mut def = DomainDef::new("vm", 2, 1024);
        def.set_online_vcpus(1);
        fake_proc(&fx.proc_root, pid, &[(pid, "cloud-hyperviso"), (pid + 1, "vcpu0"), (pid + 2, "vcpu1")]);
        assert_eq!(monitor.refresh_threads(&def).unwrap(), 3);
        assert_eq!(monitor.refresh_threads(&def).unwrap(), 0);

        let threads = monitor.threads();
        assert_eq!(
            threads[2].kind,
            ThreadKind::Vcpu {
                cpu_id: 1,
                online: false
            }
        );

        fake_proc(
            &fx.proc_root,
            pid,
            &[(pid, "cloud-hyperviso"), (pid + 1, "vcpu0"), (pid + 2, "vcpu1"), (pid + 3, "virtio-blk")],
        );
        assert_eq!(monitor.refresh_threads(&def).unwrap(), 4);

        monitor.close();
        let _ = fx.child.wait();
    }
}
