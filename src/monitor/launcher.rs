//! Spawning and killing the VMM process.
//!
//! The VMM is daemonised with a double fork. The grandchild records its pid,
//! reports it over a pipe and waits for an acknowledgement byte before it
//! execs, so the caller always knows the final pid before the VMM runs.

use crate::domain::log::DomainLog;
use crate::error::{Error, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Time a VMM gets to exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Time a VMM gets to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to start one VMM.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    /// VMM binary.
    pub binary: &'a Path,
    /// API socket to bind and hand over.
    pub api_socket: &'a Path,
    /// Event FIFO.
    pub fifo: &'a Path,
    /// Pidfile written by the daemon.
    pub pidfile: &'a Path,
    /// Destination of stdout/stderr.
    pub log: &'a DomainLog,
    /// Extra fds inherited by the VMM (tap devices).
    pub pass_fds: &'a [RawFd],
}

/// Pick the VMM binary: the definition's emulator, else a PATH lookup.
pub fn resolve_emulator(emulator: Option<&Path>, default: &str) -> Result<PathBuf> {
    match emulator {
        Some(path) if path.is_absolute() => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(Error::internal(format!("emulator {} not found", path.display())))
            }
        }
        Some(path) => which::which(path)
            .map_err(|e| Error::internal(format!("emulator {} not found: {}", path.display(), e))),
        None => which::which(default)
            .map_err(|e| Error::internal(format!("emulator {} not found: {}", default, e))),
    }
}

/// Bind and listen on the API socket, replacing any stale file.
pub fn create_api_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::connection(path, format!("cannot unlink: {}", e))),
    }
    let listener =
        UnixListener::bind(path).map_err(|e| Error::connection(path, format!("cannot bind: {}", e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o664))?;
    Ok(listener)
}

/// Make sure `path` is a FIFO.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_fifo() {
            return Ok(());
        }
        tracing::warn!(path = %path.display(), "monitor file is not a FIFO, replacing it");
        std::fs::remove_file(path)?;
    }
    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(Error::internal(format!(
            "cannot create monitor FIFO {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Command line of the VMM.
pub fn build_args(binary: &Path, api_fd: RawFd, fifo: &Path) -> Vec<String> {
    vec![
        binary.display().to_string(),
        "--api-socket".to_string(),
        format!("fd={}", api_fd),
        "--event-monitor".to_string(),
        format!("path={}", fifo.display()),
    ]
}

/// Start the VMM and return its pid.
///
/// On failure the API socket, the FIFO and the pidfile are removed.
pub fn launch(req: &LaunchRequest<'_>) -> Result<i32> {
    let result = spawn(req);
    if let Err(e) = &result {
        tracing::warn!(binary = %req.binary.display(), error = %e, "VMM failed to start");
        let _ = std::fs::remove_file(req.api_socket);
        let _ = std::fs::remove_file(req.fifo);
        let _ = std::fs::remove_file(req.pidfile);
    }
    result
}

fn spawn(req: &LaunchRequest<'_>) -> Result<i32> {
    if let Some(dir) = req.api_socket.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = create_api_socket(req.api_socket)?;
    ensure_fifo(req.fifo)?;
    let log = req.log.open_for_vmm(false)?;
    let devnull = File::open("/dev/null")?;
    let _ = std::fs::remove_file(req.pidfile);

    let args = build_args(req.binary, listener.as_raw_fd(), req.fifo);
    tracing::debug!(args = ?args, "starting VMM");
    let argv = args
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::invalid_argument(format!("bad VMM argument: {}", e)))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let pidfile = CString::new(req.pidfile.as_os_str().as_bytes())
        .map_err(|e| Error::invalid_argument(format!("bad pidfile path: {}", e)))?;

    let mut inherit: Vec<RawFd> = req.pass_fds.to_vec();
    inherit.push(listener.as_raw_fd());

    let (ready_r, ready_w) = pipe()?;
    let (ack_r, ack_w) = pipe()?;

    let child = unsafe { libc::fork() };
    match child {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => unsafe {
            libc::setsid();
            libc::umask(0o002);
            match libc::fork() {
                0 => {
                    libc::close(ready_r.as_raw_fd());
                    libc::close(ack_w.as_raw_fd());
                    exec_daemon(&Daemon {
                        argv: &argv_ptrs,
                        pidfile: &pidfile,
                        stdin: devnull.as_raw_fd(),
                        output: log.as_raw_fd(),
                        inherit: &inherit,
                        ready: ready_w.as_raw_fd(),
                        ack: ack_r.as_raw_fd(),
                    })
                }
                -1 => libc::_exit(1),
                _ => libc::_exit(0),
            }
        },
        child => {
            drop(ready_w);
            drop(ack_r);
            reap_intermediate(child)?;

            let mut ready = File::from(ready_r);
            let mut buf = [0u8; 4];
            ready
                .read_exact(&mut buf)
                .map_err(|_| Error::internal("process exited prior to exec"))?;
            let pid = i32::from_ne_bytes(buf);

            let recorded = read_pidfile(req.pidfile)?;
            if recorded != pid {
                return Err(Error::internal(format!(
                    "pidfile {} holds {} instead of {}",
                    req.pidfile.display(),
                    recorded,
                    pid
                )));
            }

            File::from(ack_w)
                .write_all(&[1])
                .map_err(|e| Error::internal(format!("cannot notify VMM: {}", e)))?;
            tracing::info!(pid, binary = %req.binary.display(), "VMM started");
            Ok(pid)
        }
    }
}

struct Daemon<'a> {
    argv: &'a [*const libc::c_char],
    pidfile: &'a CString,
    stdin: RawFd,
    output: RawFd,
    inherit: &'a [RawFd],
    ready: RawFd,
    ack: RawFd,
}

/// Runs in the grandchild. Only async-signal-safe calls from here on.
unsafe fn exec_daemon(d: &Daemon<'_>) -> ! {
    libc::dup2(d.stdin, 0);
    libc::dup2(d.output, 1);
    libc::dup2(d.output, 2);
    for fd in d.inherit {
        libc::fcntl(*fd, libc::F_SETFD, 0);
    }

    let pid = libc::getpid();
    let mut digits = [0u8; 16];
    let text = format_pid(pid, &mut digits);
    let fd = libc::open(
        d.pidfile.as_ptr(),
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
        0o644,
    );
    if fd < 0 {
        fail(b"cannot create pidfile\n");
    }
    libc::write(fd, text.as_ptr().cast(), text.len());
    libc::close(fd);

    let bytes = pid.to_ne_bytes();
    if libc::write(d.ready, bytes.as_ptr().cast(), bytes.len()) != bytes.len() as isize {
        fail(b"cannot report pid\n");
    }
    let mut ack = [0u8; 1];
    if libc::read(d.ack, ack.as_mut_ptr().cast(), 1) != 1 {
        libc::_exit(1);
    }

    libc::execv(d.argv[0], d.argv.as_ptr());
    fail(b"exec failed\n");
}

unsafe fn fail(msg: &[u8]) -> ! {
    libc::write(2, msg.as_ptr().cast(), msg.len());
    libc::_exit(127);
}

/// Decimal pid followed by a newline, without allocating.
fn format_pid(pid: i32, buf: &mut [u8; 16]) -> &[u8] {
    let mut n = pid.unsigned_abs();
    let mut pos = buf.len() - 1;
    buf[pos] = b'\n';
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[pos..]
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn reap_intermediate(child: i32) -> Result<()> {
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        Ok(())
    } else {
        Err(Error::internal("failed to daemonize VMM"))
    }
}

/// Read the pid recorded in a pidfile.
pub fn read_pidfile(path: &Path) -> Result<i32> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::internal(format!("cannot read pidfile {}: {}", path.display(), e)))?;
    raw.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| Error::internal(format!("malformed pidfile {}", path.display())))
}

/// Check whether a process exists.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Pid from a pidfile if that process is still alive.
pub fn pidfile_alive(path: &Path) -> Option<i32> {
    read_pidfile(path).ok().filter(|pid| pid_alive(*pid))
}

/// SIGTERM, wait, then SIGKILL.
pub fn kill_painfully(pid: i32) -> Result<()> {
    if !pid_alive(pid) {
        return Ok(());
    }

    tracing::debug!(pid, "sending SIGTERM");
    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
    if wait_gone(pid, TERM_GRACE) {
        return Ok(());
    }

    tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    if wait_gone(pid, KILL_GRACE) {
        return Ok(());
    }
    Err(Error::internal(format!("failed to terminate process {}", pid)))
}

fn wait_gone(pid: i32, grace: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < grace {
        // Reap if it happens to be our child.
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped == pid || !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_build_args() {
        let args = build_args(Path::new("/usr/bin/cloud-hypervisor"), 7, Path::new("/run/vm1-monitor-fifo"));
        assert_eq!(
            args,
            vec![
                "/usr/bin/cloud-hypervisor",
                "--api-socket",
                "fd=7",
                "--event-monitor",
                "path=/run/vm1-monitor-fifo",
            ]
        );
    }

    #[test]
    fn test_format_pid() {
        let mut buf = [0u8; 16];
        assert_eq!(format_pid(4242, &mut buf), b"4242\n");
        assert_eq!(format_pid(0, &mut buf), b"0\n");
    }

    #[test]
    fn test_ensure_fifo_replaces_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-monitor-fifo");
        std::fs::write(&path, "junk").unwrap();

        ensure_fifo(&path).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.mode() & 0o777, 0o600);

        // Existing FIFO is kept.
        ensure_fifo(&path).unwrap();
    }

    #[test]
    fn test_api_socket_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-socket");
        std::fs::write(&path, "stale").unwrap();

        let _listener = create_api_socket(&path).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.mode() & 0o777, 0o664);
    }

    #[test]
    fn test_read_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.pid");
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), 1234);

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_pidfile(&path).is_err());
        assert!(read_pidfile(&dir.path().join("missing.pid")).is_err());
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-1));
    }

    #[test]
    fn test_kill_painfully_terminates_child() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(pid_alive(pid));
        kill_painfully(pid).unwrap();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn test_resolve_emulator_prefers_definition() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("cloud-hypervisor");
        std::fs::write(&binary, "").unwrap();
        let path = resolve_emulator(Some(&binary), "sh").unwrap();
        assert_eq!(path, binary);

        let err = resolve_emulator(Some(Path::new("/opt/ch/missing-vmm")), "sh").unwrap_err();
        assert!(err.to_string().contains("/opt/ch/missing-vmm"));
        assert!(resolve_emulator(None, "definitely-not-a-real-vmm-binary").is_err());
    }

    #[test]
    fn test_launch_daemonizes_and_writes_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake-vmm");
        std::fs::write(&binary, "#!/bin/sh\necho started \"$@\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log = DomainLog::new(dir.path().join("log/vm1.log"), false);
        let req = LaunchRequest {
            binary: &binary,
            api_socket: &dir.path().join("run/vm1-socket"),
            fifo: &dir.path().join("run/vm1-monitor-fifo"),
            pidfile: &dir.path().join("run/vm1.pid"),
            log: &log,
            pass_fds: &[],
        };
        let pid = launch(&req).unwrap();
        assert_eq!(read_pidfile(req.pidfile).unwrap(), pid);
        assert!(pid_alive(pid));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut output = String::new();
        while Instant::now() < deadline {
            output = std::fs::read_to_string(log.path()).unwrap_or_default();
            if output.contains("started") {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(output.contains("--api-socket fd="), "log was {:?}", output);
        assert!(output.contains("--event-monitor path="));

        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }

    #[test]
    fn test_failed_launch_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let log = DomainLog::new(dir.path().join("vm1.log"), false);
        let req = LaunchRequest {
            binary: Path::new("/bin/true"),
            api_socket: &dir.path().join("vm1-socket"),
            fifo: &dir.path().join("vm1-monitor-fifo"),
            pidfile: &dir.path().join("missing/vm1.pid"),
            log: &log,
            pass_fds: &[],
        };
        assert!(launch(&req).is_err());
        assert!(!req.api_socket.exists());
        assert!(!req.fifo.exists());
        assert!(!req.pidfile.exists());
    }
}
