//! Per-domain log file.
//!
//! The VMM's stdout/stderr and the driver's event lines share
//! `<log_dir>/<name>.log`.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Handle to a domain log file.
#[derive(Debug, Clone)]
pub struct DomainLog {
    path: PathBuf,
    timestamps: bool,
}

impl DomainLog {
    /// Create a handle; nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>, timestamps: bool) -> Self {
        Self {
            path: path.into(),
            timestamps,
        }
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file for the VMM's output streams.
    pub fn open_for_vmm(&self, truncate: bool) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).mode(0o600);
        if truncate {
            opts.write(true).truncate(true);
        } else {
            opts.append(true);
        }
        Ok(opts.open(&self.path)?)
    }

    /// Format one event line.
    pub fn event_line(&self, source: &str, event: &str, seq: usize) -> String {
        if self.timestamps {
            format!(
                "{}: Source: {} Event: {}, ev: {}\n",
                humantime::format_rfc3339_millis(SystemTime::now()),
                source,
                event,
                seq
            )
        } else {
            format!("Source: {} Event: {}, ev: {}\n", source, event, seq)
        }
    }

    /// Append one event line.
    pub fn append_event(&self, source: &str, event: &str, seq: usize) -> Result<()> {
        let mut file = self.open_for_vmm(false)?;
        file.write_all(self.event_line(source, event, seq).as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_shape() {
        let dir = tempfile::tempdir().unwrap();
        let log = DomainLog::new(dir.path().join("vm1.log"), true);

        log.append_event("vm", "booted", 0).unwrap();
        log.append_event("vmm", "shutdown", 1).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let re = regex::Regex::new(
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z: Source: (vm|vmm) Event: \w+, ev: \d$",
        )
        .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(re.is_match(line), "unexpected line: {}", line);
        }
        assert!(lines[1].ends_with("Source: vmm Event: shutdown, ev: 1"));
    }

    #[test]
    fn test_event_line_without_timestamp() {
        let log = DomainLog::new("/nonexistent/vm.log", false);
        assert_eq!(
            log.event_line("cpu_manager", "create_vcpu", 3),
            "Source: cpu_manager Event: create_vcpu, ev: 3\n"
        );
    }

    #[test]
    fn test_vmm_open_truncates_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let log = DomainLog::new(dir.path().join("logs/vm1.log"), false);
        log.append_event("vm", "booted", 0).unwrap();

        drop(log.open_for_vmm(true).unwrap());
        assert_eq!(std::fs::read_to_string(log.path()).unwrap(), "");
    }
}
