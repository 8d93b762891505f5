//! Running host networking tools.

use crate::error::{Error, Result};
use std::process::Command;

fn display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run a command and return its trimmed stdout.
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    let cmd = display(program, args);
    tracing::trace!(command = %cmd, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::command_failed(&cmd, e.to_string()))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::command_failed(cmd, stderr))
    }
}

/// Run a command, logging failures instead of returning them.
pub fn run_ignore_errors(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args) {
        tracing::debug!(error = %e, "command failed (ignored)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(display("ip", &["link", "set", "up"]), "ip link set up");
    }

    #[test]
    fn test_run_captures_stdout() {
        assert_eq!(run("echo", &["hello"]).unwrap(), "hello");
    }

    #[test]
    fn test_failure_carries_command() {
        let err = run("sh", &["-c", "echo broken >&2; exit 3"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh -c"), "{}", msg);
        assert!(msg.contains("broken"), "{}", msg);
    }

    #[test]
    fn test_missing_program() {
        assert!(run("definitely-not-a-command-xyz", &[]).is_err());
    }
}
