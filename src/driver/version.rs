//! VMM version detection.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::Command;

/// Oldest supported VMM, v0.9.0.
pub const MIN_VERSION: u64 = 9_000;

/// Run `<binary> --version` and encode the result.
pub fn detect(binary: &Path) -> Result<u64> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .map_err(|e| Error::command_failed(format!("{} --version", binary.display()), e.to_string()))?;
    if !output.status.success() {
        return Err(Error::command_failed(
            format!("{} --version", binary.display()),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let version = parse(&String::from_utf8_lossy(&output.stdout))?;
    tracing::debug!(binary = %binary.display(), version, "detected VMM version");
    Ok(version)
}

/// Parse `cloud-hypervisor v<major>.<minor>.<micro>` into
/// `major * 1_000_000 + minor * 1_000 + micro`.
///
/// Missing components count as zero; a suffix after the last number
/// (`-dirty`, `-12-gabcdef`) is ignored.
pub fn parse(output: &str) -> Result<u64> {
    let unexpected = || Error::internal(format!("unexpected output of --version: '{}'", output.trim()));
    let rest = output
        .trim()
        .strip_prefix("cloud-hypervisor")
        .map(str::trim_start)
        .and_then(|r| r.strip_prefix('v'))
        .ok_or_else(unexpected)?;

    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(unexpected());
    }

    let mut parts = [0u64; 3];
    for (slot, part) in parts.iter_mut().zip(rest.split('.')) {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }
        *slot = digits.parse().map_err(|_| unexpected())?;
        if digits.len() != part.len() {
            break;
        }
    }
    let version = parts[0] * 1_000_000 + parts[1] * 1_000 + parts[2];
    if version < MIN_VERSION {
        return Err(Error::internal(
            "Cloud-Hypervisor version is too old (v0.9.0 is the minimum supported version)",
        ));
    }
    Ok(version)
}

/// Render an encoded version as `major.minor.micro`.
pub fn format(version: u64) -> String {
    format!(
        "{}.{}.{}",
        version / 1_000_000,
        (version / 1_000) % 1_000,
        version % 1_000
    )
}
