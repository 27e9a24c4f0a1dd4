//! Host identity used to label log output.

use std::path::Path;

const UNKNOWN_HOST: &str = "unknown";

/// Best-effort name of the machine this process runs on.
///
/// Checks `HOSTNAME`, then `/etc/hostname`, and falls back to `"unknown"`.
pub fn hostname() -> String {
    resolve(std::env::var("HOSTNAME").ok(), Path::new("/etc/hostname"))
}

fn resolve(env_value: Option<String>, hostname_file: &Path) -> String {
    env_value
        .and_then(non_empty)
        .or_else(|| std::fs::read_to_string(hostname_file).ok().and_then(non_empty))
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
