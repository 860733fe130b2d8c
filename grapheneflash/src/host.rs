//! Host-side utilities: locating and checking the adb/fastboot binaries.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeout for `<tool> --version`.
pub const TOOL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default adb binary name, resolved through `PATH`.
pub const ADB: &str = "adb";

/// Default fastboot binary name, resolved through `PATH`.
pub const FASTBOOT: &str = "fastboot";

/// Find `name` in the directories listed in `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Path to use for `name` when none is configured.
///
/// Falls back to the bare name so the OS lookup produces the error.
pub fn default_tool_path(name: &str) -> PathBuf {
    find_in_path(name).unwrap_or_else(|| PathBuf::from(name))
}

/// Run `<tool> --version` and return its first output line.
#[cfg(feature = "native")]
pub fn check_tool(tool: &Path) -> Result<String> {
    use std::process::Command;

    let unavailable = |reason: String| Error::ToolUnavailable {
        tool: tool.display().to_string(),
        reason,
    };

    let mut cmd = Command::new(tool);
    cmd.arg("--version");
    let output = crate::port::native::output_with_timeout(&mut cmd, TOOL_CHECK_TIMEOUT)
        .map_err(|e| unavailable(e.to_string()))?
        .ok_or_else(|| {
            unavailable(format!(
                "--version did not finish within {}s",
                TOOL_CHECK_TIMEOUT.as_secs()
            ))
        })?;

    if !output.status.success() {
        return Err(unavailable(format!("--version exited with {}", output.status)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Tool checks need process spawning; without it every tool is unavailable.
#[cfg(not(feature = "native"))]
pub fn check_tool(tool: &Path) -> Result<String> {
    Err(Error::ToolUnavailable {
        tool: tool.display().to_string(),
        reason: "built without the `native` feature".to_string(),
    })
}
