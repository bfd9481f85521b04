//! Mapping of sidecar error markers onto CSI status codes.

use daos_csi_common::error::CsiError;

/// Marker text dfuse prints when its command line is wrong.
const USAGE_MARKER: &str = "Incorrect Usage";

/// Exit description of a daemon killed with `SIGKILL` (usually the OOM
/// killer).
const KILLED_MARKER: &str = "signal: killed";

/// Classifies the content of a sidecar error file.
///
/// A kill wins over a usage error when both appear, since the kill is the
/// last thing the sidecar observed.
pub fn classify_sidecar_error(message: &str) -> CsiError {
    let message = message.trim_end().to_string();
    if message.contains(KILLED_MARKER) {
        CsiError::SidecarKilled { message }
    } else if message.contains(USAGE_MARKER) {
        CsiError::SidecarUsage { message }
    } else {
        CsiError::SidecarFailed { message }
    }
}
