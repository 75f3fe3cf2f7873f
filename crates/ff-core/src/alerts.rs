//! User/developer-visible alert channel
//!
//! Alerts flow through `tracing` under the `alerts` target so embedders can
//! route them to dialogs or status bars with a subscriber filter. Fatal
//! alerts accompany an `Err` on the failing path; they are never swallowed.

use tracing::{error, info, warn};

/// Contract violation or unrecoverable failure.
pub fn fatal(message: &str, title: &str) {
    error!(target: "alerts", title, "{message}");
}

/// Recoverable operational failure the user may want to know about.
pub fn warning(message: &str, title: &str) {
    warn!(target: "alerts", title, "{message}");
}

/// Informational message, e.g. a successful save.
pub fn message(message: &str, title: &str) {
    info!(target: "alerts", title, "{message}");
}
