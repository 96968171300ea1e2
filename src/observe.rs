//! Observer handle for long-running flows
//!
//! The wizard and the scanner report what they are doing through an
//! [`Observer`] passed in by the caller. The default is silent; the CLI
//! installs [`TracingObserver`].

use std::sync::Arc;

use tracing::{debug, info, warn};

/// Receives structured notifications from the wizard and the scanner.
pub trait Observer: Send + Sync {
    /// A step of `flow` started.
    fn step(&self, _flow: &str, _step: &str) {}

    /// Progress of `flow`, 0 to 100.
    fn progress(&self, _flow: &str, _percent: u8) {}

    /// Something was skipped or degraded but the flow continues.
    fn degraded(&self, _flow: &str, _what: &str, _reason: &str) {}

    /// `flow` finished; `ok` is false when it failed.
    fn finished(&self, _flow: &str, _ok: bool) {}
}

pub type ObserverHandle = Arc<dyn Observer>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Observer for Silent {}

pub fn silent() -> ObserverHandle {
    Arc::new(Silent)
}

/// Forwards notifications to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn step(&self, flow: &str, step: &str) {
        info!(flow, step, "step");
    }

    fn progress(&self, flow: &str, percent: u8) {
        debug!(flow, percent, "progress");
    }

    fn degraded(&self, flow: &str, what: &str, reason: &str) {
        warn!(flow, what, reason, "degraded");
    }

    fn finished(&self, flow: &str, ok: bool) {
        if ok {
            info!(flow, "finished");
        } else {
            warn!(flow, "failed");
        }
    }
}
