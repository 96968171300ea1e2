//! Evaluation budget and structured helper failures

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use handlebars::RenderError;

use crate::discovery::DiscoveryError;

/// Default number of helper calls plus output writes per render.
pub const DEFAULT_MAX_STEPS: u64 = 100_000;

/// Default cap on rendered output.
pub const DEFAULT_MAX_OUTPUT: usize = 4 * 1024 * 1024;

/// Why a helper aborted the render, kept beside the opaque `RenderError`.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    TooComplex(String),
    Discovery { fact: String, source: DiscoveryError },
    SecretPathMissing(String),
    SecretsMissing(String),
    Eval { message: String, path: Option<String> },
}

/// First failure recorded during a render.
#[derive(Debug, Clone, Default)]
pub struct FailureSlot(Arc<Mutex<Option<Failure>>>);

impl FailureSlot {
    /// Record `failure` unless an earlier one is already there.
    pub fn record(&self, failure: Failure) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    pub fn take(&self) -> Option<Failure> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Record and turn into the error handlebars expects from a helper.
    pub fn fail(&self, failure: Failure) -> RenderError {
        let message = match &failure {
            Failure::TooComplex(reason) => reason.clone(),
            Failure::Discovery { fact, source } => format!("discovered \"{fact}\": {source}"),
            Failure::SecretPathMissing(path) => format!("secret \"{path}\" not found"),
            Failure::SecretsMissing(path) => {
                format!("secret \"{path}\" requested while rendering without secrets")
            }
            Failure::Eval { message, .. } => message.clone(),
        };
        self.record(failure);
        RenderError::new(message)
    }
}

/// Step counter shared by every metered helper and the output writer.
#[derive(Debug)]
pub struct Budget {
    used: AtomicU64,
    limit: u64,
    failures: FailureSlot,
}

impl Budget {
    pub fn new(limit: u64, failures: FailureSlot) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
            failures,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Consume one step.
    pub fn tick(&self) -> Result<(), RenderError> {
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.limit {
            return Err(self.failures.fail(Failure::TooComplex(format!(
                "evaluation budget of {} steps exhausted",
                self.limit
            ))));
        }
        Ok(())
    }
}

/// Output sink that charges every write to the budget and caps total size.
pub struct BoundedWriter {
    buffer: Vec<u8>,
    budget: Arc<Budget>,
    failures: FailureSlot,
    max_bytes: usize,
}

impl BoundedWriter {
    pub fn new(budget: Arc<Budget>, failures: FailureSlot, max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            budget,
            failures,
            max_bytes,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl io::Write for BoundedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.budget
            .tick()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if self.buffer.len() + buf.len() > self.max_bytes {
            let reason = format!("rendered output exceeds {} bytes", self.max_bytes);
            self.failures.record(Failure::TooComplex(reason.clone()));
            return Err(io::Error::new(io::ErrorKind::Other, reason));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
