//! The process-wide fault sink.
//!
//! Failures of callbacks driven by listeners, watchers and timers must not
//! tear down the loop which invoked them; they are tagged with the
//! reporting component and pushed here instead. Errors rooted in
//! [`Canceled`] are suppressed, so shutdown never reads as a fault.

use std::sync::Arc;

use crate::error::Canceled;

/// A hook invoked with every reported fault.
pub type FaultHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// A sink for failures which have no caller left to return to.
#[derive(Clone, Default)]
pub struct FaultSink {
    hook: Option<FaultHook>,
}

impl FaultSink {
    /// Create a new instance which logs reports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new instance with a user hook invoked on every report.
    pub fn with_hook(hook: FaultHook) -> Self {
        Self { hook: Some(hook) }
    }

    /// Report a failure from the given component.
    pub fn report(&self, component: &str, err: anyhow::Error) {
        if err.chain().any(|cause| cause.is::<Canceled>()) {
            tracing::debug!(component, "operation interrupted by shutdown");
            return;
        }
        if let Some(hook) = &self.hook {
            hook(component, &err);
        }
        tracing::error!(error = ?err, component, "uncaught failure");
    }
}
