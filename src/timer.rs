//! Local periodic & one-shot timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::faults::FaultSink;

/// An async callback invoked per timer tick.
pub type TickCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A periodic timer whose ticks stay aligned to its start epoch.
///
/// After each invocation the next fire time is computed as
/// `interval - (elapsed mod interval)`, so a slow callback delays at most
/// its own tick and never accumulates drift. Callback failures are
/// swallowed into the fault sink. `destroy` cancels the pending tick; a
/// tick already in flight runs to completion and does not reschedule.
pub struct Timer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Spawn a timer firing at the given interval.
    pub fn spawn(component: &'static str, interval: Duration, sink: FaultSink, cancel: CancellationToken, callback: TickCallback) -> Self {
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let period = interval.as_nanos().max(1);
            loop {
                let elapsed = started.elapsed().as_nanos();
                let delay = Duration::from_nanos((period - elapsed % period) as u64);
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
                if let Err(err) = callback().await {
                    sink.report(component, err);
                }
            }
            tracing::debug!(component, "timer stopped");
        });
        Self { cancel, handle }
    }

    /// Cancel the pending tick and await completion of any tick in flight.
    pub async fn destroy(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::error!(error = ?err, "error joining timer task");
        }
    }
}

/// An async callback invoked when a scheduler fires, receiving the fire
/// time and a handle for re-arming.
pub type ScheduleCallback = Arc<dyn Fn(OffsetDateTime, SchedulerHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A one-shot re-armable timer.
///
/// `schedule` arms the timer if it is not already armed and not destroyed;
/// calls made while armed are no-ops, debouncing to the first requested
/// delay. On firing, the callback receives the current time and a handle
/// with which it may compute and arm the next delay.
pub struct Scheduler {
    handle: SchedulerHandle,
    task: JoinHandle<()>,
}

/// The re-arming handle of a [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tx: mpsc::Sender<Duration>,
    armed: AtomicBool,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Arm the scheduler with the given delay, unless already armed or
    /// destroyed.
    pub fn schedule(&self, delay: Duration) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if self.inner.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.inner.tx.try_send(delay).is_err() {
            self.inner.armed.store(false, Ordering::Release);
        }
    }
}

impl Scheduler {
    /// Create a new unarmed instance.
    pub fn new(component: &'static str, sink: FaultSink, cancel: CancellationToken, callback: ScheduleCallback) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let mut rx = ReceiverStream::new(rx);
        let inner = Arc::new(SchedulerInner {
            tx,
            armed: AtomicBool::new(false),
            cancel,
        });
        let handle = SchedulerHandle { inner: inner.clone() };
        let rearm = handle.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    delay = rx.next() => match delay {
                        Some(delay) => delay,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
                // Disarm before the callback so it may re-arm itself.
                inner.armed.store(false, Ordering::Release);
                if let Err(err) = callback(OffsetDateTime::now_utc(), rearm.clone()).await {
                    sink.report(component, err);
                }
            }
            tracing::debug!(component, "scheduler stopped");
        });
        Self { handle, task }
    }

    /// Arm the scheduler with the given delay, unless already armed.
    pub fn schedule(&self, delay: Duration) {
        self.handle.schedule(delay);
    }

    /// Cancel any pending fire and await task completion.
    pub async fn destroy(self) {
        self.handle.inner.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = ?err, "error joining scheduler task");
        }
    }
}
