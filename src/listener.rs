//! Listener over an async sequence.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::faults::FaultSink;

/// An async callback invoked per item of a driven sequence.
pub(crate) type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A task draining an async sequence into a callback.
///
/// Callback failures are reported through the fault sink without ending
/// the loop; a failure of the sequence itself is reported and terminates
/// the listener. `destroy` awaits natural completion and does not cancel
/// the sequence; the owner is expected to close it first.
pub(crate) struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    /// Spawn a listener over the given sequence.
    pub(crate) fn spawn<S, T>(component: &'static str, stream: S, sink: FaultSink, callback: Callback<T>) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(next) = stream.next().await {
                match next {
                    Ok(item) => {
                        if let Err(err) = callback(item).await {
                            sink.report(component, err);
                        }
                    }
                    Err(err) => {
                        sink.report(component, err.context("sequence failed during iteration"));
                        break;
                    }
                }
            }
            tracing::debug!(component, "listener sequence complete");
        });
        Self { handle }
    }

    /// Await the listener's natural completion.
    pub(crate) async fn destroy(self) {
        if let Err(err) = self.handle.await {
            tracing::error!(error = ?err, "error joining listener task");
        }
    }
}
