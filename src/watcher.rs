//! Watcher over KV entries.

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream::kv;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;
use crate::faults::FaultSink;
use crate::listener::Listener;
use crate::utils;

/// The operation recorded by a KV entry update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryOperation {
    Put,
    Delete,
}

/// A single update delivered by a [`Watcher`].
#[derive(Clone, Debug)]
pub struct Update<T> {
    /// The operation which produced this entry.
    pub operation: EntryOperation,
    /// The bucket revision of this entry.
    pub revision: u64,
    /// The entry key.
    pub key: String,
    /// The decoded value; absent for tombstones.
    pub value: Option<T>,
    /// A bool indicating if the initial snapshot had been fully replayed
    /// before this update was delivered.
    pub online: bool,
}

/// An async callback invoked per watcher update.
pub(crate) type UpdateCallback<T> = Arc<dyn Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A watch over a KV bucket, optionally narrowed by a key filter.
///
/// Every entry present at watch start is delivered before the watcher
/// marks itself online; `init` does not return until that flip, so callers
/// may rely on having observed the initial state. Updates carry the online
/// flag current at delivery time.
pub struct Watcher {
    listener: Listener,
    cancel: CancellationToken,
    online: watch::Receiver<bool>,
}

impl Watcher {
    /// Begin watching, returning once the initial snapshot has been replayed.
    pub(crate) async fn init<T>(
        store: kv::Store, filter: Option<String>, sink: FaultSink, cancel: CancellationToken, callback: UpdateCallback<T>,
    ) -> Result<Self>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let filter = filter.unwrap_or_else(|| ">".to_string());
        let entries = store
            .watch_with_history(&filter)
            .await
            .with_context(|| format!("error starting KV watch for filter {}", &filter))?;

        let (online_tx, online) = watch::channel(false);
        let online_tx = Arc::new(online_tx);
        let delivered = Arc::new(AtomicBool::new(false));

        let stream = entries
            .map(|res| res.map_err(anyhow::Error::from))
            .take_until(cancel.clone().cancelled_owned());
        let callback = Self::decoding_callback(callback, online_tx.clone(), delivered.clone());
        let listener = Listener::spawn("watcher", stream, sink, callback);
        let watcher = Self { listener, cancel, online };

        // The watch stream itself is authoritative for the online flip: the
        // entry delivered with no further messages pending completes the
        // snapshot. A filter nothing was ever written under stays silent,
        // so the key listing decides that one case. It runs after the watch
        // is established and only flips while the stream has delivered
        // nothing, so a snapshot already in flight wins over the probe.
        if !watcher.online() && !has_matching_keys(&store, &filter).await? && !delivered.load(Ordering::SeqCst) {
            online_tx.send_replace(true);
        }

        watcher.await_online().await?;
        Ok(watcher)
    }

    /// A bool indicating if the initial snapshot has been replayed.
    pub fn online(&self) -> bool {
        *self.online.borrow()
    }

    /// Stop the underlying watch and await the listener's completion.
    pub async fn destroy(self) {
        self.cancel.cancel();
        self.listener.destroy().await;
    }

    /// Wrap the user callback with entry decoding and online accounting.
    ///
    /// The snapshot is complete once an entry is delivered with no further
    /// messages pending for the watch; the flip happens after that entry's
    /// callback, so snapshot entries always observe `online == false`. The
    /// delivered flag is raised before anything else so the silent-filter
    /// fallback in `init` can tell an in-flight snapshot from a truly
    /// empty one.
    fn decoding_callback<T>(
        callback: UpdateCallback<T>, online_tx: Arc<watch::Sender<bool>>, delivered: Arc<AtomicBool>,
    ) -> crate::listener::Callback<kv::Entry>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Arc::new(move |entry: kv::Entry| {
            delivered.store(true, Ordering::SeqCst);
            let (callback, online_tx) = (callback.clone(), online_tx.clone());
            Box::pin(async move {
                let online = *online_tx.borrow();
                let caught_up = entry.delta == 0;
                let res = match decode_entry::<T>(entry, online) {
                    Ok(update) => callback(update).await,
                    Err(err) => Err(err),
                };
                if !online && caught_up {
                    online_tx.send_replace(true);
                }
                res
            })
        })
    }

    async fn await_online(&self) -> Result<()> {
        let mut online = self.online.clone();
        loop {
            if *online.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Canceled.into()),
                res = online.changed() => res.context("watcher closed before coming online")?,
            }
        }
    }
}

/// Decode a raw KV entry into a typed update.
fn decode_entry<T: DeserializeOwned>(entry: kv::Entry, online: bool) -> Result<Update<T>> {
    let (operation, value) = match entry.operation {
        kv::Operation::Put => {
            let value = utils::decode_opt::<T>(&entry.value)
                .with_context(|| format!("error decoding KV entry for key {}", &entry.key))?;
            (EntryOperation::Put, value)
        }
        kv::Operation::Delete | kv::Operation::Purge => (EntryOperation::Delete, None),
    };
    Ok(Update {
        operation,
        revision: entry.revision,
        key: entry.key,
        value,
        online,
    })
}

/// A bool indicating if any current key of the store matches the filter.
async fn has_matching_keys(store: &kv::Store, filter: &str) -> Result<bool> {
    let mut keys = store.keys().await.context("error listing KV keys")?;
    while let Some(res) = keys.next().await {
        let key = res.context("error iterating KV keys")?;
        if filter_matches(filter, &key) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Match a key against the supported filter shapes: the full wildcard, a
/// `prefix.>` glob, or an exact key.
pub(crate) fn filter_matches(filter: &str, key: &str) -> bool {
    if filter == ">" {
        return true;
    }
    match filter.strip_suffix('>') {
        Some(prefix) => key.starts_with(prefix),
        None => key == filter,
    }
}
