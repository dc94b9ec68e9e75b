//! Typed KV façade.
//!
//! A [`Bucket`] wraps a JetStream KV store with JSON-typed operations and
//! watch installation. [`Slice`] and [`Cell`] are virtual lenses over a
//! bucket: a slice synthesizes full keys under a fixed prefix and watches
//! through a `prefix.>` glob; a cell pins a single key.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream::kv;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;
use crate::faults::FaultSink;
use crate::retry::RetryPolicy;
use crate::utils;
use crate::watcher::{filter_matches, Update, UpdateCallback, Watcher};

/// Get a handle to the named KV bucket, provisioning it as needed.
///
/// Creation races between peers are expected; the loser falls back to the
/// winner's bucket.
pub(crate) async fn ensure_bucket(jetstream: &async_nats::jetstream::Context, name: &str) -> Result<kv::Store> {
    if let Ok(store) = jetstream.get_key_value(name).await {
        return Ok(store);
    }
    let created = jetstream
        .create_key_value(kv::Config {
            bucket: name.to_string(),
            history: 1,
            ..Default::default()
        })
        .await;
    match created {
        Ok(store) => Ok(store),
        Err(err) => match jetstream.get_key_value(name).await {
            Ok(store) => Ok(store),
            Err(_) => Err(anyhow::Error::from(err)).with_context(|| format!("error provisioning KV bucket {}", name)),
        },
    }
}

/// A typed façade over a JetStream KV store.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

struct BucketInner {
    /// The underlying KV store.
    store: kv::Store,
    /// The sink for watch callback failures.
    sink: FaultSink,
    /// The cancellation token scoping this bucket's watches.
    cancel: CancellationToken,
    /// Watchers owned by this bucket, destroyed on its teardown.
    watchers: Mutex<Vec<Watcher>>,
}

impl Bucket {
    /// Create a new instance over the given store.
    pub(crate) fn new(store: kv::Store, sink: FaultSink, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(BucketInner {
                store,
                sink,
                cancel,
                watchers: Mutex::new(vec![]),
            }),
        }
    }

    /// Get the decoded value of the given key, absent for missing keys and
    /// tombstones.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self
            .inner
            .store
            .get(key)
            .await
            .with_context(|| format!("error reading KV key {}", key))?;
        match value {
            Some(bytes) => utils::decode_opt(&bytes),
            None => Ok(None),
        }
    }

    /// Unconditionally set the given key.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<u64> {
        let payload = utils::encode(value)?;
        self.inner
            .store
            .put(key, payload)
            .await
            .with_context(|| format!("error writing KV key {}", key))
    }

    /// Tombstone the given key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.inner
            .store
            .delete(key)
            .await
            .with_context(|| format!("error deleting KV key {}", key))
    }

    /// Run a single read-modify-write cycle against the given key.
    ///
    /// The mutator receives the current value (absent for missing keys and
    /// tombstones) and returns the value to write, or `None` to leave the
    /// key untouched. The write is compared against the revision observed
    /// by the read (a create when the key never existed), so a concurrent
    /// writer fails the cycle with a CAS conflict.
    pub async fn mutate<T, F>(&self, key: &str, mut mutator: F) -> Result<Option<u64>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        self.try_mutate(key, &mut mutator).await
    }

    /// Run read-modify-write cycles against the given key until one lands.
    ///
    /// The canonical compare-and-swap loop: a cycle failing with a CAS
    /// conflict is retried with backoff, re-reading the current value each
    /// time; any other failure propagates.
    pub async fn mutate_using<T, F>(&self, key: &str, mut mutator: F) -> Result<Option<u64>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        let policy = RetryPolicy::default();
        let mut attempt = 0;
        loop {
            let err = match self.try_mutate(key, &mut mutator).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if attempt >= policy.retries || !utils::is_cas_conflict(&err) {
                return Err(err);
            }
            tracing::debug!(key, attempt, "KV mutation conflict, backing off");
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(Canceled.into()),
                _ = tokio::time::sleep(policy.delay(attempt)) => (),
            }
            attempt += 1;
        }
    }

    async fn try_mutate<T, F>(&self, key: &str, mutator: &mut F) -> Result<Option<u64>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        let entry = self
            .inner
            .store
            .entry(key)
            .await
            .with_context(|| format!("error reading KV entry {}", key))?;
        let (prev, revision) = match &entry {
            Some(entry) if entry.operation == kv::Operation::Put => (utils::decode_opt::<T>(&entry.value)?, Some(entry.revision)),
            Some(entry) => (None, Some(entry.revision)),
            None => (None, None),
        };
        let next = match mutator(prev.as_ref())? {
            Some(next) => next,
            None => return Ok(None),
        };
        let payload = utils::encode(&next)?;
        let revision = match revision {
            Some(revision) => self
                .inner
                .store
                .update(key, payload, revision)
                .await
                .with_context(|| format!("error updating KV key {}", key))?,
            None => self
                .inner
                .store
                .create(key, payload)
                .await
                .with_context(|| format!("error creating KV key {}", key))?,
        };
        Ok(Some(revision))
    }

    /// Enumerate current keys, optionally narrowed by a filter.
    pub async fn keys(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let mut stream = self.inner.store.keys().await.context("error listing KV keys")?;
        let mut keys = vec![];
        while let Some(res) = stream.next().await {
            let key = res.context("error iterating KV keys")?;
            if filter.map(|filter| filter_matches(filter, &key)).unwrap_or(true) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Install a watch owned by this bucket, destroyed on its teardown.
    pub async fn watch<T, F>(&self, filter: Option<&str>, callback: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let watcher = self.watch_inner(filter.map(Into::into), Arc::new(callback)).await?;
        self.inner.watchers.lock().await.push(watcher);
        Ok(())
    }

    /// Install a watch owned by the caller.
    pub async fn watch_detached<T, F>(&self, filter: Option<&str>, callback: F) -> Result<Watcher>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.watch_inner(filter.map(Into::into), Arc::new(callback)).await
    }

    pub(crate) async fn watch_inner<T>(&self, filter: Option<String>, callback: UpdateCallback<T>) -> Result<Watcher>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Watcher::init(
            self.inner.store.clone(),
            filter,
            self.inner.sink.clone(),
            self.inner.cancel.child_token(),
            callback,
        )
        .await
    }

    /// A typed lens over the keys under the given prefix.
    pub fn slice<T>(&self, prefix: &str) -> Slice<T> {
        Slice {
            bucket: self.clone(),
            prefix: prefix.to_string(),
            _marker: PhantomData,
        }
    }

    /// A typed lens pinned to the given key.
    pub fn cell<T>(&self, key: &str) -> Cell<T> {
        Cell {
            bucket: self.clone(),
            key: key.to_string(),
            _marker: PhantomData,
        }
    }

    /// Destroy the watchers owned by this bucket.
    pub async fn destroy(&self) {
        let watchers = {
            let mut guard = self.inner.watchers.lock().await;
            std::mem::take(&mut *guard)
        };
        for watcher in watchers {
            watcher.destroy().await;
        }
    }
}

/// A typed view over a bucket's keys under a fixed prefix.
pub struct Slice<T> {
    bucket: Bucket,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Slice<T> {
    fn clone(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Slice<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn full_key(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    fn glob(&self) -> String {
        format!("{}.>", self.prefix)
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        self.bucket.get(&self.full_key(key)).await
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<u64> {
        self.bucket.put(&self.full_key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.bucket.delete(&self.full_key(key)).await
    }

    pub async fn mutate<F>(&self, key: &str, mutator: F) -> Result<Option<u64>>
    where
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        self.bucket.mutate(&self.full_key(key), mutator).await
    }

    pub async fn mutate_using<F>(&self, key: &str, mutator: F) -> Result<Option<u64>>
    where
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        self.bucket.mutate_using(&self.full_key(key), mutator).await
    }

    /// Enumerate current sub-keys, stripped of the prefix.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let glob = self.glob();
        let keys = self.bucket.keys(Some(&glob)).await?;
        Ok(keys.into_iter().map(|key| self.strip(&key)).collect())
    }

    /// Install a watch over the slice, owned by the bucket. Update keys are
    /// stripped of the prefix.
    pub async fn watch<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let watcher = self.watch_detached(callback).await?;
        self.bucket.inner.watchers.lock().await.push(watcher);
        Ok(())
    }

    /// A typed lens pinned to one sub-key of the slice.
    pub fn cell(&self, key: &str) -> Cell<T> {
        self.bucket.cell(&self.full_key(key))
    }

    /// Install a watch over the slice, owned by the caller.
    pub async fn watch_detached<F>(&self, callback: F) -> Result<Watcher>
    where
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let this = self.clone();
        let callback: UpdateCallback<T> = Arc::new(callback);
        let stripping: UpdateCallback<T> = Arc::new(move |mut update: Update<T>| {
            update.key = this.strip(&update.key);
            callback(update)
        });
        self.bucket.watch_inner(Some(self.glob()), stripping).await
    }

    fn strip(&self, key: &str) -> String {
        key.strip_prefix(&format!("{}.", self.prefix)).unwrap_or(key).to_string()
    }
}

/// A typed view pinned to a single key of a bucket.
pub struct Cell<T> {
    bucket: Bucket,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Cell<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub async fn get(&self) -> Result<Option<T>> {
        self.bucket.get(&self.key).await
    }

    pub async fn put(&self, value: &T) -> Result<u64> {
        self.bucket.put(&self.key, value).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.bucket.delete(&self.key).await
    }

    pub async fn mutate<F>(&self, mutator: F) -> Result<Option<u64>>
    where
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        self.bucket.mutate(&self.key, mutator).await
    }

    pub async fn mutate_using<F>(&self, mutator: F) -> Result<Option<u64>>
    where
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        self.bucket.mutate_using(&self.key, mutator).await
    }

    /// Install a watch over the cell, owned by the bucket.
    pub async fn watch<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.bucket.watch(Some(&self.key), callback).await
    }

    /// Install a watch over the cell, owned by the caller.
    pub async fn watch_detached<F>(&self, callback: F) -> Result<Watcher>
    where
        F: Fn(Update<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.bucket.watch_detached(Some(&self.key), callback).await
    }
}
