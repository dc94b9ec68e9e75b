//! Distributed locks.
//!
//! A lock is a KV key in a dedicated memory-storage bucket whose TTL is
//! the configured lock timeout. Acquisition is an atomic create of the
//! key; release is a delete guarded by the acquisition revision, so a
//! holder which lost the key to TTL expiry cannot release a successor's
//! lock. Mutual exclusion therefore holds for at most the lock timeout;
//! longer critical sections must renew or configure a longer TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;
use crate::retry::{retry, RetryPolicy};
use crate::utils;

const LOCKS_BUCKET: &str = "locks";

/// The storage operations a lock key needs from the KV layer.
#[async_trait]
pub(crate) trait LockStore: Send + Sync {
    /// Atomically create the key, returning the revision to release with.
    async fn acquire(&self, key: &str) -> Result<u64>;
    /// Delete the key if it still carries the given revision.
    async fn release(&self, key: &str, revision: u64) -> Result<()>;
}

#[async_trait]
impl LockStore for kv::Store {
    async fn acquire(&self, key: &str) -> Result<u64> {
        self.create(key, Bytes::new()).await.map_err(anyhow::Error::from)
    }

    async fn release(&self, key: &str, revision: u64) -> Result<()> {
        self.delete_expect_revision(key, Some(revision))
            .await
            .map_err(anyhow::Error::from)
    }
}

/// The registry of distributed locks for a backend instance.
pub struct Locks {
    store: Arc<dyn LockStore>,
    cancel: CancellationToken,
}

impl Locks {
    /// Create a new instance, provisioning the locks bucket as needed.
    pub(crate) async fn init(jetstream: &jetstream::Context, lock_timeout: Duration, cancel: CancellationToken) -> Result<Self> {
        let store = match jetstream.get_key_value(LOCKS_BUCKET).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: LOCKS_BUCKET.into(),
                    description: "distributed locks".into(),
                    max_age: lock_timeout,
                    storage: jetstream::stream::StorageType::Memory,
                    history: 1,
                    ..Default::default()
                })
                .await
                .context("error provisioning locks bucket")?,
        };
        Ok(Self::with_store(Arc::new(store), cancel))
    }

    /// Create a new instance over the given store.
    pub(crate) fn with_store(store: Arc<dyn LockStore>, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    /// Run the given task while holding the named lock.
    ///
    /// Acquisition retries CAS conflicts with exponential backoff capped at
    /// 2 s; exhausting the budget fails with `cannot acquire lock`. The
    /// lock is released when the task completes, whether it succeeded or
    /// not; a release conflict is ignored, as the key may have expired and
    /// been inherited by another holder.
    pub async fn lock<T, Fut>(&self, key: &str, task: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(2),
            ..Default::default()
        };
        let revision = retry(
            &policy,
            &self.cancel,
            |err, _attempt| utils::is_cas_conflict(err),
            || self.store.acquire(key),
        )
        .await
        .map_err(|err| match err.downcast_ref::<Canceled>() {
            Some(_) => err,
            None => err.context("cannot acquire lock"),
        })?;
        tracing::debug!(key, revision, "lock acquired");

        let output = task.await;

        if let Err(err) = self.store.release(key, revision).await {
            if utils::is_cas_conflict(&err) {
                tracing::debug!(key, "lock expired before release");
            } else {
                tracing::warn!(error = ?err, key, "error releasing lock");
            }
        }
        output
    }
}
