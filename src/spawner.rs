//! Spawner: a keyed registry of owned child lifetimes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::faults::FaultSink;
use crate::utils;

/// The teardown contract of owned children.
#[async_trait]
pub trait Destroy: Send + Sync {
    /// Release every resource held by this object.
    async fn destroy(&mut self) -> Result<()>;
}

/// The factory invoked to construct a child for a key/value pair.
pub type SpawnFn<K, V, C> = Arc<dyn Fn(K, V) -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// A keyed registry of owned children.
///
/// Every mutation is serialized through an internal mutex, so factory
/// invocations and child teardowns never interleave. Children are
/// identified by key; change detection of values is by canonical-JSON
/// hash, which is the only equality mechanism, so values must be
/// JSON-representable and identity-carrying.
pub struct Spawner<K, V, C> {
    inner: Arc<SpawnerInner<K, V, C>>,
}

struct SpawnerInner<K, V, C> {
    factory: SpawnFn<K, V, C>,
    sink: FaultSink,
    items: Mutex<HashMap<K, Spawned<C>>>,
}

struct Spawned<C> {
    hash: String,
    child: C,
}

impl<K, V, C> Clone for Spawner<K, V, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V, C> Spawner<K, V, C>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: Clone + Serialize + Send + 'static,
    C: Destroy + Send + 'static,
{
    /// Create a new instance around the given child factory.
    pub fn new(factory: SpawnFn<K, V, C>, sink: FaultSink) -> Self {
        Self {
            inner: Arc::new(SpawnerInner {
                factory,
                sink,
                items: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Spawn a child for the given key, failing if the key is taken.
    pub async fn spawn_item(&self, key: K, value: V) -> Result<()> {
        let mut items = self.inner.items.lock().await;
        if items.contains_key(&key) {
            bail!("a child already exists for key {:?}", key);
        }
        self.spawn_locked(&mut items, key, value).await
    }

    /// Destroy the child of the given key; a no-op for unknown keys.
    pub async fn destroy_item(&self, key: &K) -> Result<()> {
        let mut items = self.inner.items.lock().await;
        self.destroy_locked(&mut items, key).await
    }

    /// Converge the child of the given key onto the given value: spawn it
    /// if absent, leave it alone if the value hash is unchanged, and
    /// destroy-then-spawn otherwise.
    pub async fn maybe_respawn_item(&self, key: K, value: V) -> Result<()> {
        let mut items = self.inner.items.lock().await;
        self.maybe_respawn_locked(&mut items, key, value).await
    }

    /// Converge the registry onto exactly the given set: respawn for every
    /// entry, destroy every child whose key is not present.
    pub async fn reset_items(&self, desired: HashMap<K, V>) -> Result<()> {
        let mut items = self.inner.items.lock().await;
        for (key, value) in &desired {
            self.maybe_respawn_locked(&mut items, key.clone(), value.clone()).await?;
        }
        let stale: Vec<K> = items.keys().filter(|key| !desired.contains_key(key)).cloned().collect();
        for key in stale {
            self.destroy_locked(&mut items, &key).await?;
        }
        Ok(())
    }

    /// Iterate all live children under the registry lock.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &C),
    {
        let items = self.inner.items.lock().await;
        for (key, spawned) in items.iter() {
            f(key, &spawned.child);
        }
    }

    /// The number of live children.
    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    /// Tear down every child.
    ///
    /// Individual teardown failures are reported through the fault sink so
    /// that one failing child does not leak its siblings.
    pub async fn destroy(&self) {
        let mut items = self.inner.items.lock().await;
        for (key, mut spawned) in items.drain() {
            tracing::debug!(key = ?key, "destroying child");
            if let Err(err) = spawned.child.destroy().await {
                self.inner.sink.report("spawner", err);
            }
        }
    }

    async fn spawn_locked(&self, items: &mut HashMap<K, Spawned<C>>, key: K, value: V) -> Result<()> {
        let hash = utils::value_hash(&value)?;
        tracing::debug!(key = ?key, "spawning child");
        let child = (self.inner.factory)(key.clone(), value).await?;
        items.insert(key, Spawned { hash, child });
        Ok(())
    }

    async fn destroy_locked(&self, items: &mut HashMap<K, Spawned<C>>, key: &K) -> Result<()> {
        if let Some(mut spawned) = items.remove(key) {
            tracing::debug!(key = ?key, "destroying child");
            spawned.child.destroy().await?;
        }
        Ok(())
    }

    async fn maybe_respawn_locked(&self, items: &mut HashMap<K, Spawned<C>>, key: K, value: V) -> Result<()> {
        let hash = utils::value_hash(&value)?;
        match items.get(&key) {
            None => self.spawn_locked(items, key, value).await,
            Some(spawned) if spawned.hash == hash => Ok(()),
            Some(_) => {
                self.destroy_locked(items, &key).await?;
                self.spawn_locked(items, key, value).await
            }
        }
    }
}
