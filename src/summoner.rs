//! Summoner: a single-slot child lifetime keyed by a value.

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::spawner::Destroy;
use crate::utils;

/// The factory invoked to construct the child for a set of parameters.
pub type SummonFn<P, C> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// The equality used to decide whether a spawn call changes the child.
pub type CompareFn<P> = Arc<dyn Fn(&P, &P) -> bool + Send + Sync>;

/// A holder of at most one child, identified by its construction
/// parameters.
///
/// `spawn` converges the slot onto the given parameters: an empty slot is
/// filled, equal parameters are a no-op, and differing parameters destroy
/// the current child before constructing its replacement. All transitions
/// are serialized on an internal mutex.
pub struct Summoner<P, C> {
    inner: Arc<SummonerInner<P, C>>,
}

struct SummonerInner<P, C> {
    factory: SummonFn<P, C>,
    compare: CompareFn<P>,
    slot: Mutex<Option<Summoned<P, C>>>,
}

struct Summoned<P, C> {
    params: P,
    child: C,
}

impl<P, C> Clone for Summoner<P, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P, C> Summoner<P, C>
where
    P: Clone + Serialize + Send + Sync + 'static,
    C: Destroy + Send + 'static,
{
    /// Create a new instance comparing parameters by canonical-JSON hash.
    pub fn new(factory: SummonFn<P, C>) -> Self {
        let compare: CompareFn<P> = Arc::new(|current, next| {
            match (utils::value_hash(current), utils::value_hash(next)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        });
        Self::with_compare(factory, compare)
    }

    /// Create a new instance with a user-supplied parameter equality.
    pub fn with_compare(factory: SummonFn<P, C>, compare: CompareFn<P>) -> Self {
        Self {
            inner: Arc::new(SummonerInner {
                factory,
                compare,
                slot: Mutex::new(None),
            }),
        }
    }

    /// Converge the slot onto the given parameters.
    pub async fn spawn(&self, params: P) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(current) = slot.as_ref() {
            if (self.inner.compare)(&current.params, &params) {
                return Ok(());
            }
        }
        if let Some(mut current) = slot.take() {
            current.child.destroy().await?;
        }
        let child = (self.inner.factory)(params.clone()).await?;
        *slot = Some(Summoned { params, child });
        Ok(())
    }

    /// Unconditionally destroy the current child, if any.
    pub async fn kill(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(mut current) = slot.take() {
            current.child.destroy().await?;
        }
        Ok(())
    }

    /// A bool indicating if a child currently occupies the slot.
    pub async fn is_alive(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// Tear down the current child, if any.
    pub async fn destroy(&self) -> Result<()> {
        self.kill().await
    }
}
