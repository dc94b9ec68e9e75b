//! Shard handlers.
//!
//! A producer peer constructs one handler per shard it has picked up. The
//! handler watches the shard's subscription records and converges an inner
//! registry of user event sources onto them: a record put spawns or
//! respawns the source for that parameter identity, a delete destroys it.
//! The subscription slice is shared between all replicas of the shard, so
//! every replica observes the same record sequence and runs an identical
//! set of sources. The user callback must therefore produce work that is
//! safe to execute on `replicas` peers simultaneously.

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::kv::{Bucket, Slice};
use crate::faults::FaultSink;
use crate::producer::{SubscriptionRecord, PREFIX_SUBSCRIPTIONS};
use crate::spawner::{Destroy, SpawnFn, Spawner};
use crate::utils;
use crate::watcher::{EntryOperation, Update, Watcher};

/// The factory producing a user event source for one subscription
/// identity, receiving the subscribe parameters, their hash, and the
/// publisher for the subscription's stream.
pub type OnSpawn<C> = Arc<dyn Fn(serde_json::Value, String, ProducerClient) -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Shared construction context for the shard handlers of one producer.
pub(crate) struct ShardContext<C> {
    pub(crate) bucket: Bucket,
    pub(crate) jetstream: jetstream::Context,
    pub(crate) producer: String,
    pub(crate) sink: FaultSink,
    pub(crate) on_spawn: OnSpawn<C>,
}

/// The handler owned by a peer for one assigned shard.
pub(crate) struct ShardHandler<C: Destroy + 'static> {
    watcher: Option<Watcher>,
    children: Spawner<String, serde_json::Value, C>,
}

impl<C: Destroy + 'static> ShardHandler<C> {
    /// Create a new instance for the given shard.
    pub(crate) async fn init(context: Arc<ShardContext<C>>, shard: String) -> Result<Self> {
        let factory: SpawnFn<String, serde_json::Value, C> = {
            let context = context.clone();
            Arc::new(move |param_hash: String, params: serde_json::Value| {
                let client = ProducerClient {
                    jetstream: context.jetstream.clone(),
                    subject: format!("producer.{}.{}", &context.producer, &param_hash),
                };
                (context.on_spawn)(params, param_hash, client)
            })
        };
        let children = Spawner::new(factory, context.sink.clone());

        let subscriptions: Slice<SubscriptionRecord> = context.bucket.slice(&format!("{}.{}", PREFIX_SUBSCRIPTIONS, &shard));
        let watch_children = children.clone();
        let watcher = subscriptions
            .watch_detached(move |update: Update<SubscriptionRecord>| {
                let children = watch_children.clone();
                Box::pin(async move {
                    match (update.operation, update.value) {
                        (EntryOperation::Put, Some(record)) => children.maybe_respawn_item(update.key, record.params).await,
                        (EntryOperation::Put, None) => Ok(()),
                        (EntryOperation::Delete, _) => children.destroy_item(&update.key).await,
                    }
                })
            })
            .await
            .with_context(|| format!("error watching subscriptions of shard {}", &shard))?;

        tracing::debug!(shard, "shard handler started");
        Ok(Self {
            watcher: Some(watcher),
            children,
        })
    }
}

#[async_trait]
impl<C: Destroy + 'static> Destroy for ShardHandler<C> {
    async fn destroy(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.destroy().await;
        }
        self.children.destroy().await;
        Ok(())
    }
}

/// A publisher bound to the stream of one subscription identity.
#[derive(Clone)]
pub struct ProducerClient {
    jetstream: jetstream::Context,
    subject: String,
}

impl ProducerClient {
    /// The subject events publish on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish an event onto the subscription's stream, awaiting the
    /// JetStream acknowledgement.
    pub async fn publish<E: Serialize>(&self, event: &E) -> Result<()> {
        let payload = utils::encode(event)?;
        self.jetstream
            .publish(self.subject.clone(), payload)
            .await
            .map_err(anyhow::Error::from)
            .with_context(|| format!("error publishing event on {}", &self.subject))?
            .await
            .map_err(anyhow::Error::from)
            .context("error awaiting publish acknowledgement")?;
        Ok(())
    }
}
