//! Sharded event producers.
//!
//! A producer named `N` coordinates through a single KV bucket holding
//! three regions: the `distribution` cell recording which peer serves
//! which shards, the `instances.<peer>` slice of liveness heartbeats, and
//! the `subscriptions.<shard>.<paramHash>` slice of subscription records.
//!
//! Every hosting peer heartbeats its own instance record and watches the
//! instances slice; a peer joining or leaving marks the observer's local
//! crowd as disbalanced, and the next post-snapshot update triggers a
//! rebalance: a compare-and-swap on the distribution cell guarded by a
//! monotonically increasing revision, so concurrent rebalances converge on
//! a single winner per logical event. Peers pick up the shards the latest
//! distribution assigns them and spawn one [`ShardHandler`] each.
//!
//! Subscription intake is a request/reply service. Parameters are hashed
//! into a shard and a per-identity JetStream stream is provisioned, so
//! identical parameters from any number of consumers converge on the same
//! stream. The producer keeps no per-caller state; the subscription
//! record, renewed by consumer heartbeats, is the unit of liveness.

mod distribution;
mod shard;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream;
use async_nats::jetstream::stream as js_stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::faults::FaultSink;
use crate::kv::{ensure_bucket, Bucket, Cell, Slice};
use crate::producer::distribution::distribute;
use crate::producer::shard::{ShardContext, ShardHandler};
use crate::service::Service;
use crate::spawner::{Destroy, SpawnFn, Spawner};
use crate::timer::Timer;
use crate::utils;
use crate::watcher::{EntryOperation, Update, Watcher};

pub use crate::producer::shard::{OnSpawn, ProducerClient};

pub(crate) const KEY_DISTRIBUTION: &str = "distribution";
pub(crate) const PREFIX_INSTANCES: &str = "instances";
pub(crate) const PREFIX_SUBSCRIPTIONS: &str = "subscriptions";

/// The default number of shards.
const DEFAULT_SHARD_COUNT: usize = 12;
/// The default number of peers serving each shard.
const DEFAULT_REPLICAS: usize = 2;

/// Configuration of a producer's shard topology.
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// The ordered shard name set.
    pub shards: Vec<String>,
    /// The desired number of peers serving each shard.
    pub replicas: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            shards: utils::sequence(DEFAULT_SHARD_COUNT),
            replicas: DEFAULT_REPLICAS,
        }
    }
}

/// The distribution cell contents.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DistributionRecord {
    /// The ordered shard name set.
    pub shards: Vec<String>,
    /// The desired number of peers serving each shard.
    pub replicas: usize,
    /// The shards assigned to each live peer.
    pub distribution: BTreeMap<String, Vec<String>>,
    /// The generation of this record, sourced from the bucket revision of
    /// the update which triggered the rebalance.
    pub revision: u64,
    /// The peer which wrote this record.
    pub author: String,
}

/// A peer liveness record, kept alive by periodic re-puts.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InstanceRecord {
    /// The time of the last heartbeat.
    #[serde(with = "time::serde::rfc3339")]
    pub seen: OffsetDateTime,
}

/// A subscription record, kept alive by consumer heartbeats.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubscriptionRecord {
    /// The time of the last renewal.
    #[serde(with = "time::serde::rfc3339")]
    pub seen: OffsetDateTime,
    /// The name of the subscription's stream.
    pub stream: String,
    /// The subscribe parameters.
    pub params: serde_json::Value,
}

/// The subscribe request payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct SubscribeParams {
    pub(crate) params: serde_json::Value,
}

/// The subscribe response payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubscribeResult {
    /// The name of the stream provisioned for the subscription.
    pub stream: String,
}

/// A hosted sharded event producer.
pub struct Producer<C: Destroy + 'static> {
    shared: Arc<ProducerShared>,
    instances: Slice<InstanceRecord>,
    spawner: Spawner<String, (), ShardHandler<C>>,
    service: Service,
    instances_watcher: Option<Watcher>,
    distribution_watcher: Option<Watcher>,
    heartbeat: Option<Timer>,
    cancel: CancellationToken,
}

/// State shared with the producer's watcher and timer callbacks.
struct ProducerShared {
    name: String,
    peer_id: String,
    config: ProducerConfig,
    distribution: Cell<DistributionRecord>,
    state: Mutex<CrowdState>,
}

/// The locally observed set of live peers.
#[derive(Default)]
struct CrowdState {
    peers: BTreeMap<String, InstanceRecord>,
    disbalanced: bool,
}

/// Construction context shared by the subscribe intake handlers.
struct IntakeContext {
    name: String,
    jetstream: jetstream::Context,
    bucket: Bucket,
    app_config: Arc<Config>,
    shards: Vec<String>,
}

impl<C: Destroy + 'static> Producer<C> {
    /// Create a new instance and bring it fully online.
    ///
    /// Ordering matters here: the intake service and watchers are
    /// installed before the peer's own instance record is written, so the
    /// write lands as a live update and triggers the initial rebalance on
    /// this peer and every observer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn init(
        client: async_nats::Client, jetstream: jetstream::Context, app_config: Arc<Config>, sink: FaultSink, cancel: CancellationToken,
        peer_id: String, name: String, config: ProducerConfig, on_spawn: OnSpawn<C>,
    ) -> Result<Self> {
        let heartbeat_interval = app_config.heartbeat_interval();
        let store = ensure_bucket(&jetstream, &utils::sanitize_name(&format!("producer.{}", &name))).await?;
        let bucket = Bucket::new(store, sink.clone(), cancel.child_token());

        // Subscribe intake.
        let service = Service::new(format!("producer.{}", &name), client, sink.clone(), cancel.child_token());
        let intake = Arc::new(IntakeContext {
            name: name.clone(),
            jetstream: jetstream.clone(),
            bucket: bucket.clone(),
            app_config,
            shards: config.shards.clone(),
        });
        service
            .register("subscribe", move |params: SubscribeParams| {
                let intake = intake.clone();
                Box::pin(async move { handle_subscribe(intake, params).await })
            })
            .await
            .context("error registering subscribe intake")?;

        // Shard handler registry.
        let shard_context = Arc::new(ShardContext {
            bucket: bucket.clone(),
            jetstream: jetstream.clone(),
            producer: name.clone(),
            sink: sink.clone(),
            on_spawn,
        });
        let factory: SpawnFn<String, (), ShardHandler<C>> = Arc::new(move |shard, ()| {
            let shard_context = shard_context.clone();
            Box::pin(async move { ShardHandler::init(shard_context, shard).await })
        });
        let spawner = Spawner::new(factory, sink.clone());

        let shared = Arc::new(ProducerShared {
            name: name.clone(),
            peer_id: peer_id.clone(),
            config,
            distribution: bucket.cell(KEY_DISTRIBUTION),
            state: Mutex::new(CrowdState::default()),
        });

        // Crowd tracking. Every put or delete of an instance record marks
        // the crowd disbalanced; the first post-snapshot update in that
        // state drives a rebalance.
        let instances: Slice<InstanceRecord> = bucket.slice(PREFIX_INSTANCES);
        let crowd_shared = shared.clone();
        let instances_watcher = instances
            .watch_detached(move |update: Update<InstanceRecord>| {
                let shared = crowd_shared.clone();
                Box::pin(async move { shared.handle_instance_update(update).await })
            })
            .await
            .context("error watching producer instances")?;

        // Shard pickup.
        let pickup_shared = shared.clone();
        let pickup_spawner = spawner.clone();
        let distribution_watcher = shared
            .distribution
            .watch_detached(move |update: Update<DistributionRecord>| {
                let (shared, spawner) = (pickup_shared.clone(), pickup_spawner.clone());
                Box::pin(async move {
                    let record = match (update.online, update.operation, update.value) {
                        (true, EntryOperation::Put, Some(record)) => record,
                        _ => return Ok(()),
                    };
                    let Some(mine) = record.distribution.get(&shared.peer_id) else {
                        return Ok(());
                    };
                    tracing::debug!(
                        producer = %shared.name,
                        shards = ?mine,
                        revision = record.revision,
                        "picking up assigned shards"
                    );
                    let desired: HashMap<String, ()> = mine.iter().cloned().map(|shard| (shard, ())).collect();
                    spawner.reset_items(desired).await
                })
            })
            .await
            .context("error watching producer distribution")?;

        // Liveness. The initial write lands post-snapshot in our own watch
        // and in every peer's, announcing the join everywhere at once.
        instances
            .put(&peer_id, &InstanceRecord { seen: OffsetDateTime::now_utc() })
            .await
            .context("error writing initial instance record")?;

        let heartbeat_instances = instances.clone();
        let heartbeat_peer = peer_id.clone();
        let heartbeat = Timer::spawn(
            "producer-heartbeat",
            heartbeat_interval,
            sink,
            cancel.child_token(),
            Arc::new(move || {
                let (instances, peer_id) = (heartbeat_instances.clone(), heartbeat_peer.clone());
                Box::pin(async move {
                    instances
                        .put(&peer_id, &InstanceRecord { seen: OffsetDateTime::now_utc() })
                        .await
                        .context("error renewing instance record")?;
                    Ok(())
                })
            }),
        );

        tracing::info!(producer = name, peer = peer_id, "producer online");
        Ok(Self {
            shared,
            instances,
            spawner,
            service,
            instances_watcher: Some(instances_watcher),
            distribution_watcher: Some(distribution_watcher),
            heartbeat: Some(heartbeat),
            cancel,
        })
    }

    /// The producer name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Tear down this producer, removing its liveness record and
    /// destroying children in reverse construction order.
    pub async fn destroy(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.destroy().await;
        }
        if let Err(err) = self.instances.delete(&self.shared.peer_id).await {
            tracing::warn!(error = ?err, "error removing instance record");
        }
        if let Some(watcher) = self.distribution_watcher.take() {
            watcher.destroy().await;
        }
        if let Some(watcher) = self.instances_watcher.take() {
            watcher.destroy().await;
        }
        self.spawner.destroy().await;
        self.service.destroy().await;
        self.cancel.cancel();
        tracing::info!(producer = %self.shared.name, "producer destroyed");
    }
}

impl ProducerShared {
    /// Apply one instances-slice update to the local crowd.
    async fn handle_instance_update(&self, update: Update<InstanceRecord>) -> Result<()> {
        let mut state = self.state.lock().await;
        match update.operation {
            EntryOperation::Put => {
                if let Some(record) = update.value {
                    if state.peers.insert(update.key.clone(), record).is_none() {
                        state.disbalanced = true;
                    }
                }
            }
            EntryOperation::Delete => {
                if state.peers.remove(&update.key).is_some() {
                    state.disbalanced = true;
                }
            }
        }
        if update.online && state.disbalanced {
            self.rebalance(&mut state, update.revision).await?;
        }
        Ok(())
    }

    /// Write a fresh distribution unless a newer one already landed.
    ///
    /// The compare-and-swap together with the `>=` revision guard lets any
    /// number of peers race here: exactly one write per logical event
    /// survives, and losers adopt the winner's record through their own
    /// distribution watch.
    async fn rebalance(&self, state: &mut CrowdState, revision: u64) -> Result<()> {
        let peers: Vec<String> = state.peers.keys().cloned().collect();
        let res = self
            .distribution
            .mutate(|current: Option<&DistributionRecord>| {
                if let Some(current) = current {
                    if current.revision >= revision {
                        return Ok(None);
                    }
                }
                Ok(Some(DistributionRecord {
                    shards: self.config.shards.clone(),
                    replicas: self.config.replicas,
                    distribution: distribute(&peers, &self.config.shards, self.config.replicas),
                    revision,
                    author: self.peer_id.clone(),
                }))
            })
            .await;
        state.disbalanced = false;
        match res {
            Ok(Some(_)) => {
                tracing::debug!(producer = %self.name, revision, peers = peers.len(), "distribution rebalanced");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) if utils::is_cas_conflict(&err) => {
                tracing::debug!(producer = %self.name, revision, "rebalance lost to a concurrent writer");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Handle one subscribe request.
async fn handle_subscribe(context: Arc<IntakeContext>, request: SubscribeParams) -> Result<SubscribeResult> {
    let param_hash = utils::value_hash(&request.params)?;
    let shard = pick_shard(&context.shards, &param_hash)?;
    let subject = format!("producer.{}.{}", &context.name, &param_hash);
    let stream = utils::sanitize_name(&subject);

    ensure_stream(&context.jetstream, &context.app_config, stream.clone(), subject).await?;

    let record = SubscriptionRecord {
        seen: OffsetDateTime::now_utc(),
        stream: stream.clone(),
        params: request.params,
    };
    context
        .bucket
        .put(&format!("{}.{}.{}", PREFIX_SUBSCRIPTIONS, shard, &param_hash), &record)
        .await
        .context("error writing subscription record")?;

    tracing::debug!(producer = %context.name, shard = %shard, param_hash, "subscription recorded");
    Ok(SubscribeResult { stream })
}

/// Map a param hash onto a shard by its low 32 bits.
fn pick_shard<'a>(shards: &'a [String], param_hash: &str) -> Result<&'a String> {
    anyhow::ensure!(!shards.is_empty(), "producer has an empty shard set");
    let tail = &param_hash[param_hash.len().saturating_sub(8)..];
    let value = u32::from_str_radix(tail, 16).context("invalid param hash")?;
    Ok(&shards[value as usize % shards.len()])
}

/// Idempotently provision the stream of one subscription identity.
async fn ensure_stream(jetstream: &jetstream::Context, config: &Config, name: String, subject: String) -> Result<()> {
    jetstream
        .get_or_create_stream(js_stream::Config {
            name,
            subjects: vec![subject.into()],
            retention: js_stream::RetentionPolicy::Interest,
            storage: js_stream::StorageType::File,
            discard: js_stream::DiscardPolicy::Old,
            max_messages: config.stream_max_messages,
            max_age: Duration::from_secs(config.stream_max_age_secs),
            max_bytes: config.stream_max_bytes,
            max_message_size: config.stream_max_message_size,
            ..Default::default()
        })
        .await
        .map_err(anyhow::Error::from)
        .context("error provisioning subscription stream")?;
    Ok(())
}
