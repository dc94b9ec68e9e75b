//! The backend: the root handle of a fabric peer.

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream;
use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::consumer::Consumer;
use crate::faults::FaultSink;
use crate::kv::{ensure_bucket, Bucket};
use crate::mutex::Locks;
use crate::producer::{Producer, ProducerClient, ProducerConfig};
use crate::service::{Delivery, Service, Subscription};
use crate::spawner::Destroy;
use crate::utils;

/// The length of a peer identifier.
const PEER_ID_LEN: usize = 24;

/// A connected fabric peer.
///
/// The backend owns the NATS connection, the peer's random identity, the
/// fault sink, and the root cancellation token. Components constructed
/// through it are owned by the caller and should be destroyed before the
/// backend itself; cancelling the backend also unwinds any stragglers.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: Arc<Config>,
    peer_id: String,
    sink: FaultSink,
    cancel: CancellationToken,
    locks: Locks,
}

impl Backend {
    /// Connect to the given NATS URL and initialize the peer.
    pub async fn connect(url: &str, config: Config) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(anyhow::Error::from)
            .with_context(|| format!("error connecting to NATS at {}", url))?;
        Self::with_client(client, config).await
    }

    /// Initialize the peer over an established NATS connection.
    pub async fn with_client(client: async_nats::Client, config: Config) -> Result<Self> {
        let jetstream = jetstream::new(client.clone());
        let config = Arc::new(config);
        let sink = FaultSink::new();
        let cancel = CancellationToken::new();
        let peer_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PEER_ID_LEN)
            .map(char::from)
            .collect();
        let locks = Locks::init(&jetstream, config.lock_timeout(), cancel.child_token()).await?;
        tracing::info!(peer = peer_id, "backend initialized");
        Ok(Self {
            inner: Arc::new(BackendInner {
                client,
                jetstream,
                config,
                peer_id,
                sink,
                cancel,
                locks,
            }),
        })
    }

    /// This peer's identity, used as its address in coordination buckets.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// The runtime config.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The fault sink shared by this peer's components.
    pub fn fault_sink(&self) -> &FaultSink {
        &self.inner.sink
    }

    /// Get a handle to the named KV bucket, provisioning it as needed.
    pub async fn bucket(&self, name: &str) -> Result<Bucket> {
        let store = ensure_bucket(&self.inner.jetstream, &utils::sanitize_name(name)).await?;
        Ok(Bucket::new(store, self.inner.sink.clone(), self.inner.cancel.child_token()))
    }

    /// The distributed lock registry.
    pub fn locks(&self) -> &Locks {
        &self.inner.locks
    }

    /// Run the given task while holding the named distributed lock.
    pub async fn lock<T, Fut>(&self, key: &str, task: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.inner.locks.lock(key, task).await
    }

    /// Publish a value on the given subject.
    pub async fn publish<T: Serialize>(&self, subject: &str, value: &T) -> Result<()> {
        let payload = utils::encode(value)?;
        self.inner
            .client
            .publish(subject.to_string(), payload)
            .await
            .map_err(anyhow::Error::from)
            .with_context(|| format!("error publishing on {}", subject))
    }

    /// Subscribe to the given subject, optionally inside a queue group.
    pub async fn subscribe<T, F>(&self, subject: &str, queue: Option<&str>, callback: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Subscription::init(
            self.inner.client.clone(),
            subject.to_string(),
            queue.map(Into::into),
            self.inner.sink.clone(),
            self.inner.cancel.child_token(),
            Arc::new(callback),
        )
        .await
    }

    /// Create a named request/reply service; register methods on the
    /// returned handle.
    pub fn service(&self, name: &str) -> Service {
        Service::new(
            name.to_string(),
            self.inner.client.clone(),
            self.inner.sink.clone(),
            self.inner.cancel.child_token(),
        )
    }

    /// Issue a request to a service method and decode the enveloped
    /// response.
    pub async fn request<P, R>(&self, subject: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        crate::service::request(&self.inner.client, subject, params).await
    }

    /// Host the named sharded producer on this peer.
    ///
    /// The factory is invoked once per subscription identity routed to a
    /// shard this peer serves, and must produce work that is safe to run
    /// on every replica of the shard simultaneously.
    pub async fn producer<C, F>(&self, name: &str, config: ProducerConfig, on_spawn: F) -> Result<Producer<C>>
    where
        C: Destroy + 'static,
        F: Fn(serde_json::Value, String, ProducerClient) -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    {
        Producer::init(
            self.inner.client.clone(),
            self.inner.jetstream.clone(),
            self.inner.config.clone(),
            self.inner.sink.clone(),
            self.inner.cancel.child_token(),
            self.inner.peer_id.clone(),
            name.to_string(),
            config,
            Arc::new(on_spawn),
        )
        .await
    }

    /// Consume the named producer with the given parameters.
    ///
    /// The durable identity of the consumption is `name`; two consumers
    /// sharing a name share redelivery state.
    pub async fn consumer<T, F>(&self, producer: &str, name: &str, params: serde_json::Value, callback: F) -> Result<Consumer>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Consumer::init(
            self.inner.client.clone(),
            self.inner.jetstream.clone(),
            self.inner.config.clone(),
            self.inner.sink.clone(),
            self.inner.cancel.child_token(),
            producer.to_string(),
            name.to_string(),
            params,
            Arc::new(callback),
        )
        .await
    }

    /// Tear down this peer.
    ///
    /// Cancels the root token, unwinding every component task constructed
    /// through this backend, and flushes the connection.
    pub async fn destroy(&self) {
        self.inner.cancel.cancel();
        if let Err(err) = self.inner.client.flush().await {
            tracing::warn!(error = ?err, "error flushing connection during teardown");
        }
        tracing::info!(peer = %self.inner.peer_id, "backend destroyed");
    }
}
