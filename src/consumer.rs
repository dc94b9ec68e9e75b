//! Durable consumers of producer streams.
//!
//! A consumer discovers its stream by calling the producer's subscribe
//! endpoint, opens a durable JetStream consumer on it, and re-runs the
//! subscribe flow on a heartbeat. The heartbeat doubles as the renewal of
//! the subscription record producer-side and as the recovery path
//! consumer-side: when the worker dies (missed idle heartbeats or a
//! closed message stream) the summoner slot is killed, and the next
//! heartbeat opens a fresh consumer from scratch. Delivery is
//! at-least-once: the callback acks on success and naks with exponential
//! backoff on failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::MessagesErrorKind;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::faults::FaultSink;
use crate::producer::{SubscribeParams, SubscribeResult};
use crate::retry::{retry, RetryPolicy};
use crate::service;
use crate::spawner::Destroy;
use crate::summoner::{CompareFn, SummonFn, Summoner};
use crate::timer::Timer;
use crate::utils;

/// The idle heartbeat requested from the JetStream consumer.
const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);
/// Consecutive missed idle heartbeats which kill the worker.
const MAX_MISSED_HEARTBEATS: u32 = 2;
/// The cap applied to nak redelivery backoff.
const MAX_NAK_DELAY: Duration = Duration::from_secs(60);

/// An async callback invoked per consumed event.
pub type EventCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A durable consumer of one producer subscription.
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    heartbeat: Option<Timer>,
    supervisor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// State shared with the heartbeat and supervisor tasks.
struct ConsumerShared {
    client: async_nats::Client,
    producer: String,
    params: serde_json::Value,
    summoner: Summoner<SubscribeResult, StreamWorker>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Create a new instance, subscribing immediately.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn init<T>(
        client: async_nats::Client, jetstream: jetstream::Context, app_config: Arc<Config>, sink: FaultSink, cancel: CancellationToken,
        producer: String, name: String, params: serde_json::Value, callback: EventCallback<T>,
    ) -> Result<Self>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let durable = utils::sanitize_name(&name);
        let (failures_tx, failures_rx) = mpsc::channel::<()>(1);
        let mut failures_rx = ReceiverStream::new(failures_rx);

        // The summoner's slot is keyed by the subscribe result, so a
        // heartbeat returning an unchanged stream is a no-op while a
        // changed one replaces the worker wholesale.
        let worker_sink = sink.clone();
        let worker_cancel = cancel.clone();
        let factory: SummonFn<SubscribeResult, StreamWorker> = Arc::new(move |result: SubscribeResult| {
            let (jetstream, callback) = (jetstream.clone(), callback.clone());
            let (durable, sink) = (durable.clone(), worker_sink.clone());
            let (failures, cancel) = (failures_tx.clone(), worker_cancel.child_token());
            Box::pin(async move { StreamWorker::init(jetstream, result.stream, durable, callback, sink, cancel, failures).await })
        });
        let compare: CompareFn<SubscribeResult> = Arc::new(|current, next| current == next);
        let summoner = Summoner::with_compare(factory, compare);

        let shared = Arc::new(ConsumerShared {
            client,
            producer,
            params,
            summoner,
            cancel: cancel.clone(),
        });
        shared.subscribe().await?;

        // A dead worker is only ever replaced through the summoner, and
        // killing it from inside the worker task would deadlock on the
        // slot; failures are routed through this task instead.
        let supervisor_shared = shared.clone();
        let supervisor_sink = sink.clone();
        let supervisor_cancel = cancel.clone();
        let supervisor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor_cancel.cancelled() => break,
                    res = failures_rx.next() => match res {
                        Some(()) => {
                            tracing::debug!(producer = %supervisor_shared.producer, "stream worker failed, killing summoner");
                            if let Err(err) = supervisor_shared.summoner.kill().await {
                                supervisor_sink.report("consumer", err);
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let heartbeat_shared = shared.clone();
        let heartbeat = Timer::spawn(
            "consumer-heartbeat",
            app_config.heartbeat_interval(),
            sink,
            cancel.child_token(),
            Arc::new(move || {
                let shared = heartbeat_shared.clone();
                Box::pin(async move { shared.subscribe().await })
            }),
        );

        Ok(Self {
            shared,
            heartbeat: Some(heartbeat),
            supervisor: Some(supervisor),
            cancel,
        })
    }

    /// Tear down this consumer, closing its JetStream consumer.
    pub async fn destroy(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.destroy().await;
        }
        if let Err(err) = self.shared.summoner.destroy().await {
            tracing::warn!(error = ?err, "error destroying stream worker");
        }
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                tracing::error!(error = ?err, "error joining consumer supervisor");
            }
        }
    }
}

impl ConsumerShared {
    /// Run the subscribe flow once.
    ///
    /// The RPC gets a short bounded retry; a final failure kills the
    /// summoner so the next heartbeat re-subscribes from scratch.
    async fn subscribe(&self) -> Result<()> {
        let policy = RetryPolicy {
            retries: 2,
            min_delay: Duration::from_secs(1),
            factor: 2.0,
            ..Default::default()
        };
        let subject = format!("producer.{}.subscribe", &self.producer);
        let request = SubscribeParams { params: self.params.clone() };
        let res = retry(&policy, &self.cancel, |_err, _attempt| true, || {
            service::request::<_, SubscribeResult>(&self.client, &subject, &request)
        })
        .await;
        match res {
            Ok(result) => self.summoner.spawn(result).await,
            Err(err) => {
                self.summoner.kill().await?;
                Err(err.context("subscribe request failed"))
            }
        }
    }
}

/// A task consuming one stream through a durable JetStream consumer.
struct StreamWorker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Open the durable consumer and begin consumption.
    async fn init<T>(
        jetstream: jetstream::Context, stream: String, durable: String, callback: EventCallback<T>, sink: FaultSink,
        cancel: CancellationToken, failures: mpsc::Sender<()>,
    ) -> Result<Self>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let source = jetstream
            .get_stream(&stream)
            .await
            .map_err(anyhow::Error::from)
            .with_context(|| format!("error looking up stream {}", &stream))?;
        let consumer = source
            .create_consumer(pull::Config {
                durable_name: Some(durable),
                deliver_policy: DeliverPolicy::New,
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(anyhow::Error::from)
            .context("error creating durable consumer")?;
        let mut messages = consumer
            .stream()
            .heartbeat(IDLE_HEARTBEAT)
            .messages()
            .await
            .map_err(anyhow::Error::from)
            .context("error starting consumption")?;

        tracing::debug!(stream, "stream worker started");
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut missed_heartbeats = 0u32;
            loop {
                let next = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    next = messages.next() => next,
                };
                match next {
                    Some(Ok(message)) => {
                        missed_heartbeats = 0;
                        handle_message(&callback, &sink, message).await;
                    }
                    Some(Err(err)) if err.kind() == MessagesErrorKind::MissingHeartbeat => {
                        missed_heartbeats += 1;
                        tracing::debug!(stream = %stream, missed_heartbeats, "idle heartbeat missed");
                        if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                            let _ = failures.send(()).await;
                            break;
                        }
                    }
                    Some(Err(err)) => sink.report("consumer", anyhow::Error::from(err)),
                    None => {
                        tracing::debug!(stream = %stream, "message stream closed");
                        let _ = failures.send(()).await;
                        break;
                    }
                }
            }
        });
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

#[async_trait]
impl Destroy for StreamWorker {
    async fn destroy(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "error joining stream worker task");
            }
        }
        Ok(())
    }
}

/// Process one delivery: ack on success, nak with backoff on failure.
async fn handle_message<T>(callback: &EventCallback<T>, sink: &FaultSink, message: jetstream::Message)
where
    T: DeserializeOwned + Send + 'static,
{
    let outcome = match utils::decode::<T>(&message.payload) {
        Ok(event) => callback(event).await,
        Err(err) => Err(err.context("error decoding event payload")),
    };
    match outcome {
        Ok(()) => {
            if let Err(err) = message.ack().await {
                sink.report("consumer", anyhow::anyhow!(err).context("error acknowledging delivery"));
            }
        }
        Err(err) => {
            let delivered = message.info().map(|info| info.delivered).unwrap_or(1);
            let delay = nak_delay(delivered);
            sink.report("consumer", err.context("event callback failed"));
            if let Err(err) = message.ack_with(AckKind::Nak(Some(delay))).await {
                sink.report("consumer", anyhow::anyhow!(err).context("error negatively acknowledging delivery"));
            }
        }
    }
}

/// The redelivery backoff: `1 s · 2^(deliveries − 1)`, capped at 60 s.
pub(crate) fn nak_delay(delivered: i64) -> Duration {
    let exponent = (delivered - 1).clamp(0, 16) as u32;
    let delay = Duration::from_secs(1 << exponent);
    delay.min(MAX_NAK_DELAY)
}
