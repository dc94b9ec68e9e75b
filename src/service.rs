//! Subject subscriptions & request/reply services.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context as AnyhowContext, Result};
use async_nats::Client;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{deserialize_error, serialize_error, Envelope};
use crate::faults::FaultSink;
use crate::listener::Listener;
use crate::utils;

/// A decoded message delivered to a subscription callback.
pub struct Delivery<T> {
    /// The decoded payload.
    pub data: T,
    /// The message headers.
    pub headers: BTreeMap<String, String>,
    replier: Replier,
}

impl<T> Delivery<T> {
    /// Publish a response on the delivery's reply subject.
    pub async fn respond<R: Serialize>(&self, value: &R) -> Result<()> {
        self.replier.send(value).await
    }
}

/// The reply side of a delivery.
struct Replier {
    reply: Option<String>,
    client: Client,
}

impl Replier {
    async fn send<R: Serialize>(&self, value: &R) -> Result<()> {
        let reply = match &self.reply {
            Some(reply) => reply.clone(),
            None => bail!("delivery carries no reply subject"),
        };
        let payload = utils::encode(value)?;
        self.client.publish(reply, payload).await.context("error publishing response")
    }
}

/// An async callback invoked per subscription delivery.
pub type DeliveryCallback<T> = Arc<dyn Fn(Delivery<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A subscription on a subject, optionally load-balanced by a queue group.
///
/// Each message is decoded and handed to the callback; callback and decode
/// failures are reported through the fault sink and do not unsubscribe.
pub struct Subscription {
    listener: Listener,
    cancel: CancellationToken,
}

impl Subscription {
    /// Begin the subscription.
    pub(crate) async fn init<T>(
        client: Client, subject: String, queue: Option<String>, sink: FaultSink, cancel: CancellationToken, callback: DeliveryCallback<T>,
    ) -> Result<Self>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let subscriber = match queue {
            Some(queue) => client.queue_subscribe(subject.clone(), queue).await,
            None => client.subscribe(subject.clone()).await,
        }
        .with_context(|| format!("error subscribing to {}", &subject))?;

        let stream = subscriber.map(Ok).take_until(cancel.clone().cancelled_owned());
        let decoding: crate::listener::Callback<async_nats::Message> = Arc::new(move |message: async_nats::Message| {
            let (callback, client) = (callback.clone(), client.clone());
            Box::pin(async move {
                let data = utils::decode::<T>(&message.payload)
                    .with_context(|| format!("error decoding message on {}", message.subject.as_str()))?;
                let delivery = Delivery {
                    data,
                    headers: message.headers.as_ref().map(utils::from_headers).unwrap_or_default(),
                    replier: Replier {
                        reply: message.reply.as_ref().map(|reply| reply.to_string()),
                        client,
                    },
                };
                callback(delivery).await
            })
        });
        let listener = Listener::spawn("subscription", stream, sink, decoding);
        Ok(Self { listener, cancel })
    }

    /// Close the subscription and await the listener's completion.
    pub async fn destroy(self) {
        self.cancel.cancel();
        self.listener.destroy().await;
    }
}

/// A request/reply service: a named set of method handlers.
///
/// Each method binds the subject `<service>.<method>` with a queue group
/// equal to the full subject, so each request is handled by exactly one
/// registered peer. Handler outcomes cross the wire as an [`Envelope`]:
/// client-kind errors keep their message, everything else is genericized.
pub struct Service {
    name: String,
    client: Client,
    sink: FaultSink,
    cancel: CancellationToken,
    methods: Mutex<Vec<Subscription>>,
}

impl Service {
    /// Create a new instance.
    pub(crate) fn new(name: String, client: Client, sink: FaultSink, cancel: CancellationToken) -> Self {
        Self {
            name,
            client,
            sink,
            cancel,
            methods: Mutex::new(vec![]),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method handler.
    pub async fn register<P, R, F>(&self, method: &str, handler: F) -> Result<()>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + Sync + 'static,
        F: Fn(P) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
    {
        let subject = format!("{}.{}", &self.name, method);
        let handler = Arc::new(handler);
        let callback: DeliveryCallback<P> = Arc::new(move |delivery: Delivery<P>| {
            let handler = handler.clone();
            Box::pin(async move {
                let Delivery { data, replier, .. } = delivery;
                let envelope = match handler(data).await {
                    Ok(result) => Envelope::Result { result },
                    Err(err) => {
                        tracing::debug!(error = ?err, "service method returned an error");
                        Envelope::Error { error: serialize_error(&err) }
                    }
                };
                replier.send(&envelope).await
            })
        });
        let subscription = Subscription::init(
            self.client.clone(),
            subject.clone(),
            Some(subject),
            self.sink.clone(),
            self.cancel.child_token(),
            callback,
        )
        .await?;
        self.methods.lock().await.push(subscription);
        Ok(())
    }

    /// Unregister every method and await their completion.
    pub async fn destroy(&self) {
        let methods = {
            let mut guard = self.methods.lock().await;
            std::mem::take(&mut *guard)
        };
        for subscription in methods {
            subscription.destroy().await;
        }
    }
}

/// Issue a request and decode the enveloped response.
///
/// An enveloped error is deserialized back into an [`crate::AppError`] of
/// the matching kind; a payload which is neither result nor error is a
/// protocol error and fails decoding.
pub(crate) async fn request<P, R>(client: &Client, subject: &str, params: &P) -> Result<R>
where
    P: Serialize,
    R: DeserializeOwned,
{
    let payload = utils::encode(params)?;
    let message = client
        .request(subject.to_string(), payload)
        .await
        .map_err(anyhow::Error::from)
        .with_context(|| format!("error requesting {}", subject))?;
    let envelope: Envelope<R> =
        utils::decode(&message.payload).with_context(|| format!("protocol error in response from {}", subject))?;
    match envelope {
        Envelope::Result { result } => Ok(result),
        Envelope::Error { error } => Err(deserialize_error(error).into()),
    }
}
