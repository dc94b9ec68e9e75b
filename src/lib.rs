//! Lattice is a distributed application fabric built on NATS & JetStream.
//!
//! A set of peer processes connected to the same JetStream-enabled NATS
//! cluster form a cooperative fabric: any peer may host request/reply
//! services, publish on subjects, hold replicated key/value state, take
//! distributed locks, and host sharded event producers whose subscribers
//! receive durable at-least-once streams.
//!
//! ## Producers & consumers
//! The centerpiece is the producer/consumer subsystem. A [`Producer`] is a
//! named logical component hosted by every peer that constructs it. Peers
//! advertise their liveness in a coordination KV bucket, elect a shard
//! distribution through compare-and-swap, and each pick up the shards
//! assigned to them. Consumers call the producer's subscribe endpoint,
//! which routes their parameters to a shard and provisions a JetStream
//! stream per parameter identity; identical parameters from different
//! consumers converge on the same stream. The shard's host peers observe
//! the subscription records and spawn the user's event sources, which
//! publish into the stream through a [`ProducerClient`].
//!
//! ## Ownership
//! Every long-lived object exposes `destroy`, and teardown is strictly
//! last-in-first-out: a parent that constructs a child owns it and destroys
//! it before its own resources go away. The [`Backend`] holds the root
//! cancellation token; cancelling it unwinds every retry loop and task the
//! fabric has spawned.

mod backend;
mod config;
mod consumer;
mod error;
#[cfg(test)]
mod error_test;
mod faults;
#[cfg(test)]
mod fixtures;
mod kv;
mod listener;
mod mutex;
#[cfg(test)]
mod mutex_test;
mod producer;
mod retry;
#[cfg(test)]
mod retry_test;
mod service;
mod spawner;
mod summoner;
#[cfg(test)]
mod summoner_test;
mod timer;
#[cfg(test)]
mod timer_test;
mod utils;
#[cfg(test)]
mod utils_test;
mod watcher;

pub use crate::backend::Backend;
pub use crate::config::Config;
pub use crate::consumer::Consumer;
pub use crate::error::{
    deserialize_error, serialize_error, AppError, Canceled, Envelope, WireError, CODE_CLIENT, CODE_INTERNAL,
};
pub use crate::faults::FaultSink;
pub use crate::kv::{Bucket, Cell, Slice};
pub use crate::mutex::Locks;
pub use crate::producer::{
    DistributionRecord, InstanceRecord, Producer, ProducerClient, ProducerConfig, SubscribeResult, SubscriptionRecord,
};
pub use crate::retry::RetryPolicy;
pub use crate::service::{Delivery, Service, Subscription};
pub use crate::spawner::{Destroy, Spawner};
pub use crate::summoner::Summoner;
pub use crate::timer::{Scheduler, SchedulerHandle, Timer};
pub use crate::watcher::{EntryOperation, Update, Watcher};
pub use async_trait::async_trait;
