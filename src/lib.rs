//! # Kafka Subscription Engine
//!
//! This library layers multiple consumption-and-processing contracts on top
//! of a partitioned, replicated, append-only log (Kafka): the same
//! poll → process → commit primitive, packaged as six subscription flavors
//! with different delivery guarantees.
//!
//! ## Subscription flavors
//!
//! | Flavor | Guarantee | Entry point |
//! |--------|-----------|-------------|
//! | At-most-once pub/sub | fire-and-forget, per-record commit | [`AtMostOnceSubscription`] |
//! | Durable batch | exactly-once consume-process-produce | [`DurableSubscription`] |
//! | Event log | exactly-once + typed payloads + dead-letter | [`EventLogSubscription`] |
//! | Compacted cache | full-log materialized key→value map | [`CompactedSubscription`] |
//! | State-and-event join | per-partition state cache joined to an event stream | [`StateEventSubscription`] |
//! | Random access | point reads by (partition, offset) | [`RandomAccessSubscription`] |
//! | RPC correlation | request/response matching over topics | [`RpcSubscription`] |
//!
//! ## Lifecycle
//!
//! Every subscription owns exactly one background worker task. `start()` is
//! idempotent while running; `stop()` signals the worker and joins it with a
//! bounded timeout. Transient broker failures (network blips, rebalances in
//! progress) are retried forever with exponential backoff by recreating the
//! client handles; misconfiguration and programming errors stop the
//! subscription. See [`SubscriptionError`] for the full taxonomy.
//!
//! ## Exactly-once
//!
//! The transactional flavors commit produced records and the consumed batch's
//! offsets in a single producer transaction. Either every observable effect
//! of a batch lands, or none does: a crash before commit replays the batch
//! from the last committed offset without duplicating downstream output.
//!
//! ## Usage example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use kafka_subscriptions::{
//!     BatchProcessor, DurableSubscription, KafkaClientFactory, Record, SubscriptionConfig,
//! };
//!
//! struct ChunkLoader;
//!
//! #[async_trait::async_trait]
//! impl BatchProcessor for ChunkLoader {
//!     async fn process_batch(
//!         &self,
//!         records: &[Record],
//!     ) -> kafka_subscriptions::Result<Vec<Record>> {
//!         // Transform each chunk and forward it downstream. The engine
//!         // commits these outputs atomically with the input offsets.
//!         Ok(records
//!             .iter()
//!             .map(|r| Record::new("chunks.loaded", r.key.clone(), r.value.clone().unwrap_or_default()))
//!             .collect())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SubscriptionConfig::new("localhost:9092", "chunk-loader", "chunks");
//!     let subscription = DurableSubscription::new(
//!         config,
//!         Arc::new(KafkaClientFactory::new()),
//!         Arc::new(ChunkLoader),
//!     )?;
//!     subscription.start();
//!     // ... run until shutdown ...
//!     subscription.stop().await;
//!     Ok(())
//! }
//! ```

mod at_most_once;
mod broker;
mod codec;
mod compacted;
mod config;
mod driver;
mod error;
mod kafka;
mod random_access;
mod record;
mod rpc;
mod state_event;
mod transactional;

pub use at_most_once::{AtMostOnceSubscription, RecordProcessor};
pub use broker::{
    BrokerConsumer, BrokerProducer, ClientFactory, GroupMembership, RebalanceEvent,
    TransactionalProducer,
};
pub use codec::{Codec, JsonCodec};
pub use compacted::{CompactedProcessor, CompactedSubscription};
pub use config::{RetryBackoff, SubscriptionConfig};
pub use driver::SubscriptionHandle;
pub use error::{Result, SubscriptionError};
pub use kafka::{KafkaClientFactory, KafkaConsumer, KafkaProducer, KafkaTxProducer};
pub use random_access::RandomAccessSubscription;
pub use record::{OffsetMap, Record, TopicPartition};
pub use rpc::{Responder, ResponderError, RpcRequest, RpcResponse, RpcStatus, RpcSubscription};
pub use state_event::{
    PoisonRecord, StateEventProcessor, StateEventResponse, StateEventSubscription,
    StateSyncListener,
};
pub use transactional::{
    BatchProcessor, DurableSubscription, Event, EventLogSubscription, EventProcessor,
    RebalanceListener,
};
