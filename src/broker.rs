//! Broker client collaborator boundary.
//!
//! The engine never talks to rdkafka directly; every flavor is generic over
//! these traits. `src/kafka` provides the production implementation and the
//! integration tests provide an in-memory one, which is what makes the
//! exactly-once and atomicity properties testable without a broker.
//!
//! All handles created through a [`ClientFactory`] are single-threaded
//! resources confined to the worker task of the subscription that created
//! them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::record::{OffsetMap, Record, TopicPartition};

/// Partition assignment change observed by a consumer-group member.
///
/// Events are queued by the client during a poll and drained afterwards with
/// [`BrokerConsumer::take_rebalances`], so listeners run synchronously on the
/// worker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

/// Consumer-group identity attached to transactional offset commits.
///
/// The Kafka variant carries the live group metadata of the consumer that
/// polled the batch; the named variant is enough for in-memory brokers.
pub enum GroupMembership {
    Kafka(rdkafka::consumer::ConsumerGroupMetadata),
    Named(String),
}

impl GroupMembership {
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Kafka(_) => None,
            Self::Named(group) => Some(group),
        }
    }
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Pull up to `max_records`, blocking at most `timeout`. May return an
    /// empty batch.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<Record>>;

    /// Join the consumer group for `topics`; rebalance notifications surface
    /// through [`take_rebalances`](Self::take_rebalances).
    async fn subscribe(&mut self, topics: &[String]) -> Result<()>;

    /// Take `partitions` directly, bypassing consumer-group rebalancing.
    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    async fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()>;

    async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Reset every assigned partition to its last committed offset, or the
    /// beginning when nothing has been committed yet.
    async fn seek_to_committed(&mut self) -> Result<()>;

    async fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    async fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()>;

    /// Synchronously commit the given positions.
    async fn commit(&mut self, offsets: &OffsetMap) -> Result<()>;

    /// Next offset the broker would assign per partition (log end).
    async fn end_offsets(&mut self, topic: &str) -> Result<HashMap<i32, i64>>;

    /// Next offset this consumer will read per assigned partition.
    async fn position(&mut self) -> Result<OffsetMap>;

    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>>;

    fn assignment(&self) -> Vec<TopicPartition>;

    /// Drain rebalance events queued since the last call.
    fn take_rebalances(&mut self) -> Vec<RebalanceEvent>;

    fn group_id(&self) -> &str;

    fn group_membership(&self) -> Result<GroupMembership>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Append one record, returning `(partition, offset)`.
    async fn send(&self, record: &Record) -> Result<(i32, i64)>;
}

/// Producer with atomic cross-topic commit of records plus consumer offsets.
#[async_trait]
pub trait TransactionalProducer: BrokerProducer {
    async fn begin_transaction(&self) -> Result<()>;

    /// Attach consumer positions to the open transaction.
    async fn send_offsets(&self, offsets: &OffsetMap, group: GroupMembership) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;
}

/// Creates broker client handles. The retry driver goes back to the factory
/// every time it tears a session down, so a reconnect is always a fresh set
/// of handles.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Consumer: BrokerConsumer + 'static;
    type Producer: BrokerProducer + 'static;
    type TxProducer: TransactionalProducer + 'static;

    async fn consumer(&self, config: &SubscriptionConfig) -> Result<Self::Consumer>;

    /// Consumer outside any group (for assigned-partition replay).
    async fn standalone_consumer(&self, config: &SubscriptionConfig) -> Result<Self::Consumer>;

    async fn producer(&self, config: &SubscriptionConfig) -> Result<Self::Producer>;

    async fn transactional_producer(&self, config: &SubscriptionConfig)
        -> Result<Self::TxProducer>;
}
