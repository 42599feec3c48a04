use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerConsumer, GroupMembership, RebalanceEvent};
use crate::config::SubscriptionConfig;
use crate::error::{Result, SubscriptionError};
use crate::kafka::base_consumer_config;
use crate::record::{OffsetMap, Record, TopicPartition};

const META_TIMEOUT: Duration = Duration::from_secs(10);

/// Queues rebalance callbacks so the worker can drain them after each poll
/// and run listeners synchronously on its own task.
#[derive(Default)]
pub(crate) struct RebalanceTracker {
    events: Mutex<Vec<RebalanceEvent>>,
}

impl RebalanceTracker {
    fn push(&self, event: RebalanceEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    fn drain(&self) -> Vec<RebalanceEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }
}

impl ClientContext for RebalanceTracker {}

impl ConsumerContext for RebalanceTracker {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.push(RebalanceEvent::Revoked(partitions_of(tpl)));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.push(RebalanceEvent::Assigned(partitions_of(tpl))),
            Rebalance::Error(e) => warn!(error = %e, "rebalance error"),
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn topic_partitions(
    consumer: &StreamConsumer<RebalanceTracker>,
    topic: &str,
) -> Result<Vec<i32>> {
    let metadata = consumer.fetch_metadata(Some(topic), META_TIMEOUT)?;
    let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Err(SubscriptionError::fatal(format!(
            "topic {topic} not found in broker metadata"
        )));
    };
    Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
}

pub struct KafkaConsumer {
    // Arc so seek/commit/metadata calls can move a handle onto the blocking
    // pool; librdkafka blocks the calling thread for those.
    inner: Arc<StreamConsumer<RebalanceTracker>>,
    group_id: String,
}

impl KafkaConsumer {
    /// Consumer-group member for subscribed topics.
    pub(crate) fn in_group(config: &SubscriptionConfig) -> Result<Self> {
        Self::create(config, config.group_id.clone())
    }

    /// Assign-only consumer outside the subscription's group. librdkafka
    /// still requires a group id, so it gets a throwaway one that never
    /// commits.
    pub(crate) fn standalone(config: &SubscriptionConfig) -> Result<Self> {
        Self::create(
            config,
            format!("{}-replay-{}", config.group_id, Uuid::new_v4()),
        )
    }

    fn create(config: &SubscriptionConfig, group_id: String) -> Result<Self> {
        let inner: StreamConsumer<RebalanceTracker> = base_consumer_config(config)
            .set("group.id", &group_id)
            .create_with_context(RebalanceTracker::default())?;
        debug!(group_id = %group_id, brokers = %config.brokers, "kafka consumer created");
        Ok(Self {
            inner: Arc::new(inner),
            group_id,
        })
    }

    fn tpl_of(partitions: &[TopicPartition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        tpl
    }

    /// Run a blocking librdkafka call off the async runtime.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&StreamConsumer<RebalanceTracker>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| SubscriptionError::fatal(format!("blocking consumer call panicked: {e}")))?
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.inner.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if records.is_empty() => return Err(e.into()),
                // Surface the error on the next poll; deliver what we have.
                Ok(Err(_)) => break,
                Ok(Ok(message)) => records.push(Record {
                    topic: message.topic().to_string(),
                    partition: Some(message.partition()),
                    offset: Some(message.offset()),
                    key: String::from_utf8_lossy(message.key().unwrap_or_default()).into_owned(),
                    value: message.payload().map(|p| p.to_vec()),
                    timestamp: message.timestamp().to_millis(),
                }),
            }
        }
        Ok(records)
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.inner.subscribe(&names)?;
        Ok(())
    }

    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.inner.assign(&Self::tpl_of(partitions))?;
        Ok(())
    }

    async fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        let tp = tp.clone();
        self.blocking(move |inner| {
            inner.seek(&tp.topic, tp.partition, Offset::Offset(offset), META_TIMEOUT)?;
            Ok(())
        })
        .await
    }

    async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let partitions = partitions.to_vec();
        self.blocking(move |inner| {
            for tp in &partitions {
                inner.seek(&tp.topic, tp.partition, Offset::Beginning, META_TIMEOUT)?;
            }
            Ok(())
        })
        .await
    }

    async fn seek_to_committed(&mut self) -> Result<()> {
        self.blocking(move |inner| {
            let committed = inner.committed(META_TIMEOUT)?;
            for elem in committed.elements() {
                let target = match elem.offset() {
                    Offset::Offset(offset) => Offset::Offset(offset),
                    _ => Offset::Beginning,
                };
                inner.seek(elem.topic(), elem.partition(), target, META_TIMEOUT)?;
            }
            Ok(())
        })
        .await
    }

    async fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.inner.pause(&Self::tpl_of(partitions))?;
        Ok(())
    }

    async fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.inner.resume(&Self::tpl_of(partitions))?;
        Ok(())
    }

    async fn commit(&mut self, offsets: &OffsetMap) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (tp, next) in offsets.iter() {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next))?;
        }
        self.blocking(move |inner| {
            inner.commit(&tpl, CommitMode::Sync)?;
            Ok(())
        })
        .await
    }

    async fn end_offsets(&mut self, topic: &str) -> Result<HashMap<i32, i64>> {
        let topic = topic.to_string();
        self.blocking(move |inner| {
            let mut ends = HashMap::new();
            for partition in topic_partitions(inner, &topic)? {
                let (_low, high) = inner.fetch_watermarks(&topic, partition, META_TIMEOUT)?;
                ends.insert(partition, high);
            }
            Ok(ends)
        })
        .await
    }

    async fn position(&mut self) -> Result<OffsetMap> {
        let mut positions = OffsetMap::new();
        for elem in self.inner.position()?.elements() {
            let next = match elem.offset() {
                Offset::Offset(offset) => offset,
                // Nothing fetched yet on this partition.
                _ => 0,
            };
            positions.set(TopicPartition::new(elem.topic(), elem.partition()), next);
        }
        Ok(positions)
    }

    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>> {
        let topic = topic.to_string();
        self.blocking(move |inner| topic_partitions(inner, &topic)).await
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        match self.inner.assignment() {
            Ok(tpl) => partitions_of(&tpl),
            Err(e) => {
                warn!(error = %e, "failed to read assignment");
                Vec::new()
            }
        }
    }

    fn take_rebalances(&mut self) -> Vec<RebalanceEvent> {
        self.inner.client().context().drain()
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn group_membership(&self) -> Result<GroupMembership> {
        self.inner
            .group_metadata()
            .map(GroupMembership::Kafka)
            .ok_or_else(|| {
                SubscriptionError::fatal("consumer has no group metadata (not a group member)")
            })
    }
}
