//! State-and-event join engine.
//!
//! Two correlated, co-partitioned topics: an event topic (the driver) and a
//! state topic (the materialized side). Partition assignment on the event
//! topic loads the matching state-topic partitions into an in-memory
//! per-partition key→state map; revocation discards exactly those entries.
//!
//! The main loop polls a batch of events, groups them by key (first-seen key
//! order, per-key arrival order) and feeds each `(state, event)` pair to the
//! processor under a cancellable deadline. A timed-out or failing call yields
//! no response: the event is dead-lettered as a poison record and its state
//! is tombstoned. Everything a batch produces (output records, one
//! updated-or-tombstone state record per modified key, poison records, and
//! the event offsets) commits as a single producer transaction, and the
//! in-memory cache is only mutated after that commit succeeds. Within a
//! batch, later events for a key observe the state staged by earlier ones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{BrokerConsumer, ClientFactory, RebalanceEvent};
use crate::codec::Codec;
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::{Result, SubscriptionError};
use crate::record::{OffsetMap, Record, TopicPartition};
use crate::transactional::commit_atomically;

/// Outcome of one processor call: output records plus the updated state.
/// `state: None` tombstones the entity.
#[derive(Debug, Clone)]
pub struct StateEventResponse<S> {
    pub outputs: Vec<Record>,
    pub state: Option<S>,
}

#[async_trait]
pub trait StateEventProcessor<S, E>: Send + Sync + 'static {
    async fn handle(&self, state: Option<&S>, event: &E) -> Result<StateEventResponse<S>>;
}

/// Optional notification hook for state synchronization.
pub trait StateSyncListener<S>: Send + Sync + 'static {
    /// Invoked after a state-topic partition has been replayed into memory.
    fn on_state_synced(&self, partition: i32, states: &HashMap<String, S>);

    /// Invoked when an event partition (and its state entries) is discarded.
    fn on_partition_revoked(&self, partition: i32);
}

/// Envelope published to the dead-letter topic for a non-terminating event,
/// carrying the original key/state/event payloads for offline inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonRecord {
    pub key: String,
    /// Serialized state at the time of failure, if the entity had one.
    pub state: Option<String>,
    /// Raw event payload.
    pub event: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

type PartitionedCache<S> = Arc<RwLock<HashMap<i32, HashMap<String, S>>>>;

pub struct StateEventSubscription<F: ClientFactory, S, E> {
    config: SubscriptionConfig,
    state_topic: String,
    factory: Arc<F>,
    processor: Arc<dyn StateEventProcessor<S, E>>,
    state_codec: Arc<dyn Codec<S>>,
    event_codec: Arc<dyn Codec<E>>,
    listener: Option<Arc<dyn StateSyncListener<S>>>,
    cache: PartitionedCache<S>,
    handle: SubscriptionHandle,
}

impl<F, S, E> StateEventSubscription<F, S, E>
where
    F: ClientFactory,
    S: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SubscriptionConfig,
        state_topic: impl Into<String>,
        factory: Arc<F>,
        processor: Arc<dyn StateEventProcessor<S, E>>,
        state_codec: Arc<dyn Codec<S>>,
        event_codec: Arc<dyn Codec<E>>,
        listener: Option<Arc<dyn StateSyncListener<S>>>,
    ) -> Result<Self> {
        config.validate()?;
        let state_topic = state_topic.into();
        if state_topic.is_empty() {
            return Err(SubscriptionError::Config("state_topic is empty".into()));
        }
        let handle = SubscriptionHandle::new(
            format!("state-event/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            state_topic,
            factory,
            processor,
            state_codec,
            event_codec,
            listener,
            cache: Arc::new(RwLock::new(HashMap::new())),
            handle,
        })
    }

    pub fn start(&self) {
        self.handle.launch(StateEventTask {
            config: self.config.clone(),
            state_topic: self.state_topic.clone(),
            factory: Arc::clone(&self.factory),
            processor: Arc::clone(&self.processor),
            state_codec: Arc::clone(&self.state_codec),
            event_codec: Arc::clone(&self.event_codec),
            listener: self.listener.clone(),
            cache: Arc::clone(&self.cache),
        });
    }

    pub async fn stop(&self) {
        self.handle.stop().await;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.clear();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

struct StateEventTask<F: ClientFactory, S, E> {
    config: SubscriptionConfig,
    state_topic: String,
    factory: Arc<F>,
    processor: Arc<dyn StateEventProcessor<S, E>>,
    state_codec: Arc<dyn Codec<S>>,
    event_codec: Arc<dyn Codec<E>>,
    listener: Option<Arc<dyn StateSyncListener<S>>>,
    cache: PartitionedCache<S>,
}

struct BatchEvent<E> {
    record: Record,
    /// `Err` carries the reason the payload was unusable. Undecodable events
    /// keep their place in the batch so per-key arrival order holds.
    payload: std::result::Result<E, String>,
}

/// State change staged during a batch, applied to the cache only after the
/// transaction commits.
struct StagedEntry<S> {
    partition: i32,
    value: Option<S>,
}

#[async_trait]
impl<F, S, E> SubscriptionTask for StateEventTask<F, S, E>
where
    F: ClientFactory,
    S: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut consumer = self.factory.consumer(&self.config).await?;
        let producer = self.factory.transactional_producer(&self.config).await?;
        consumer.subscribe(&[self.config.topic.clone()]).await?;
        let mut retries: u32 = 0;

        while !ctx.should_stop() {
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            self.apply_rebalances(consumer.take_rebalances(), ctx).await?;
            if records.is_empty() {
                continue;
            }

            match self.process_batch(&consumer, &producer, &records).await {
                Ok(()) => {
                    retries = 0;
                    ctx.mark_progress();
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    retries += 1;
                    warn!(
                        topic = %self.config.topic,
                        attempt = retries,
                        error = %e,
                        "event batch failed, resetting to last committed offset"
                    );
                    consumer.seek_to_committed().await?;
                    if retries > self.config.max_poll_retries {
                        return Err(SubscriptionError::IntermittentExhausted {
                            attempts: retries,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl<F, S, E> StateEventTask<F, S, E>
where
    F: ClientFactory,
    S: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    async fn apply_rebalances(
        &self,
        events: Vec<RebalanceEvent>,
        ctx: &SessionContext,
    ) -> Result<()> {
        for event in events {
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    let ids: Vec<i32> = partitions.iter().map(|tp| tp.partition).collect();
                    self.sync_state_partitions(&ids, ctx).await?;
                }
                RebalanceEvent::Revoked(partitions) => {
                    let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
                    for tp in &partitions {
                        cache.remove(&tp.partition);
                        if let Some(listener) = &self.listener {
                            listener.on_partition_revoked(tp.partition);
                        }
                    }
                    debug!(partitions = ?partitions, "discarded state for revoked partitions");
                }
            }
        }
        Ok(())
    }

    /// Replay the state-topic partitions matching newly assigned event
    /// partitions into the in-memory cache.
    async fn sync_state_partitions(&self, partitions: &[i32], ctx: &SessionContext) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let mut loader = self.factory.standalone_consumer(&self.config).await?;
        let assigned: Vec<TopicPartition> = partitions
            .iter()
            .map(|&p| TopicPartition::new(self.state_topic.clone(), p))
            .collect();
        loader.assign(&assigned).await?;
        let ends = loader.end_offsets(&self.state_topic).await?;
        loader.seek_to_beginning(&assigned).await?;

        let mut synced: HashMap<i32, HashMap<String, S>> =
            partitions.iter().map(|&p| (p, HashMap::new())).collect();
        loop {
            if ctx.should_stop() {
                return Ok(());
            }
            let positions = loader.position().await?;
            let caught_up = assigned.iter().all(|tp| {
                let end = ends.get(&tp.partition).copied().unwrap_or(0);
                end == 0 || positions.get(tp).unwrap_or(0) >= end
            });
            if caught_up {
                break;
            }
            let records = loader
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            for record in records {
                let Some(partition) = record.partition else {
                    continue;
                };
                let entry = synced.entry(partition).or_default();
                match record.value.as_deref() {
                    None => {
                        entry.remove(&record.key);
                    }
                    Some(raw) => match self.state_codec.deserialize(&record.topic, raw) {
                        Ok(state) => {
                            entry.insert(record.key.clone(), state);
                        }
                        Err(e) => warn!(
                            topic = %record.topic,
                            partition,
                            offset = record.offset.unwrap_or(-1),
                            error = %e,
                            "skipping undecodable state record during sync"
                        ),
                    },
                }
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (partition, states) in synced {
            info!(
                state_topic = %self.state_topic,
                partition,
                entities = states.len(),
                "state partition synchronized"
            );
            if let Some(listener) = &self.listener {
                listener.on_state_synced(partition, &states);
            }
            cache.insert(partition, states);
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        consumer: &F::Consumer,
        producer: &F::TxProducer,
        records: &[Record],
    ) -> Result<()> {
        let mut outputs: Vec<Record> = Vec::new();
        let mut staged: HashMap<String, StagedEntry<S>> = HashMap::new();
        let mut staged_order: Vec<String> = Vec::new();

        for (key, events) in group_by_key(&self.decode(records)) {
            for event in events {
                let payload = match &event.payload {
                    Ok(payload) => payload,
                    Err(reason) => {
                        // Poisoned where it arrived, so a later event for
                        // this key observes the tombstone, not stale state.
                        self.stage_poison(
                            &event.record,
                            reason,
                            &mut outputs,
                            &mut staged,
                            &mut staged_order,
                        );
                        continue;
                    }
                };
                let partition = event.record.partition.unwrap_or(0);
                // Later events for this key must observe the state staged by
                // earlier ones, not the pre-batch state.
                let state: Option<S> = match staged.get(&key) {
                    Some(entry) => entry.value.clone(),
                    None => {
                        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
                        cache
                            .get(&partition)
                            .and_then(|states| states.get(&key))
                            .cloned()
                    }
                };

                let call = self.processor.handle(state.as_ref(), payload);
                let response =
                    match tokio::time::timeout(self.config.processing_timeout, call).await {
                        Err(_) => {
                            Err(SubscriptionError::ProcessingTimeout(
                                self.config.processing_timeout,
                            ))
                        }
                        Ok(result) => result,
                    };

                match response {
                    Ok(response) => {
                        outputs.extend(response.outputs);
                        stage(
                            &mut staged,
                            &mut staged_order,
                            &key,
                            partition,
                            response.state,
                        );
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        // Non-terminating: poison the event, invalidate the
                        // entity.
                        warn!(
                            topic = %event.record.topic,
                            key = %key,
                            partition,
                            offset = event.record.offset.unwrap_or(-1),
                            error = %e,
                            "processor did not produce a response, dead-lettering event"
                        );
                        self.stage_poison(
                            &event.record,
                            &e.to_string(),
                            &mut outputs,
                            &mut staged,
                            &mut staged_order,
                        );
                    }
                }
            }
        }

        // One state record per modified key, in first-modified order.
        for key in &staged_order {
            let entry = &staged[key];
            let record = match &entry.value {
                Some(state) => Record::new(
                    self.state_topic.clone(),
                    key.clone(),
                    self.state_codec.serialize(state)?,
                ),
                None => Record::tombstone(self.state_topic.clone(), key.clone()),
            };
            outputs.push(record.with_partition(entry.partition));
        }

        let offsets = OffsetMap::from_records(records);
        commit_atomically(consumer, producer, &outputs, &offsets).await?;

        // The transaction is durable; only now may in-flight readers observe
        // the new state.
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (key, entry) in staged {
            let states = cache.entry(entry.partition).or_default();
            match entry.value {
                Some(state) => {
                    states.insert(key, state);
                }
                None => {
                    states.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Decode every record in the batch, keeping arrival order. Records with
    /// no usable payload carry the reason instead of a payload.
    fn decode(&self, records: &[Record]) -> Vec<BatchEvent<E>> {
        records
            .iter()
            .map(|record| {
                let payload = match record.value.as_deref() {
                    None => Err("event has no payload".to_string()),
                    Some(raw) => self
                        .event_codec
                        .deserialize(&record.topic, raw)
                        .map_err(|e| e.to_string()),
                };
                BatchEvent {
                    record: record.clone(),
                    payload,
                }
            })
            .collect()
    }

    /// Queue a poison record for the dead-letter topic and tombstone the
    /// entity's state.
    fn stage_poison(
        &self,
        record: &Record,
        error: &str,
        outputs: &mut Vec<Record>,
        staged: &mut HashMap<String, StagedEntry<S>>,
        staged_order: &mut Vec<String>,
    ) {
        let partition = record.partition.unwrap_or(0);
        // Report the state the processor would have seen: what an earlier
        // event in this batch staged, or else the committed cache entry.
        let current: Option<S> = match staged.get(&record.key) {
            Some(entry) => entry.value.clone(),
            None => {
                let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
                cache
                    .get(&partition)
                    .and_then(|states| states.get(&record.key))
                    .cloned()
            }
        };
        let state_json = current
            .and_then(|s| self.state_codec.serialize(&s).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let poison = PoisonRecord {
            key: record.key.clone(),
            state: state_json,
            event: record
                .value
                .as_deref()
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
            error: error.to_string(),
            timestamp: Utc::now(),
        };
        match serde_json::to_vec(&poison) {
            Ok(bytes) => outputs.push(Record::new(
                self.config.dead_letter_topic(&record.topic),
                record.key.clone(),
                bytes,
            )),
            Err(e) => warn!(key = %record.key, error = %e, "failed to encode poison record"),
        }
        stage(staged, staged_order, &record.key, partition, None);
    }
}

fn stage<S>(
    staged: &mut HashMap<String, StagedEntry<S>>,
    staged_order: &mut Vec<String>,
    key: &str,
    partition: i32,
    value: Option<S>,
) {
    if !staged.contains_key(key) {
        staged_order.push(key.to_string());
    }
    staged.insert(
        key.to_string(),
        StagedEntry { partition, value },
    );
}

/// Group a batch by key, preserving first-seen order of distinct keys and
/// arrival order within each key.
fn group_by_key<E>(events: &[BatchEvent<E>]) -> Vec<(String, Vec<&BatchEvent<E>>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&BatchEvent<E>>> = HashMap::new();
    for event in events {
        let key = event.record.key.clone();
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        group.push(event);
    }
    order
        .into_iter()
        .map(|key| {
            let group = groups.remove(&key).unwrap_or_default();
            (key, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, offset: i64) -> BatchEvent<u32> {
        BatchEvent {
            record: Record {
                topic: "events".into(),
                partition: Some(0),
                offset: Some(offset),
                key: key.into(),
                value: Some(b"{}".to_vec()),
                timestamp: None,
            },
            payload: Ok(offset as u32),
        }
    }

    fn undecodable(key: &str, offset: i64) -> BatchEvent<u32> {
        BatchEvent {
            payload: Err("bad json".into()),
            ..event(key, offset)
        }
    }

    #[test]
    fn grouping_preserves_first_seen_key_order() {
        let events = vec![event("b", 0), event("a", 1), event("b", 2), event("a", 3)];
        let groups = group_by_key(&events);
        let keys: Vec<&str> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn grouping_preserves_arrival_order_within_a_key() {
        let events = vec![event("k", 5), event("other", 6), event("k", 7)];
        let groups = group_by_key(&events);
        let offsets: Vec<i64> = groups[0]
            .1
            .iter()
            .map(|e| e.record.offset.unwrap())
            .collect();
        assert_eq!(offsets, [5, 7]);
    }

    #[test]
    fn grouping_keeps_undecodable_events_at_their_arrival_position() {
        let events = vec![event("k", 0), undecodable("k", 1), event("k", 2)];
        let groups = group_by_key(&events);
        assert_eq!(groups.len(), 1);
        let payloads: Vec<bool> = groups[0].1.iter().map(|e| e.payload.is_ok()).collect();
        assert_eq!(payloads, [true, false, true]);
    }

    #[test]
    fn poison_record_round_trips_through_json() {
        let poison = PoisonRecord {
            key: "entity-1".into(),
            state: Some("{\"size\":3}".into()),
            event: Some("{\"op\":\"grow\"}".into()),
            error: "processor call timed out after 10s".into(),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&poison).unwrap();
        let decoded: PoisonRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.key, "entity-1");
        assert_eq!(decoded.state, poison.state);
        assert_eq!(decoded.error, poison.error);
    }

    #[test]
    fn staging_keeps_first_modification_order() {
        let mut staged: HashMap<String, StagedEntry<u32>> = HashMap::new();
        let mut order = Vec::new();
        stage(&mut staged, &mut order, "b", 0, Some(1));
        stage(&mut staged, &mut order, "a", 0, Some(2));
        stage(&mut staged, &mut order, "b", 0, None);
        assert_eq!(order, ["b", "a"]);
        assert!(staged["b"].value.is_none());
    }
}
