//! Compacted-topic materialization.
//!
//! On start the worker replays the whole topic into a fresh key→value map
//! (snapshot phase): it records every partition's end offset, seeks to the
//! beginning and polls until each partition has caught up. Tombstones remove
//! entries rather than storing nulls. Once the snapshot is complete the
//! processor receives `on_snapshot` and the live map serves `get_value` in
//! O(1); every later record updates the map and triggers `on_next` before the
//! next poll.
//!
//! The map is owned by the subscription: it is `None` until the first
//! snapshot completes, swapped wholesale on every re-snapshot (a reconnect
//! replays from scratch), and dropped on `stop()`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::{BrokerConsumer, ClientFactory};
use crate::codec::Codec;
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::Result;
use crate::record::{Record, TopicPartition};

type SharedMap<T> = Arc<RwLock<Option<HashMap<String, T>>>>;

pub trait CompactedProcessor<T>: Send + Sync + 'static {
    /// Invoked once per snapshot with the fully materialized view.
    fn on_snapshot(&self, snapshot: &HashMap<String, T>);

    /// Invoked for every incremental record after the snapshot, with the
    /// superseded value (if any) and the already-updated map.
    fn on_next(&self, record: &Record, old_value: Option<&T>, current: &HashMap<String, T>);
}

pub struct CompactedSubscription<F: ClientFactory, T> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn CompactedProcessor<T>>,
    codec: Arc<dyn Codec<T>>,
    state: SharedMap<T>,
    handle: SubscriptionHandle,
}

impl<F, T> CompactedSubscription<F, T>
where
    F: ClientFactory,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        processor: Arc<dyn CompactedProcessor<T>>,
        codec: Arc<dyn Codec<T>>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("compacted/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            factory,
            processor,
            codec,
            state: Arc::new(RwLock::new(None)),
            handle,
        })
    }

    pub fn start(&self) {
        self.handle.launch(CompactedTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            processor: Arc::clone(&self.processor),
            codec: Arc::clone(&self.codec),
            state: Arc::clone(&self.state),
        });
    }

    /// Stops the worker and destroys the materialized map.
    pub async fn stop(&self) {
        self.handle.stop().await;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = None;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Point lookup against the live map. Returns `None` before the first
    /// snapshot has completed, and for keys whose latest record was a
    /// tombstone.
    pub fn get_value(&self, key: &str) -> Option<T> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.as_ref().and_then(|map| map.get(key).cloned())
    }

    /// Whether the snapshot phase has completed at least once.
    pub fn is_materialized(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.is_some()
    }
}

struct CompactedTask<F: ClientFactory, T> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn CompactedProcessor<T>>,
    codec: Arc<dyn Codec<T>>,
    state: SharedMap<T>,
}

#[async_trait]
impl<F, T> SubscriptionTask for CompactedTask<F, T>
where
    F: ClientFactory,
    T: Clone + Send + Sync + 'static,
{
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let topic = self.config.topic.clone();
        let mut consumer = self.factory.standalone_consumer(&self.config).await?;
        let partitions: Vec<TopicPartition> = consumer
            .partitions_for(&topic)
            .await?
            .into_iter()
            .map(|p| TopicPartition::new(topic.clone(), p))
            .collect();
        consumer.assign(&partitions).await?;

        let snapshot = self.replay_snapshot(&mut consumer, ctx, &partitions).await?;
        let Some(snapshot) = snapshot else {
            return Ok(()); // stop requested mid-snapshot
        };
        info!(
            topic = %topic,
            keys = snapshot.len(),
            partitions = partitions.len(),
            "snapshot phase complete"
        );
        self.processor.on_snapshot(&snapshot);
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            *state = Some(snapshot);
        }
        ctx.mark_progress();

        // Incremental phase.
        while !ctx.should_stop() {
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            for record in records {
                let Some(value) = self.decode(&record) else {
                    continue;
                };
                let old_value = {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    let map = state.get_or_insert_with(HashMap::new);
                    match value {
                        Some(v) => map.insert(record.key.clone(), v),
                        None => map.remove(&record.key),
                    }
                };
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                if let Some(map) = state.as_ref() {
                    self.processor.on_next(&record, old_value.as_ref(), map);
                }
            }
            ctx.mark_progress();
        }
        Ok(())
    }
}

impl<F, T> CompactedTask<F, T>
where
    F: ClientFactory,
    T: Clone + Send + Sync + 'static,
{
    /// Replay the full log into a fresh map. Returns `None` when stop was
    /// requested before the replay caught up with the recorded end offsets.
    async fn replay_snapshot(
        &self,
        consumer: &mut F::Consumer,
        ctx: &SessionContext,
        partitions: &[TopicPartition],
    ) -> Result<Option<HashMap<String, T>>> {
        let ends = consumer.end_offsets(&self.config.topic).await?;
        consumer.seek_to_beginning(partitions).await?;
        let mut map = HashMap::new();

        loop {
            if ctx.should_stop() {
                return Ok(None);
            }
            let positions = consumer.position().await?;
            let caught_up = partitions.iter().all(|tp| {
                let end = ends.get(&tp.partition).copied().unwrap_or(0);
                end == 0 || positions.get(tp).unwrap_or(0) >= end
            });
            if caught_up {
                return Ok(Some(map));
            }
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            for record in records {
                match self.decode(&record) {
                    Some(Some(value)) => {
                        map.insert(record.key.clone(), value);
                    }
                    Some(None) => {
                        map.remove(&record.key);
                    }
                    None => {}
                }
            }
        }
    }

    /// `None` = undecodable (skipped), `Some(None)` = tombstone.
    fn decode(&self, record: &Record) -> Option<Option<T>> {
        match record.value.as_deref() {
            None => Some(None),
            Some(raw) => match self.codec.deserialize(&record.topic, raw) {
                Ok(value) => Some(Some(value)),
                Err(e) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition.unwrap_or(-1),
                        offset = record.offset.unwrap_or(-1),
                        error = %e,
                        "skipping undecodable compacted record"
                    );
                    None
                }
            },
        }
    }
}
