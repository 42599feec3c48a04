//! Exactly-once consume-process-produce.
//!
//! The whole polled batch goes to the processor, which returns zero or more
//! output records for arbitrary destination topics. Outputs and the batch's
//! consumer offsets are committed in one producer transaction: either every
//! observable effect of the batch lands, or none does.
//!
//! [`EventLogSubscription`] layers a typed codec on top: records that fail to
//! deserialize are published raw to `<topic><dead_letter_suffix>` inside the
//! same transaction and never reach the processor, and an optional rebalance
//! listener is notified of partition assignment changes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConsumer, ClientFactory, RebalanceEvent, TransactionalProducer};
use crate::codec::Codec;
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::{Result, SubscriptionError};
use crate::record::{OffsetMap, Record, TopicPartition};

/// Batch processor for the durable flavor: a batch of input records in,
/// output records (to any topic) out.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process_batch(&self, records: &[Record]) -> Result<Vec<Record>>;
}

/// A consumed record with its decoded payload. `payload` is `None` for
/// tombstones.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub record: Record,
    pub payload: Option<T>,
}

/// Typed batch processor for the event-log flavor.
#[async_trait]
pub trait EventProcessor<T>: Send + Sync + 'static {
    async fn process_events(&self, events: &[Event<T>]) -> Result<Vec<Record>>;
}

/// Partition assignment hook, invoked synchronously on the worker task.
pub trait RebalanceListener: Send + Sync + 'static {
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]);
    fn on_partitions_revoked(&self, partitions: &[TopicPartition]);
}

/// Send `outputs`, attach `offsets`, and commit, all in one transaction. A failed
/// commit aborts so the batch has no observable effect.
pub(crate) async fn commit_atomically<C, P>(
    consumer: &C,
    producer: &P,
    outputs: &[Record],
    offsets: &OffsetMap,
) -> Result<()>
where
    C: BrokerConsumer,
    P: TransactionalProducer,
{
    producer.begin_transaction().await?;
    let attempt: Result<()> = async {
        for record in outputs {
            producer.send(record).await?;
        }
        producer
            .send_offsets(offsets, consumer.group_membership()?)
            .await?;
        producer.commit_transaction().await
    }
    .await;

    if let Err(e) = attempt {
        if let Err(abort_err) = producer.abort_transaction().await {
            warn!(error = %abort_err, "failed to abort transaction after commit failure");
        }
        return Err(e);
    }
    Ok(())
}

pub struct DurableSubscription<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn BatchProcessor>,
    handle: SubscriptionHandle,
}

impl<F: ClientFactory> DurableSubscription<F> {
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("durable/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            factory,
            processor,
            handle,
        })
    }

    pub fn start(&self) {
        self.handle.launch(DurableTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            processor: Arc::clone(&self.processor),
        });
    }

    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

struct DurableTask<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn BatchProcessor>,
}

#[async_trait]
impl<F: ClientFactory> SubscriptionTask for DurableTask<F> {
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut consumer = self.factory.consumer(&self.config).await?;
        let producer = self.factory.transactional_producer(&self.config).await?;
        consumer.subscribe(&[self.config.topic.clone()]).await?;
        let mut retries: u32 = 0;

        while !ctx.should_stop() {
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            consumer.take_rebalances();
            if records.is_empty() {
                continue;
            }

            let attempt: Result<()> = async {
                let outputs = self.processor.process_batch(&records).await?;
                let offsets = OffsetMap::from_records(&records);
                commit_atomically(&consumer, &producer, &outputs, &offsets).await
            }
            .await;

            match attempt {
                Ok(()) => {
                    retries = 0;
                    ctx.mark_progress();
                    debug!(
                        topic = %self.config.topic,
                        batch_size = records.len(),
                        "batch committed"
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    retries += 1;
                    warn!(
                        topic = %self.config.topic,
                        attempt = retries,
                        error = %e,
                        "batch failed, resetting to last committed offset"
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

pub struct EventLogSubscription<F: ClientFactory, T> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn EventProcessor<T>>,
    codec: Arc<dyn Codec<T>>,
    listener: Option<Arc<dyn RebalanceListener>>,
    handle: SubscriptionHandle,
}

impl<F, T> EventLogSubscription<F, T>
where
    F: ClientFactory,
    T: Send + Sync + 'static,
{
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        processor: Arc<dyn EventProcessor<T>>,
        codec: Arc<dyn Codec<T>>,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("event-log/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            factory,
            processor,
            codec,
            listener,
            handle,
        })
    }

    pub fn start(&self) {
        self.handle.launch(EventLogTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            processor: Arc::clone(&self.processor),
            codec: Arc::clone(&self.codec),
            listener: self.listener.clone(),
        });
    }

    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

struct EventLogTask<F: ClientFactory, T> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn EventProcessor<T>>,
    codec: Arc<dyn Codec<T>>,
    listener: Option<Arc<dyn RebalanceListener>>,
}

#[async_trait]
impl<F, T> SubscriptionTask for EventLogTask<F, T>
where
    F: ClientFactory,
    T: Send + Sync + 'static,
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
            self.notify_rebalances(consumer.take_rebalances());
            if records.is_empty() {
                continue;
            }

            let (events, dead_letters) = self.decode(&records);

            let attempt: Result<()> = async {
                let mut outputs = if events.is_empty() {
                    Vec::new()
                } else {
                    self.processor.process_events(&events).await?
                };
                outputs.extend(dead_letters.iter().cloned());
                let offsets = OffsetMap::from_records(&records);
                commit_atomically(&consumer, &producer, &outputs, &offsets).await
            }
            .await;

            match attempt {
                Ok(()) => {
                    retries = 0;
                    ctx.mark_progress();
                    if !dead_letters.is_empty() {
                        info!(
                            topic = %self.config.topic,
                            dead_lettered = dead_letters.len(),
                            "undecodable records routed to dead letter"
                        );
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    retries += 1;
                    warn!(
                        topic = %self.config.topic,
                        attempt = retries,
                        error = %e,
                        "batch failed, resetting to last committed offset"
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

impl<F, T> EventLogTask<F, T>
where
    F: ClientFactory,
    T: Send + Sync + 'static,
{
    /// Split a batch into decoded events and raw dead-letter records. A
    /// record that fails to deserialize never reaches the processor.
    fn decode(&self, records: &[Record]) -> (Vec<Event<T>>, Vec<Record>) {
        let mut events = Vec::with_capacity(records.len());
        let mut dead_letters = Vec::new();
        for record in records {
            let Some(raw) = record.value.as_deref() else {
                // Tombstones have nothing to decode; forward them as-is.
                events.push(Event {
                    record: record.clone(),
                    payload: None,
                });
                continue;
            };
            match self.codec.deserialize(&record.topic, raw) {
                Ok(payload) => events.push(Event {
                    record: record.clone(),
                    payload: Some(payload),
                }),
                Err(e) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition.unwrap_or(-1),
                        offset = record.offset.unwrap_or(-1),
                        error = %e,
                        "record failed to deserialize, dead-lettering raw bytes"
                    );
                    dead_letters.push(self.dead_letter_record(record));
                }
            }
        }
        (events, dead_letters)
    }

    fn dead_letter_record(&self, original: &Record) -> Record {
        Record {
            topic: self.config.dead_letter_topic(&original.topic),
            partition: None,
            offset: None,
            key: original.key.clone(),
            value: original.value.clone(),
            timestamp: None,
        }
    }

    fn notify_rebalances(&self, events: Vec<RebalanceEvent>) {
        let Some(listener) = &self.listener else {
            return;
        };
        for event in events {
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    listener.on_partitions_assigned(&partitions)
                }
                RebalanceEvent::Revoked(partitions) => listener.on_partitions_revoked(&partitions),
            }
        }
    }
}
