use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::debug;

use crate::broker::{BrokerProducer, GroupMembership, TransactionalProducer};
use crate::config::SubscriptionConfig;
use crate::error::{Result, SubscriptionError};
use crate::kafka::base_producer_config;
use crate::record::{OffsetMap, Record};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const TX_TIMEOUT: Duration = Duration::from_secs(30);

fn future_record(record: &Record) -> FutureRecord<'_, str, [u8]> {
    let mut fr = FutureRecord::to(&record.topic).key(record.key.as_str());
    if let Some(payload) = record.value.as_deref() {
        fr = fr.payload(payload);
    }
    if let Some(partition) = record.partition {
        fr = fr.partition(partition);
    }
    fr
}

async fn deliver(producer: &FutureProducer, record: &Record) -> Result<(i32, i64)> {
    producer
        .send(future_record(record), SEND_TIMEOUT)
        .await
        .map_err(|(e, _unsent)| e.into())
}

/// Run a blocking transaction-control call off the async runtime. The
/// librdkafka handle is cheap to clone (refcounted).
async fn blocking<T, F>(producer: &FutureProducer, op: F) -> Result<T>
where
    F: FnOnce(FutureProducer) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let producer = producer.clone();
    tokio::task::spawn_blocking(move || op(producer))
        .await
        .map_err(|e| SubscriptionError::fatal(format!("blocking producer call panicked: {e}")))?
}

/// Plain fire-and-forget producer (RPC replies).
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub(crate) fn new(config: &SubscriptionConfig) -> Result<Self> {
        let inner: FutureProducer = base_producer_config(config).create()?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, record: &Record) -> Result<(i32, i64)> {
        deliver(&self.inner, record).await
    }
}

/// Transactional producer. The transactional id is stable per subscription
/// so a recreated producer fences the zombie it replaces.
pub struct KafkaTxProducer {
    inner: FutureProducer,
}

impl KafkaTxProducer {
    pub(crate) async fn new(config: &SubscriptionConfig) -> Result<Self> {
        let transactional_id = config.effective_transactional_id();
        let inner: FutureProducer = base_producer_config(config)
            .set("transactional.id", &transactional_id)
            .create()?;
        blocking(&inner, |producer| {
            producer.init_transactions(TX_TIMEOUT)?;
            Ok(())
        })
        .await?;
        debug!(transactional_id = %transactional_id, "transactional producer initialized");
        Ok(Self { inner })
    }
}

#[async_trait]
impl BrokerProducer for KafkaTxProducer {
    async fn send(&self, record: &Record) -> Result<(i32, i64)> {
        deliver(&self.inner, record).await
    }
}

#[async_trait]
impl TransactionalProducer for KafkaTxProducer {
    async fn begin_transaction(&self) -> Result<()> {
        self.inner.begin_transaction()?;
        Ok(())
    }

    async fn send_offsets(&self, offsets: &OffsetMap, group: GroupMembership) -> Result<()> {
        let GroupMembership::Kafka(metadata) = group else {
            return Err(SubscriptionError::fatal(
                "kafka transactional producer needs live consumer group metadata",
            ));
        };
        let mut tpl = TopicPartitionList::new();
        for (tp, next) in offsets.iter() {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next))?;
        }
        blocking(&self.inner, move |producer| {
            producer.send_offsets_to_transaction(&tpl, &metadata, TX_TIMEOUT)?;
            Ok(())
        })
        .await
    }

    async fn commit_transaction(&self) -> Result<()> {
        blocking(&self.inner, |producer| {
            producer.commit_transaction(TX_TIMEOUT)?;
            Ok(())
        })
        .await
    }

    async fn abort_transaction(&self) -> Result<()> {
        blocking(&self.inner, |producer| {
            producer.abort_transaction(TX_TIMEOUT)?;
            Ok(())
        })
        .await
    }
}
