//! rdkafka-backed implementation of the broker collaborator traits.

mod consumer;
mod producer;

pub use consumer::KafkaConsumer;
pub use producer::{KafkaProducer, KafkaTxProducer};

use async_trait::async_trait;
use rdkafka::ClientConfig;

use crate::broker::ClientFactory;
use crate::config::SubscriptionConfig;
use crate::error::Result;

/// Creates rdkafka consumers and producers tuned for this engine: explicit
/// commits only, read-committed isolation, idempotent producers.
#[derive(Debug, Clone, Default)]
pub struct KafkaClientFactory;

impl KafkaClientFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientFactory for KafkaClientFactory {
    type Consumer = KafkaConsumer;
    type Producer = KafkaProducer;
    type TxProducer = KafkaTxProducer;

    async fn consumer(&self, config: &SubscriptionConfig) -> Result<KafkaConsumer> {
        KafkaConsumer::in_group(config)
    }

    async fn standalone_consumer(&self, config: &SubscriptionConfig) -> Result<KafkaConsumer> {
        KafkaConsumer::standalone(config)
    }

    async fn producer(&self, config: &SubscriptionConfig) -> Result<KafkaProducer> {
        KafkaProducer::new(config)
    }

    async fn transactional_producer(&self, config: &SubscriptionConfig) -> Result<KafkaTxProducer> {
        KafkaTxProducer::new(config).await
    }
}

/// Consumer settings shared by group and standalone consumers. All offset
/// commits in this engine are explicit, so auto-commit stays off.
pub(crate) fn base_consumer_config(config: &SubscriptionConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "3000")
        .set("max.poll.interval.ms", "300000")
        .set("enable.partition.eof", "false")
        .set("isolation.level", "read_committed");
    client_config
}

pub(crate) fn base_producer_config(config: &SubscriptionConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .set("queue.buffering.max.messages", "10000");
    client_config
}
