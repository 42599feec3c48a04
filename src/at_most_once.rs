//! At-most-once pub/sub processing.
//!
//! Poll a batch, hand each record to the processor, then synchronously commit
//! that record's offset. Nothing is redelivered once its offset is committed.
//! A processing failure seeks the consumer back to the last committed offset;
//! a bounded run of consecutive failures escalates to the retry driver, which
//! recreates the client handles.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::broker::{BrokerConsumer, ClientFactory};
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::{Result, SubscriptionError};
use crate::record::{OffsetMap, Record};

/// Per-record processor for at-most-once delivery.
#[async_trait]
pub trait RecordProcessor: Send + Sync + 'static {
    async fn process(&self, record: &Record) -> Result<()>;
}

pub struct AtMostOnceSubscription<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn RecordProcessor>,
    handle: SubscriptionHandle,
}

impl<F: ClientFactory> AtMostOnceSubscription<F> {
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("at-most-once/{}", config.topic),
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
        self.handle.launch(AtMostOnceTask {
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

struct AtMostOnceTask<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    processor: Arc<dyn RecordProcessor>,
}

#[async_trait]
impl<F: ClientFactory> SubscriptionTask for AtMostOnceTask<F> {
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut consumer = self.factory.consumer(&self.config).await?;
        consumer.subscribe(&[self.config.topic.clone()]).await?;
        let mut failures: u32 = 0;

        while !ctx.should_stop() {
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            consumer.take_rebalances();

            'batch: for record in records {
                if ctx.should_stop() {
                    return Ok(());
                }
                match self.processor.process(&record).await {
                    Ok(()) => {
                        consumer.commit(&OffsetMap::from_records(&[record])).await?;
                        failures = 0;
                        ctx.mark_progress();
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        failures += 1;
                        warn!(
                            topic = %record.topic,
                            partition = record.partition.unwrap_or(-1),
                            offset = record.offset.unwrap_or(-1),
                            consecutive_failures = failures,
                            error = %e,
                            "processing failed, resetting to last committed offset"
                        );
                        consumer.seek_to_committed().await?;
                        if failures > self.config.max_poll_retries {
                            return Err(SubscriptionError::IntermittentExhausted {
                                attempts: failures,
                                reason: e.to_string(),
                            });
                        }
                        // Re-poll from the committed position.
                        break 'batch;
                    }
                }
            }
        }
        debug!(topic = %self.config.topic, "at-most-once session stopping");
        Ok(())
    }
}
