//! Random-access point reads over a topic.
//!
//! One consumer is assigned (not subscribed, so no consumer-group rebalancing)
//! to every partition of the target topic, with all partitions paused. A
//! read resumes and seeks just the target partition, polls once, and pauses
//! it again. Reads are serialized through a request channel so the consumer
//! handle stays confined to the worker task.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::broker::{BrokerConsumer, ClientFactory};
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::{Result, SubscriptionError};
use crate::record::{Record, TopicPartition};

struct ReadRequest {
    partition: i32,
    offset: i64,
    reply: oneshot::Sender<Result<Option<Record>>>,
}

pub struct RandomAccessSubscription<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    requests: Mutex<Option<mpsc::Sender<ReadRequest>>>,
    handle: SubscriptionHandle,
}

impl<F: ClientFactory> RandomAccessSubscription<F> {
    pub fn new(config: SubscriptionConfig, factory: Arc<F>) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("random-access/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            factory,
            requests: Mutex::new(None),
            handle,
        })
    }

    pub fn start(&self) {
        // Sender swap and launch happen under one lock; concurrent starts
        // must not leave the worker reading a replaced channel. Lock order
        // (requests before worker) matches stop().
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if self.handle.is_running() {
            return;
        }
        let (tx, rx) = mpsc::channel(16);
        *requests = Some(tx);
        self.handle.launch(RandomAccessTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            requests: rx,
        });
    }

    pub async fn stop(&self) {
        {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            *requests = None;
        }
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Read the single record at `(partition, offset)`, or `None` when the
    /// position holds no record. More than one record at that exact position
    /// is a broker consistency violation and reported as fatal.
    pub async fn get_record(&self, partition: i32, offset: i64) -> Result<Option<Record>> {
        let sender = {
            let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.clone()
        };
        let Some(sender) = sender else {
            return Err(SubscriptionError::intermittent(
                "random-access subscription is not running",
            ));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(ReadRequest {
                partition,
                offset,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubscriptionError::intermittent("random-access worker is gone"))?;
        reply_rx.await.map_err(|_| {
            SubscriptionError::intermittent("random-access worker restarted during the read")
        })?
    }
}

struct RandomAccessTask<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    requests: mpsc::Receiver<ReadRequest>,
}

#[async_trait]
impl<F: ClientFactory> SubscriptionTask for RandomAccessTask<F> {
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let topic = self.config.topic.clone();
        let mut consumer = self.factory.standalone_consumer(&self.config).await?;
        let mut partitions = assign_all(&mut consumer, &topic).await?;
        info!(topic = %topic, partitions = partitions.len(), "random-access reader assigned");

        loop {
            if ctx.should_stop() {
                return Ok(());
            }
            let request =
                match tokio::time::timeout(self.config.poll_timeout, self.requests.recv()).await {
                    Err(_) => continue, // re-check the stop flag
                    Ok(None) => return Ok(()), // all senders dropped via stop()
                    Ok(Some(request)) => request,
                };

            let result = self
                .serve(&mut consumer, &mut partitions, &request)
                .await;
            let escalate = match &result {
                Ok(_) => None,
                Err(e) if e.is_fatal() => Some(SubscriptionError::fatal(e.to_string())),
                Err(e) => Some(SubscriptionError::intermittent(e.to_string())),
            };
            // A dropped reply receiver just means the caller gave up waiting.
            let _ = request.reply.send(result);
            match escalate {
                Some(e) => return Err(e),
                None => ctx.mark_progress(),
            }
        }
    }
}

impl<F: ClientFactory> RandomAccessTask<F> {
    async fn serve(
        &self,
        consumer: &mut F::Consumer,
        partitions: &mut Vec<TopicPartition>,
        request: &ReadRequest,
    ) -> Result<Option<Record>> {
        let topic = &self.config.topic;

        // The topic may have grown since the last assignment; re-assign to
        // the full current partition set before serving.
        let current = consumer.partitions_for(topic).await?;
        if current.len() > partitions.len() {
            debug!(
                topic = %topic,
                known = partitions.len(),
                current = current.len(),
                "partition count grew, re-assigning"
            );
            *partitions = assign_all(consumer, topic).await?;
        }

        let target = TopicPartition::new(topic.clone(), request.partition);
        if !partitions.contains(&target) {
            return Err(SubscriptionError::fatal(format!(
                "partition {} does not exist in topic {topic}",
                request.partition
            )));
        }

        consumer.resume(std::slice::from_ref(&target)).await?;
        consumer.seek(&target, request.offset).await?;
        let records = consumer
            .poll(self.config.max_batch_size, self.config.poll_timeout)
            .await?;
        consumer.pause(std::slice::from_ref(&target)).await?;

        let mut matches: Vec<Record> = records
            .into_iter()
            .filter(|r| r.partition == Some(request.partition) && r.offset == Some(request.offset))
            .collect();
        if matches.len() > 1 {
            return Err(SubscriptionError::fatal(format!(
                "{} records found at {}-{} offset {}",
                matches.len(),
                topic,
                request.partition,
                request.offset
            )));
        }
        Ok(matches.pop())
    }
}

/// Assign every partition of `topic` and leave them all paused.
async fn assign_all<C: BrokerConsumer>(
    consumer: &mut C,
    topic: &str,
) -> Result<Vec<TopicPartition>> {
    let partitions: Vec<TopicPartition> = consumer
        .partitions_for(topic)
        .await?
        .into_iter()
        .map(|p| TopicPartition::new(topic.to_string(), p))
        .collect();
    consumer.assign(&partitions).await?;
    consumer.pause(&partitions).await?;
    Ok(partitions)
}
