//! Request/response correlation over the log.
//!
//! Requests carry their own reply destination (topic, optional partition)
//! and a correlation id. Each request is dispatched to a user responder;
//! whether the responder's future succeeds, fails, or reports cancellation,
//! a correlated response is published directly to the reply
//! destination. Replies are best-effort and fire-and-forget: they bypass the
//! transactional path, and publish failures are logged and swallowed so they
//! never disturb the primary poll loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::{BrokerConsumer, BrokerProducer, ClientFactory};
use crate::codec::{Codec, JsonCodec};
use crate::config::SubscriptionConfig;
use crate::driver::{SessionContext, SubscriptionHandle, SubscriptionTask};
use crate::error::Result;
use crate::record::{OffsetMap, Record};

/// A request record, with its embedded reply destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub correlation_id: String,
    pub reply_topic: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_partition: Option<i32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcStatus {
    Ok,
    Failed,
    Cancelled,
}

/// The correlated response published to the caller's reply destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub correlation_id: String,
    pub status: RpcStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// How a responder call ended without a payload.
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// User hook producing the response payload for a request.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn respond(
        &self,
        request: &RpcRequest,
    ) -> std::result::Result<serde_json::Value, ResponderError>;
}

pub struct RpcSubscription<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    responder: Arc<dyn Responder>,
    handle: SubscriptionHandle,
}

impl<F: ClientFactory> RpcSubscription<F> {
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<F>,
        responder: Arc<dyn Responder>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = SubscriptionHandle::new(
            format!("rpc/{}", config.topic),
            config.stop_timeout,
            config.backoff,
        );
        Ok(Self {
            config,
            factory,
            responder,
            handle,
        })
    }

    pub fn start(&self) {
        self.handle.launch(RpcTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            responder: Arc::clone(&self.responder),
            codec: Arc::new(JsonCodec::new()),
        });
    }

    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

struct RpcTask<F: ClientFactory> {
    config: SubscriptionConfig,
    factory: Arc<F>,
    responder: Arc<dyn Responder>,
    codec: Arc<JsonCodec<RpcRequest>>,
}

#[async_trait]
impl<F: ClientFactory> SubscriptionTask for RpcTask<F> {
    async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut consumer = self.factory.consumer(&self.config).await?;
        let producer = self.factory.producer(&self.config).await?;
        consumer.subscribe(&[self.config.topic.clone()]).await?;

        while !ctx.should_stop() {
            let records = consumer
                .poll(self.config.max_batch_size, self.config.poll_timeout)
                .await?;
            consumer.take_rebalances();
            if records.is_empty() {
                continue;
            }

            for record in &records {
                let Some(raw) = record.value.as_deref() else {
                    warn!(topic = %record.topic, key = %record.key, "request has no payload, skipping");
                    continue;
                };
                let request = match self.codec.deserialize(&record.topic, raw) {
                    Ok(request) => request,
                    Err(e) => {
                        // No reply destination is recoverable from a
                        // malformed request.
                        warn!(topic = %record.topic, key = %record.key, error = %e, "undecodable request, skipping");
                        continue;
                    }
                };

                let response = match self.responder.respond(&request).await {
                    Ok(payload) => RpcResponse {
                        correlation_id: request.correlation_id.clone(),
                        status: RpcStatus::Ok,
                        payload: Some(payload),
                        error: None,
                    },
                    Err(ResponderError::Cancelled) => RpcResponse {
                        correlation_id: request.correlation_id.clone(),
                        status: RpcStatus::Cancelled,
                        payload: None,
                        error: Some("cancelled".to_string()),
                    },
                    Err(ResponderError::Failed(reason)) => RpcResponse {
                        correlation_id: request.correlation_id.clone(),
                        status: RpcStatus::Failed,
                        payload: None,
                        error: Some(reason),
                    },
                };
                self.publish_reply(&producer, &request, &response).await;
            }

            consumer.commit(&OffsetMap::from_records(&records)).await?;
            ctx.mark_progress();
        }
        Ok(())
    }
}

impl<F: ClientFactory> RpcTask<F> {
    /// Best-effort reply: a publish failure is logged and swallowed.
    async fn publish_reply(
        &self,
        producer: &F::Producer,
        request: &RpcRequest,
        response: &RpcResponse,
    ) {
        let bytes = match serde_json::to_vec(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    correlation_id = %response.correlation_id,
                    error = %e,
                    "failed to serialize response, dropping reply"
                );
                return;
            }
        };
        let mut reply = Record::new(
            request.reply_topic.clone(),
            request.correlation_id.clone(),
            bytes,
        );
        if let Some(partition) = request.reply_partition {
            reply = reply.with_partition(partition);
        }
        match producer.send(&reply).await {
            Ok((partition, offset)) => debug!(
                reply_topic = %request.reply_topic,
                partition,
                offset,
                correlation_id = %request.correlation_id,
                "reply published"
            ),
            Err(e) => warn!(
                reply_topic = %request.reply_topic,
                correlation_id = %request.correlation_id,
                error = %e,
                "failed to publish reply, dropping it"
            ),
        }
    }
}
