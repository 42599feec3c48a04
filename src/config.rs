//! Subscription configuration.

use std::time::Duration;

use crate::error::{Result, SubscriptionError};

/// Exponential backoff between reconnect attempts.
///
/// One consistent policy for every subscription flavor: the delay doubles per
/// consecutive failed attempt and is capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Configuration shared by all subscription flavors.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Kafka brokers (comma-separated).
    pub brokers: String,
    /// Consumer group ID.
    pub group_id: String,
    /// Topic this subscription consumes. For the state-and-event engine this
    /// is the event topic; the state topic is passed separately.
    pub topic: String,
    /// Max records returned by one poll.
    pub max_batch_size: usize,
    /// How long a single poll blocks waiting for records.
    pub poll_timeout: Duration,
    /// Consecutive poll/process failures tolerated before the retry driver
    /// tears down and recreates the client handles.
    pub max_poll_retries: u32,
    /// Backoff between reconnect attempts.
    pub backoff: RetryBackoff,
    /// How long `stop()` waits for the worker before abandoning it.
    pub stop_timeout: Duration,
    /// Suffix appended to a topic name to form its dead-letter destination.
    pub dead_letter_suffix: String,
    /// Transactional producer id. Defaults to `<group_id>-tx` when unset so a
    /// recreated producer fences its own zombie.
    pub transactional_id: Option<String>,
    /// Deadline for a single state-and-event processor call.
    pub processing_timeout: Duration,
}

impl SubscriptionConfig {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(SubscriptionError::Config("brokers is empty".into()));
        }
        if self.group_id.is_empty() {
            return Err(SubscriptionError::Config("group_id is empty".into()));
        }
        if self.topic.is_empty() {
            return Err(SubscriptionError::Config("topic is empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(SubscriptionError::Config("max_batch_size is zero".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(SubscriptionError::Config("poll_timeout is zero".into()));
        }
        if self.processing_timeout.is_zero() {
            return Err(SubscriptionError::Config(
                "processing_timeout is zero".into(),
            ));
        }
        if self.dead_letter_suffix.is_empty() {
            return Err(SubscriptionError::Config(
                "dead_letter_suffix is empty".into(),
            ));
        }
        Ok(())
    }

    /// Effective transactional id for this subscription's producer.
    pub fn effective_transactional_id(&self) -> String {
        self.transactional_id
            .clone()
            .unwrap_or_else(|| format!("{}-tx", self.group_id))
    }

    /// Dead-letter destination for `topic`.
    pub fn dead_letter_topic(&self, topic: &str) -> String {
        format!("{}{}", topic, self.dead_letter_suffix)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: String::new(),
            topic: String::new(),
            max_batch_size: 256,
            poll_timeout: Duration::from_millis(500),
            max_poll_retries: 5,
            backoff: RetryBackoff::default(),
            stop_timeout: Duration::from_secs(30),
            dead_letter_suffix: ".dlq".to_string(),
            transactional_id: None,
            processing_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_needs_group_and_topic() {
        assert!(SubscriptionConfig::default().validate().is_err());
        let config = SubscriptionConfig::new("localhost:9092", "group", "chunks");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = SubscriptionConfig {
            max_batch_size: 0,
            ..SubscriptionConfig::new("localhost:9092", "group", "chunks")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn transactional_id_defaults_to_group() {
        let config = SubscriptionConfig::new("localhost:9092", "loader", "chunks");
        assert_eq!(config.effective_transactional_id(), "loader-tx");

        let config = SubscriptionConfig {
            transactional_id: Some("custom".into()),
            ..config
        };
        assert_eq!(config.effective_transactional_id(), "custom");
    }

    #[test]
    fn dead_letter_topic_appends_suffix() {
        let config = SubscriptionConfig::new("localhost:9092", "group", "events");
        assert_eq!(config.dead_letter_topic("events"), "events.dlq");
    }
}
