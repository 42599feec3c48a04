use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SubscriptionError>;

/// Tagged error taxonomy for the retry driver.
///
/// Every failure is classified at its origin so the lifecycle loop can switch
/// on the tag instead of inspecting exception types downstream:
/// - `Fatal` / `Config` stop the subscription.
/// - `Intermittent` resets the consumer to the last committed position and
///   retries; `IntermittentExhausted` escalates to a full client-handle
///   teardown and rebuild.
/// - `Deserialization` is never fatal; the offending record is dead-lettered
///   and skipped.
/// - `ProcessingTimeout` is treated like a processing failure (state-and-event
///   only: dead-letter the event, tombstone its state).
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal subscription error: {0}")]
    Fatal(String),

    #[error("intermittent broker error: {0}")]
    Intermittent(String),

    #[error("intermittent retries exhausted after {attempts} attempts: {reason}")]
    IntermittentExhausted { attempts: u32, reason: String },

    #[error("failed to deserialize record from {topic}: {reason}")]
    Deserialization { topic: String, reason: String },

    #[error("processor call timed out after {0:?}")]
    ProcessingTimeout(Duration),
}

impl SubscriptionError {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn intermittent(reason: impl Into<String>) -> Self {
        Self::Intermittent(reason.into())
    }

    /// True for failures the driver retries by recreating client handles.
    pub fn is_intermittent(&self) -> bool {
        matches!(
            self,
            Self::Intermittent(_) | Self::IntermittentExhausted { .. }
        )
    }

    /// True for failures that stop the subscription.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Config(_))
    }
}

impl From<KafkaError> for SubscriptionError {
    fn from(err: KafkaError) -> Self {
        match err.rdkafka_error_code() {
            Some(code) if is_transient(code) => Self::Intermittent(err.to_string()),
            _ => Self::Fatal(err.to_string()),
        }
    }
}

fn is_transient(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotEnoughReplicas
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermittent_classification() {
        assert!(SubscriptionError::intermittent("blip").is_intermittent());
        assert!(SubscriptionError::IntermittentExhausted {
            attempts: 5,
            reason: "blip".into()
        }
        .is_intermittent());
        assert!(!SubscriptionError::fatal("bug").is_intermittent());
    }

    #[test]
    fn fatal_classification() {
        assert!(SubscriptionError::fatal("bug").is_fatal());
        assert!(SubscriptionError::Config("empty brokers".into()).is_fatal());
        assert!(!SubscriptionError::ProcessingTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!SubscriptionError::Deserialization {
            topic: "events".into(),
            reason: "bad json".into()
        }
        .is_fatal());
    }

    #[test]
    fn transport_failures_map_to_intermittent() {
        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(SubscriptionError::from(err).is_intermittent());
    }

    #[test]
    fn unknown_broker_errors_map_to_fatal() {
        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::InvalidConfig);
        assert!(SubscriptionError::from(err).is_fatal());
    }
}
