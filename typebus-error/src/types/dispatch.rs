use std::any::Any;

use thiserror::Error;

use crate::{BrokerError, EncodeError, ErrorExt, RegistryError, StatusCode, TopicNameError};

/// Ошибки отправки (send/publish).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    UnknownMessageType(#[from] RegistryError),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] EncodeError),

    #[error("invalid destination address: {0}")]
    InvalidAddress(#[from] TopicNameError),

    #[error("write to topic '{topic}' failed: {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// Часть записей fan-out прошла, часть нет. Уже записанное не
    /// откатывается: решение о повторе за вызывающей стороной.
    #[error(
        "publish of message {message_id} partially failed on {} topic(s)",
        .failed.len()
    )]
    PartialFanout {
        message_id: String,
        delivered: Vec<String>,
        failed: Vec<(String, BrokerError)>,
    },

    #[error("subscription store failure: {reason}")]
    Store { reason: String },
}

impl DispatchError {
    /// Топики, в которые запись не прошла.
    pub fn failed_topics(&self) -> Vec<&str> {
        match self {
            Self::Broker { topic, .. } => vec![topic.as_str()],
            Self::PartialFanout { failed, .. } => failed.iter().map(|(t, _)| t.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

impl ErrorExt for DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownMessageType(e) => e.status_code(),
            Self::Encode(e) => e.status_code(),
            Self::InvalidAddress(_) => StatusCode::InvalidTopicName,
            Self::Broker { source, .. } => source.status_code(),
            Self::PartialFanout { .. } => StatusCode::PartialDelivery,
            Self::Store { .. } => StatusCode::SubscriptionFailed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "dispatch".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Self::Broker { topic, .. } = self {
            tags.push(("topic", topic.clone()));
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fanout_display() {
        let err = DispatchError::PartialFanout {
            message_id: "m-1".into(),
            delivered: vec!["a".into()],
            failed: vec![("b".into(), BrokerError::Disconnected)],
        };
        assert_eq!(
            err.to_string(),
            "publish of message m-1 partially failed on 1 topic(s)"
        );
        assert_eq!(err.failed_topics(), vec!["b"]);
        assert!(err.status_code().is_retryable());
    }

    #[test]
    fn test_broker_error_keeps_status() {
        let err = DispatchError::Broker {
            topic: "billing".into(),
            source: BrokerError::Timeout {
                operation: "produce".into(),
            },
        };
        assert_eq!(err.status_code(), StatusCode::Timeout);
        assert!(err.metrics_tags().contains(&("topic", "billing".to_string())));
    }
}
