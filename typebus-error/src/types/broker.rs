use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки клиента брокера.
///
/// Всё, что касается связи, повторяемо: решение о повторе принимает
/// вызывающая сторона (dispatch) или насос (poll).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("broker operation '{operation}' timed out")]
    Timeout { operation: String },

    #[error("connection to the broker is closed")]
    Disconnected,

    #[error("unknown topic '{topic}'")]
    UnknownTopic { topic: String },

    #[error("partition {partition} does not exist in topic '{topic}'")]
    InvalidPartition { topic: String, partition: u32 },

    #[error("broker rejected the request: {reason}")]
    Rejected { reason: String },
}

impl BrokerError {
    /// Можно ли повторить операцию.
    pub fn is_retryable(&self) -> bool {
        self.status_code().is_retryable()
    }
}

impl ErrorExt for BrokerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unreachable { .. } => StatusCode::ConnectionFailed,
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Disconnected => StatusCode::ConnectionClosed,
            Self::UnknownTopic { .. } => StatusCode::UnknownTopic,
            Self::InvalidPartition { .. } => StatusCode::InvalidPartition,
            Self::Rejected { .. } => StatusCode::BrokerRejected,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn client_message(&self) -> String {
        match self {
            Self::Unreachable { .. } | Self::Disconnected => "Broker unavailable".to_string(),
            Self::Timeout { operation } => format!("Broker timeout during {operation}"),
            _ => self.to_string(),
        }
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "broker".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        match self {
            Self::UnknownTopic { topic } | Self::InvalidPartition { topic, .. } => {
                tags.push(("topic", topic.clone()));
            }
            _ => {}
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(BrokerError::Disconnected.is_retryable());
        assert!(BrokerError::Timeout {
            operation: "poll".into()
        }
        .is_retryable());
        assert!(!BrokerError::UnknownTopic {
            topic: "orders".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_client_message_hides_address() {
        let err = BrokerError::Unreachable {
            address: "10.0.0.1:9092".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.client_message(), "Broker unavailable");
        assert!(err.to_string().contains("10.0.0.1:9092"));
    }

    #[test]
    fn test_topic_tag() {
        let err = BrokerError::InvalidPartition {
            topic: "orders".into(),
            partition: 7,
        };
        assert!(err.metrics_tags().contains(&("topic", "orders".to_string())));
    }
}
