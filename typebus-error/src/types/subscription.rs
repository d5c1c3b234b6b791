use std::any::Any;

use thiserror::Error;

use crate::{BrokerError, ErrorExt, StatusCode, TopicNameError};

/// Ошибки подписки/отписки.
///
/// Конкуренция за одну и ту же подписку сюда не попадает: она разрешается
/// сериализацией вызовов.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("cannot derive topic for '{type_name}': {source}")]
    Topic {
        type_name: String,
        #[source]
        source: TopicNameError,
    },

    #[error("failed to provision topic '{topic}': {source}")]
    Provision {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to position consumer group on topic '{topic}': {source}")]
    Offsets {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("subscription store failure: {reason}")]
    Store { reason: String },
}

impl ErrorExt for SubscriptionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Topic { .. } => StatusCode::InvalidTopicName,
            Self::Provision { source, .. } | Self::Offsets { source, .. } => source.status_code(),
            Self::Store { .. } => StatusCode::SubscriptionFailed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
