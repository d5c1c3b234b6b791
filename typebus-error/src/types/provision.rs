use std::any::Any;

use thiserror::Error;

use crate::{BrokerError, ErrorExt, StatusCode, TopicNameError};

/// Ошибки подготовки топиков.
///
/// «Топик уже существует» ошибкой не является.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("cannot provision invalid topic name: {0}")]
    InvalidTopic(#[from] TopicNameError),

    #[error("failed to create topic '{topic}': {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl ErrorExt for ProvisionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidTopic(_) => StatusCode::InvalidTopicName,
            Self::Broker { source, .. } => source.status_code(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
