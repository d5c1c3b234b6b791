use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки конфигурации. Фатальны: обнаруживаются на старте, до того как
/// насос перейдёт в `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting '{key}'")]
    MissingValue { key: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to load settings: {0}")]
    Source(String),

    #[error(transparent)]
    InvalidTopicName(#[from] TopicNameError),
}

/// Ошибки имени топика.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicNameError {
    #[error("topic name is empty")]
    Empty,

    #[error("topic name '{name}' is too long ({len} > {max})")]
    TooLong { name: String, len: usize, max: usize },

    #[error("topic name '{name}' contains illegal character {ch:?}")]
    IllegalCharacter { name: String, ch: char },

    #[error("address segment '{segment}' contains the qualifier separator '.'")]
    SeparatorInSegment { segment: String },

    #[error("endpoint name '{name}' is reserved for message type topics")]
    Reserved { name: String },
}

impl ErrorExt for ConfigError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingValue { .. } => StatusCode::MissingConfig,
            Self::InvalidValue { .. } | Self::Source(_) => StatusCode::InvalidConfig,
            Self::InvalidTopicName(_) => StatusCode::InvalidTopicName,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "config".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        match self {
            Self::MissingValue { key } | Self::InvalidValue { key, .. } => {
                tags.push(("key", key.clone()));
            }
            _ => {}
        }
        tags
    }
}

impl ErrorExt for TopicNameError {
    fn status_code(&self) -> StatusCode {
        StatusCode::InvalidTopicName
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
