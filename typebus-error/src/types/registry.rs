use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки реестра иерархии типов.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("message type '{type_name}' is registered twice")]
    Duplicate { type_name: String },

    #[error("'{type_name}' refers to unregistered type '{missing}'")]
    UnknownReference { type_name: String, missing: String },

    #[error("'{type_name}' cannot extend '{base}': {reason}")]
    InvalidBase {
        type_name: String,
        base: String,
        reason: &'static str,
    },

    #[error("'{type_name}' cannot implement '{interface}': not an interface")]
    NotAnInterface { type_name: String, interface: String },

    #[error("inheritance cycle through '{type_name}'")]
    Cycle { type_name: String },

    #[error("message type '{type_name}' is not registered")]
    UnknownType { type_name: String },
}

impl ErrorExt for RegistryError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownType { .. } => StatusCode::UnknownMessageType,
            _ => StatusCode::InvalidTypeHierarchy,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
