use std::{any::Any, error::Error as StdError, fmt};

use thiserror::Error;

use crate::{BrokerError, ErrorExt, StatusCode};

/// Ошибки жизненного цикла насоса сообщений.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PumpError {
    #[error("pump is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("failed to connect consumer: {0}")]
    Connect(#[source] BrokerError),

    #[error("pump faulted after {failures} consecutive poll failures: {last}")]
    Faulted { failures: u32, last: BrokerError },

    #[error("pump did not stop within {timeout_ms} ms")]
    StopTimeout { timeout_ms: u64 },

    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

impl ErrorExt for PumpError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidState { .. } => StatusCode::InvalidState,
            Self::Connect(e) => e.status_code(),
            Self::Faulted { .. } => StatusCode::PumpFaulted,
            Self::StopTimeout { .. } => StatusCode::StopTimeout,
            Self::WorkerPanicked { .. } => StatusCode::WorkerPanicked,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Ошибка прикладного обработчика сообщения.
///
/// Запись с такой ошибкой не подтверждается и будет доставлена повторно.
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Оборачивает произвольную ошибку приложения.
    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "handler failed: {}", self.message)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl ErrorExt for HandlerError {
    fn status_code(&self) -> StatusCode {
        StatusCode::HandlerFailed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
