use std::{fmt, panic::Location, sync::Arc};

use crate::{ErrorExt, LogLevel, StatusCode};

/// Ошибка публичной поверхности транспорта: корневая ошибка плюс цепочка
/// контекстов, добавленных по пути наверх.
#[derive(Clone)]
pub struct StackError {
    inner: Arc<dyn ErrorExt>,
    contexts: Arc<Vec<ErrorContext>>,
}

/// Один шаг контекста и место в коде, где он добавлен.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub message: String,
    pub location: &'static Location<'static>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StackError {
    pub fn new<E: ErrorExt>(err: E) -> Self {
        Self {
            inner: Arc::new(err),
            contexts: Arc::new(Vec::new()),
        }
    }

    /// Добавляет контекст. Контексты идут от внутреннего к внешнему.
    #[track_caller]
    pub fn context(
        mut self,
        msg: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.contexts).push(ErrorContext {
            message: msg.into(),
            location: Location::caller(),
        });
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.inner.status_code()
    }

    /// Уровень, с которым эту ошибку стоит писать в лог.
    pub fn log_level(&self) -> LogLevel {
        self.status_code().log_level()
    }

    pub fn root(&self) -> &dyn ErrorExt {
        self.inner.as_ref()
    }

    pub fn contexts(&self) -> &[ErrorContext] {
        &self.contexts
    }

    /// Downcast корневой ошибки к конкретному типу.
    pub fn downcast_ref<T: ErrorExt + 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StackError
////////////////////////////////////////////////////////////////////////////////

impl fmt::Debug for StackError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut debug = f.debug_struct("StackError");
        debug.field("inner", &self.inner.to_string());
        debug.field("status_code", &self.status_code());
        if !self.contexts.is_empty() {
            let trail: Vec<String> = self
                .contexts
                .iter()
                .map(|c| format!("{} at {}", c.message, c.location))
                .collect();
            debug.field("contexts", &trail);
        }
        debug.finish()
    }
}

impl fmt::Display for StackError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        for ctx in self.contexts.iter().rev() {
            write!(f, "{}: ", ctx.message)?;
        }
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl<E: ErrorExt> From<E> for StackError {
    fn from(e: E) -> Self {
        StackError::new(e)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
