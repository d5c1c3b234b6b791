use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;
use bytes::Bytes;
use typebus_error::HandlerError;

use crate::{
    broker::RecordPosition,
    context::{ContextBag, TransportTransaction},
    envelope::{header, Envelope, Headers},
};

/// Входящее сообщение, переданное обработчику.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub headers: Headers,
    pub body: Bytes,
    /// Позиция записи у брокера; по ней фиксируется прогресс.
    pub position: RecordPosition,
}

impl IncomingMessage {
    pub fn new(
        envelope: Envelope,
        position: RecordPosition,
    ) -> Self {
        Self {
            headers: envelope.headers,
            body: envelope.body,
            position,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(header::MESSAGE_ID)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(header::CORRELATION_ID)
    }

    /// Имя конкретного опубликованного или отправленного типа.
    pub fn message_type(&self) -> Option<&str> {
        self.header(header::ENCLOSED_MESSAGE_TYPES)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.header(header::REPLY_TO_ADDRESS)
    }

    pub fn header(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Конвейер обработки входящих сообщений.
///
/// `Ok` фиксирует прогресс по записи, `Err` оставляет запись
/// неподтверждённой: она будет доставлена повторно. Паника обработчика
/// трактуется как ошибка.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        message: IncomingMessage,
        transaction: &mut TransportTransaction,
        context: &mut ContextBag,
    ) -> Result<(), HandlerError>;
}

/// Обработчик из замыкания; транзакция и контекст ему не передаются.
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: IncomingMessage,
        _transaction: &mut TransportTransaction,
        _context: &mut ContextBag,
    ) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}
