//! Конверт сообщения: заголовки + тело.
//!
//! - `headers`: схема заголовков (идентификатор, correlation id, тип
//!   вложенного сообщения, TTL и др.).
//! - `codec`: бинарный кодек конверта и его процессная конфигурация.

pub mod codec;
pub mod headers;

use bytes::Bytes;

pub use codec::{codec, install_codec, CodecConfig, EnvelopeCodec};
pub use headers::{header, Headers};

/// Конверт, которым транспорт обменивается с брокером.
///
/// Тело непрозрачно для транспорта и после создания не изменяется.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub headers: Headers,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(header::MESSAGE_ID).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(header::CORRELATION_ID).map(String::as_str)
    }

    pub fn enclosed_type(&self) -> Option<&str> {
        self.headers
            .get(header::ENCLOSED_MESSAGE_TYPES)
            .map(String::as_str)
    }
}
