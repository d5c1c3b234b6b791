use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};

/// Заголовки конверта. Порядок ключей не имеет значения; `BTreeMap` даёт
/// детерминированное кодирование.
pub type Headers = BTreeMap<String, String>;

/// Известные ключи заголовков.
pub mod header {
    /// Уникальный идентификатор экземпляра сообщения.
    pub const MESSAGE_ID: &str = "typebus.MessageId";
    /// Полное имя конкретного отправленного/опубликованного типа.
    pub const CORRELATION_ID: &str = "typebus.CorrelationId";
    /// То же имя типа, продублированное для удобства потребителя.
    pub const ENCLOSED_MESSAGE_TYPES: &str = "typebus.EnclosedMessageTypes";
    /// Время жизни в миллисекундах (рекомендательное).
    pub const TIME_TO_BE_RECEIVED: &str = "typebus.TimeToBeReceived";
    /// Момент отправки, RFC 3339.
    pub const TIME_SENT: &str = "typebus.TimeSent";
    pub const REPLY_TO_ADDRESS: &str = "typebus.ReplyToAddress";
    /// `Send`, `Publish` или `Reply`.
    pub const MESSAGE_INTENT: &str = "typebus.MessageIntent";
    /// Топик, из которого запись была отложена как poison message.
    pub const FAILED_QUEUE: &str = "typebus.FailedQ";
    pub const EXCEPTION_MESSAGE: &str = "typebus.ExceptionInfo.Message";
}

/// Читает TTL из заголовков. Некорректное значение игнорируется.
pub fn time_to_be_received(headers: &Headers) -> Option<Duration> {
    headers
        .get(header::TIME_TO_BE_RECEIVED)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

pub fn set_time_to_be_received(
    headers: &mut Headers,
    ttl: Duration,
) {
    headers.insert(
        header::TIME_TO_BE_RECEIVED.to_string(),
        ttl.as_millis().to_string(),
    );
}

pub fn time_sent(headers: &Headers) -> Option<DateTime<Utc>> {
    headers
        .get(header::TIME_SENT)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub fn set_time_sent(
    headers: &mut Headers,
    at: DateTime<Utc>,
) {
    headers.insert(
        header::TIME_SENT.to_string(),
        at.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
}

/// Истёк ли срок доставки сообщения к моменту `now`.
///
/// Без пары `TimeSent` + `TimeToBeReceived` сообщение считается бессрочным.
/// Срок, выходящий за пределы представимых дат, тоже считается бессрочным.
pub fn is_expired(
    headers: &Headers,
    now: DateTime<Utc>,
) -> bool {
    let (Some(sent), Some(ttl)) = (time_sent(headers), time_to_be_received(headers)) else {
        return false;
    };
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| sent.checked_add_signed(ttl))
        .is_some_and(|deadline| deadline < now)
}
