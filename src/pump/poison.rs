use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};
use typebus_error::DecodeError;
use uuid::Uuid;

use crate::{
    broker::BrokerRecord,
    envelope::{header, headers::set_time_sent, Envelope, Headers},
};

/// Что сделать с записью, которую не удалось декодировать.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoisonAction {
    /// Подтвердить и забыть.
    Acknowledge,
    /// Переложить сырые байты в топик ошибок, затем подтвердить.
    Park { error_topic: String },
}

/// Политика для нечитаемых (poison) записей.
///
/// Ошибка декодирования никогда не роняет воркер: насос сообщает о ней и
/// спрашивает политику.
pub trait PoisonMessagePolicy: Send + Sync + 'static {
    fn on_decode_failure(
        &self,
        record: &BrokerRecord,
        error: &DecodeError,
    ) -> PoisonAction;
}

/// Логирует и подтверждает запись.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndAcknowledge;

impl PoisonMessagePolicy for LogAndAcknowledge {
    fn on_decode_failure(
        &self,
        record: &BrokerRecord,
        error: &DecodeError,
    ) -> PoisonAction {
        error!(
            topic = %record.position.topic,
            partition = record.position.partition,
            offset = record.position.offset,
            error = %error,
            "Dropping undecodable record"
        );
        PoisonAction::Acknowledge
    }
}

/// Перекладывает запись в топик ошибок.
#[derive(Debug, Clone)]
pub struct ParkInErrorTopic {
    error_topic: String,
}

impl ParkInErrorTopic {
    pub fn new(error_topic: impl Into<String>) -> Self {
        Self {
            error_topic: error_topic.into(),
        }
    }

    pub fn error_topic(&self) -> &str {
        &self.error_topic
    }
}

impl PoisonMessagePolicy for ParkInErrorTopic {
    fn on_decode_failure(
        &self,
        record: &BrokerRecord,
        error: &DecodeError,
    ) -> PoisonAction {
        warn!(
            topic = %record.position.topic,
            partition = record.position.partition,
            offset = record.position.offset,
            error_topic = %self.error_topic,
            error = %error,
            "Parking undecodable record"
        );
        PoisonAction::Park {
            error_topic: self.error_topic.clone(),
        }
    }
}

/// Политика по умолчанию: парковка, если топик ошибок задан.
pub fn default_policy(error_topic: Option<&str>) -> Arc<dyn PoisonMessagePolicy> {
    match error_topic {
        Some(topic) if !topic.is_empty() => Arc::new(ParkInErrorTopic::new(topic)),
        _ => Arc::new(LogAndAcknowledge),
    }
}

/// Новый конверт для отложенной записи: исходные байты целиком в теле,
/// диагностика в заголовках.
pub(crate) fn parked_envelope(
    record: &BrokerRecord,
    error: &DecodeError,
) -> Envelope {
    let mut headers = Headers::new();
    headers.insert(header::MESSAGE_ID.to_string(), Uuid::new_v4().to_string());
    headers.insert(
        header::FAILED_QUEUE.to_string(),
        record.position.topic.to_string(),
    );
    headers.insert(header::EXCEPTION_MESSAGE.to_string(), error.to_string());
    set_time_sent(&mut headers, Utc::now());
    Envelope::new(headers, record.payload.clone())
}
