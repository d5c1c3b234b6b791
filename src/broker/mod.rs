//! Шов между транспортом и клиентом брокера.
//!
//! Транспорт опирается только на эти трейты: производитель записей,
//! потребитель в составе группы, администрирование топиков и фабрика
//! подключений. [`InMemoryBroker`] реализует все четыре поверх журналов в
//! памяти процесса и используется в тестах и демо; `KafkaConnector` (фича
//! `kafka`) подключается к настоящему кластеру через `rdkafka`.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typebus_error::BrokerError;

#[cfg(feature = "kafka")]
pub use kafka::{is_kafka_address, KafkaConnector};
pub use memory::{InMemoryBroker, InMemoryBrokerBuilder, InMemoryConsumer};

/// Позиция записи в журнале брокера.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPosition {
    pub topic: Arc<str>,
    pub partition: u32,
    pub offset: u64,
}

impl RecordPosition {
    pub fn new(
        topic: impl Into<Arc<str>>,
        partition: u32,
        offset: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for RecordPosition {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Запись, прочитанная потребителем.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub position: RecordPosition,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Параметры создаваемого топика.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicSpec {
    pub fn new(
        name: impl Into<String>,
        partitions: u32,
        replication_factor: u16,
    ) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Результат создания топика. Оба варианта — успех.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCreation {
    Created,
    AlreadyExists,
}

/// Откуда читать партицию, для которой у группы нет зафиксированного
/// смещения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// Производитель записей. Разделяется между конкурентными вызовами
/// `dispatch`, поэтому `Send + Sync`.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Bytes,
    ) -> Result<RecordPosition, BrokerError>;
}

/// Потребитель в составе группы.
///
/// Партиции распределяются брокером между участниками группы; каждый
/// участник читает только свои. Один потребитель принадлежит одному воркеру.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Заменяет набор топиков потребителя.
    async fn subscribe(
        &mut self,
        topics: &[String],
    ) -> Result<(), BrokerError>;

    /// Возвращает до `max` записей; пустой результат по истечении `timeout`.
    async fn poll(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Фиксирует прогресс группы: запись `position` обработана.
    async fn commit(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError>;

    /// Перематывает чтение партиции так, что следующей будет `position`.
    async fn seek(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError>;

    /// Текущие назначенные партиции.
    fn assignment(&self) -> Vec<(Arc<str>, u32)>;

    /// Покидает группу и освобождает соединение. Повторный вызов безопасен.
    async fn close(&mut self);
}

#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn create_topic(
        &self,
        spec: &TopicSpec,
    ) -> Result<TopicCreation, BrokerError>;

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    /// Ставит группу `group` на текущий конец каждой партиции `topic`:
    /// участники группы получат только записи, дописанные после вызова.
    async fn commit_end_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError>;

    /// Забывает прогресс группы `group` по топику `topic`.
    async fn delete_group_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError>;
}

/// Фабрика подключений по непрозрачной строке адреса брокера.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    fn address(&self) -> &str;

    async fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    async fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError>;

    async fn consumer(
        &self,
        group: &str,
        member: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}
