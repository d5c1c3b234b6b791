//! Подключение к Kafka через `rdkafka` (фича `kafka`).
//!
//! Адрес брокера имеет вид `kafka://host:port[,host:port...]`. Смещения
//! группы фиксируются вручную: `enable.auto.commit` выключен, насос
//! подтверждает запись только после обработчика.
//!
//! Kafka не даёт сдвинуть смещения группы, пока у неё есть участники.
//! Поэтому `commit_end_offsets` помимо попытки фиксации запоминает конец
//! партиций как порог в памяти процесса, и потребители этого подключения
//! пропускают записи ниже порога.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::BorrowedMessage,
    producer::{FutureProducer, FutureRecord},
    Message, Offset, TopicPartitionList,
};
use tracing::debug;
use typebus_error::BrokerError;

use super::{
    BrokerAdmin, BrokerConnector, BrokerConsumer, BrokerProducer, BrokerRecord, OffsetReset,
    RecordPosition, TopicCreation, TopicSpec,
};

/// Префикс адреса, по которому выбирается это подключение.
pub const KAFKA_SCHEME: &str = "kafka://";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Пороги чтения: (группа, топик, партиция) → первое допустимое смещение.
type Floors = DashMap<(String, String, i32), i64>;

pub fn is_kafka_address(address: &str) -> bool {
    address.starts_with(KAFKA_SCHEME)
}

////////////////////////////////////////////////////////////////////////////////
// Подключение
////////////////////////////////////////////////////////////////////////////////

/// Фабрика клиентов Kafka. Производитель и администратор создаются один раз
/// и разделяются; потребитель создаётся на каждого воркера.
#[derive(Clone)]
pub struct KafkaConnector {
    address: String,
    options: Vec<(String, String)>,
    request_timeout: Duration,
    floors: Arc<Floors>,
    producer: Arc<OnceCell<Arc<KafkaProducer>>>,
    admin: Arc<OnceCell<Arc<KafkaAdmin>>>,
}

impl KafkaConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            options: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            floors: Arc::new(DashMap::new()),
            producer: Arc::new(OnceCell::new()),
            admin: Arc::new(OnceCell::new()),
        }
    }

    /// Дополнительный параметр librdkafka (например, `security.protocol`).
    /// Применяется ко всем клиентам, созданным после вызова.
    pub fn option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Таймаут записи, метаданных и административных запросов.
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Список `bootstrap.servers` без префикса схемы.
    pub fn bootstrap_servers(&self) -> &str {
        self.address
            .strip_prefix(KAFKA_SCHEME)
            .unwrap_or(&self.address)
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.bootstrap_servers());
        for (key, value) in &self.options {
            config.set(key, value);
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                self.request_timeout.as_millis().to_string(),
            );
        config
    }

    fn consumer_config(
        &self,
        group: &str,
        member: &str,
        reset: OffsetReset,
    ) -> ClientConfig {
        let reset = match reset {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        };
        let mut config = self.client_config();
        config
            .set("group.id", group)
            .set("client.id", member)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", reset);
        config
    }

    fn creation_error(
        &self,
        err: KafkaError,
    ) -> BrokerError {
        BrokerError::Unreachable {
            address: self.address.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    fn address(&self) -> &str {
        &self.address
    }

    async fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        let producer = self.producer.get_or_try_init(|| {
            let inner: FutureProducer = self
                .producer_config()
                .create()
                .map_err(|e| self.creation_error(e))?;
            Ok::<_, BrokerError>(Arc::new(KafkaProducer {
                inner,
                address: self.address.clone(),
                timeout: self.request_timeout,
            }))
        })?;
        Ok(Arc::clone(producer) as Arc<dyn BrokerProducer>)
    }

    async fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError> {
        let admin = self.admin.get_or_try_init(|| {
            let client: AdminClient<DefaultClientContext> = self
                .client_config()
                .create()
                .map_err(|e| self.creation_error(e))?;
            Ok::<_, BrokerError>(Arc::new(KafkaAdmin {
                client: Arc::new(client),
                committer: self.client_config(),
                address: self.address.clone(),
                timeout: self.request_timeout,
                floors: Arc::clone(&self.floors),
            }))
        })?;
        Ok(Arc::clone(admin) as Arc<dyn BrokerAdmin>)
    }

    async fn consumer(
        &self,
        group: &str,
        member: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let inner: StreamConsumer = self
            .consumer_config(group, member, reset)
            .create()
            .map_err(|e| self.creation_error(e))?;
        debug!(group, member, "Kafka consumer created");
        Ok(Box::new(KafkaConsumer {
            inner: Some(inner),
            group: group.to_string(),
            address: self.address.clone(),
            timeout: self.request_timeout,
            floors: Arc::clone(&self.floors),
        }))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Производитель
////////////////////////////////////////////////////////////////////////////////

pub struct KafkaProducer {
    inner: FutureProducer,
    address: String,
    timeout: Duration,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Bytes,
    ) -> Result<RecordPosition, BrokerError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(&payload[..]);
        if let Some(key) = key {
            record = record.key(key);
        }
        match self.inner.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                Ok(RecordPosition::new(topic, partition as u32, offset as u64))
            }
            Err((err, _)) => Err(map_error(&self.address, "produce", Some(topic), err)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Администрирование
////////////////////////////////////////////////////////////////////////////////

pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    /// Базовые настройки для разового потребителя, фиксирующего смещения.
    committer: ClientConfig,
    address: String,
    timeout: Duration,
    floors: Arc<Floors>,
}

#[async_trait]
impl BrokerAdmin for KafkaAdmin {
    async fn create_topic(
        &self,
        spec: &TopicSpec,
    ) -> Result<TopicCreation, BrokerError> {
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions as i32,
            TopicReplication::Fixed(i32::from(spec.replication_factor)),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .client
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| map_error(&self.address, "create topic", Some(spec.name.as_str()), e))?;

        match results.into_iter().next() {
            Some(Ok(_)) => Ok(TopicCreation::Created),
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(TopicCreation::AlreadyExists),
            Some(Err((name, code))) => Err(map_code(
                &self.address,
                "create topic",
                Some(name.as_str()),
                code,
            )),
            None => Err(BrokerError::Rejected {
                reason: format!("no result for topic '{}'", spec.name),
            }),
        }
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let client = Arc::clone(&self.client);
        let (address, timeout) = (self.address.clone(), self.timeout);
        blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(None, timeout)
                .map_err(|e| map_error(&address, "list topics", None, e))?;
            let mut names: Vec<String> = metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .filter(|name| !name.starts_with("__"))
                .collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn commit_end_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        let client = Arc::clone(&self.client);
        let floors = Arc::clone(&self.floors);
        let mut committer = self.committer.clone();
        let (address, timeout) = (self.address.clone(), self.timeout);
        let (group, topic) = (group.to_string(), topic.to_string());

        blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map_err(|e| map_error(&address, "fetch metadata", Some(topic.as_str()), e))?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic && t.error().is_none())
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            if partitions.is_empty() {
                return Err(BrokerError::UnknownTopic { topic });
            }

            let mut ends = TopicPartitionList::new();
            for partition in partitions {
                let (_, high) = client
                    .inner()
                    .fetch_watermarks(&topic, partition, timeout)
                    .map_err(|e| map_error(&address, "fetch watermarks", Some(topic.as_str()), e))?;
                floors.insert((group.clone(), topic.clone(), partition), high);
                ends.add_partition_offset(&topic, partition, Offset::Offset(high))
                    .map_err(|e| map_error(&address, "commit offsets", Some(topic.as_str()), e))?;
                debug!(group = %group, topic = %topic, partition, offset = high, "Group moved to end of partition");
            }

            // Фиксация проходит только у группы без участников.
            let consumer: BaseConsumer = committer
                .set("group.id", group.as_str())
                .set("enable.auto.commit", "false")
                .create()
                .map_err(|e| map_error(&address, "commit offsets", Some(topic.as_str()), e))?;
            if let Err(err) = consumer.commit(&ends, CommitMode::Sync) {
                debug!(group = %group, topic = %topic, error = %err, "Group is active, relying on read floor");
            }
            Ok(())
        })
        .await
    }

    async fn delete_group_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        // Смещения на брокере остаются; следующая подписка их перезапишет.
        self.floors
            .retain(|(g, t, _), _| !(g.as_str() == group && t.as_str() == topic));
        debug!(group, topic, "Read floors dropped");
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, BrokerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Rejected {
            reason: format!("broker request task failed: {e}"),
        })?
}

////////////////////////////////////////////////////////////////////////////////
// Потребитель
////////////////////////////////////////////////////////////////////////////////

pub struct KafkaConsumer {
    /// `None` после `close`.
    inner: Option<StreamConsumer>,
    group: String,
    address: String,
    timeout: Duration,
    floors: Arc<Floors>,
}

impl KafkaConsumer {
    fn open(&self) -> Result<&StreamConsumer, BrokerError> {
        self.inner.as_ref().ok_or(BrokerError::Disconnected)
    }

    fn error(
        &self,
        operation: &str,
        topic: Option<&str>,
        err: KafkaError,
    ) -> BrokerError {
        map_error(&self.address, operation, topic, err)
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(
        &mut self,
        topics: &[String],
    ) -> Result<(), BrokerError> {
        let consumer = self.open()?;
        if topics.is_empty() {
            consumer.unsubscribe();
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| self.error("subscribe", None, e))
    }

    async fn poll(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        let consumer = self.open()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max {
            // Дождавшись первой записи, добираем только уже полученные.
            let until = if batch.is_empty() {
                deadline
            } else {
                tokio::time::Instant::now()
            };
            let message = match tokio::time::timeout_at(until, consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => message,
                Ok(Err(_)) if !batch.is_empty() => break,
                Ok(Err(err)) => return Err(self.error("poll", None, err)),
            };
            if below_floor(
                &self.floors,
                &self.group,
                message.topic(),
                message.partition(),
                message.offset(),
            ) {
                continue;
            }
            batch.push(to_record(&message));
        }
        Ok(batch)
    }

    async fn commit(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError> {
        let consumer = self.open()?;
        let mut next = TopicPartitionList::new();
        next.add_partition_offset(
            &position.topic,
            position.partition as i32,
            Offset::Offset(position.offset as i64 + 1),
        )
        .map_err(|e| self.error("commit", Some(&*position.topic), e))?;
        consumer
            .commit(&next, CommitMode::Async)
            .map_err(|e| self.error("commit", Some(&*position.topic), e))
    }

    async fn seek(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError> {
        let consumer = self.open()?;
        consumer
            .seek(
                &position.topic,
                position.partition as i32,
                Offset::Offset(position.offset as i64),
                self.timeout,
            )
            .map_err(|e| self.error("seek", Some(&*position.topic), e))
    }

    fn assignment(&self) -> Vec<(Arc<str>, u32)> {
        let Some(consumer) = &self.inner else {
            return Vec::new();
        };
        consumer
            .assignment()
            .map(|list| {
                list.elements()
                    .iter()
                    .map(|e| (Arc::from(e.topic()), e.partition() as u32))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn close(&mut self) {
        if let Some(consumer) = self.inner.take() {
            consumer.unsubscribe();
            debug!(group = %self.group, "Kafka consumer closed");
        }
    }
}

fn below_floor(
    floors: &Floors,
    group: &str,
    topic: &str,
    partition: i32,
    offset: i64,
) -> bool {
    floors
        .get(&(group.to_string(), topic.to_string(), partition))
        .is_some_and(|floor| offset < *floor)
}

fn to_record(message: &BorrowedMessage<'_>) -> BrokerRecord {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    BrokerRecord {
        position: RecordPosition::new(
            message.topic(),
            message.partition() as u32,
            message.offset() as u64,
        ),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        timestamp,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Ошибки
////////////////////////////////////////////////////////////////////////////////

fn map_error(
    address: &str,
    operation: &str,
    topic: Option<&str>,
    err: KafkaError,
) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) => map_code(address, operation, topic, code),
        None if matches!(err, KafkaError::Canceled) => BrokerError::Disconnected,
        None => BrokerError::Rejected {
            reason: format!("{operation}: {err}"),
        },
    }
}

fn map_code(
    address: &str,
    operation: &str,
    topic: Option<&str>,
    code: RDKafkaErrorCode,
) -> BrokerError {
    use RDKafkaErrorCode as C;
    match (code, topic) {
        (C::MessageTimedOut | C::RequestTimedOut | C::OperationTimedOut, _) => {
            BrokerError::Timeout {
                operation: operation.to_string(),
            }
        }
        (C::AllBrokersDown | C::BrokerTransportFailure, _) => BrokerError::Unreachable {
            address: address.to_string(),
            reason: code.to_string(),
        },
        (C::UnknownTopicOrPartition | C::UnknownTopic, Some(topic)) => BrokerError::UnknownTopic {
            topic: topic.to_string(),
        },
        _ => BrokerError::Rejected {
            reason: format!("{operation}: {code}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет настройки потребителя: ручная фиксация, группа и
    /// адрес без префикса схемы.
    #[test]
    fn test_consumer_config() {
        let connector = KafkaConnector::new("kafka://a:9092,b:9092");
        assert_eq!(connector.bootstrap_servers(), "a:9092,b:9092");

        let config = connector.consumer_config("billing", "billing-0", OffsetReset::Latest);
        assert_eq!(config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(config.get("group.id"), Some("billing"));
        assert_eq!(config.get("client.id"), Some("billing-0"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_options_reach_every_client() {
        let connector = KafkaConnector::new("kafka://a:9092")
            .option("security.protocol", "SSL")
            .request_timeout(Duration::from_millis(2_500));

        let producer = connector.producer_config();
        assert_eq!(producer.get("security.protocol"), Some("SSL"));
        assert_eq!(producer.get("message.timeout.ms"), Some("2500"));
        let consumer = connector.consumer_config("g", "m", OffsetReset::Earliest);
        assert_eq!(consumer.get("security.protocol"), Some("SSL"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_address_scheme() {
        assert!(is_kafka_address("kafka://localhost:9092"));
        assert!(!is_kafka_address("memory"));
        assert_eq!(KafkaConnector::new("localhost:9092").bootstrap_servers(), "localhost:9092");
    }

    /// Тест проверяет сопоставление ошибок librdkafka с ошибками брокера.
    #[test]
    fn test_error_mapping() {
        let addr = "kafka://a:9092";
        assert_eq!(
            map_error(
                addr,
                "produce",
                Some("orders"),
                KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)
            ),
            BrokerError::Timeout {
                operation: "produce".to_string()
            }
        );
        assert!(matches!(
            map_error(
                addr,
                "poll",
                None,
                KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown)
            ),
            BrokerError::Unreachable { .. }
        ));
        assert_eq!(
            map_code(
                addr,
                "produce",
                Some("orders"),
                RDKafkaErrorCode::UnknownTopicOrPartition
            ),
            BrokerError::UnknownTopic {
                topic: "orders".to_string()
            }
        );
        assert_eq!(
            map_error(addr, "poll", None, KafkaError::Canceled),
            BrokerError::Disconnected
        );
        assert!(matches!(
            map_code(
                addr,
                "create topic",
                Some("orders"),
                RDKafkaErrorCode::InvalidReplicationFactor
            ),
            BrokerError::Rejected { .. }
        ));
    }

    /// Тест проверяет порог чтения: записи до конца партиции на момент
    /// подписки пропускаются, порог другой группы не действует.
    #[test]
    fn test_read_floor() {
        let floors = Floors::new();
        floors.insert(("audit".to_string(), "typebus-types.Ev".to_string(), 0), 5);

        assert!(below_floor(&floors, "audit", "typebus-types.Ev", 0, 4));
        assert!(!below_floor(&floors, "audit", "typebus-types.Ev", 0, 5));
        assert!(!below_floor(&floors, "audit", "typebus-types.Ev", 1, 0));
        assert!(!below_floor(&floors, "billing", "typebus-types.Ev", 0, 0));
    }
}
