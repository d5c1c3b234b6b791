use std::path::Path;

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use typebus_error::{ConfigError, TopicNameError};

use crate::{
    broker::OffsetReset,
    envelope::CodecConfig,
    logging::LoggingConfig,
    routing::{is_type_topic, validate_topic_name, LogicalAddress},
};

/// Настройки транспорта endpoint'а.
///
/// Источники по возрастанию приоритета: значения по умолчанию, файл
/// (`load_from`), переменные окружения `TYPEBUS_*` (вложенные ключи через
/// `__`, например `TYPEBUS_CODEC__MAX_HEADERS`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Имя endpoint'а: входной топик и группа потребителей
    pub endpoint_name: String,
    /// Адрес брокера (`host:port` или список через запятую)
    pub broker_address: String,
    /// Число партиций создаваемых топиков
    pub partitions: u32,
    pub replication_factor: u16,
    /// Число воркеров насоса
    pub max_concurrency: usize,
    pub poll_batch_size: usize,
    pub poll_timeout_ms: u64,
    pub poll_retry_delay_ms: u64,
    pub max_poll_failures: u32,
    pub redelivery_delay_ms: u64,
    pub stop_timeout_ms: u64,
    pub offset_reset: OffsetReset,
    /// Топик для нечитаемых записей; пустая строка отключает парковку
    pub error_topic: String,
    pub discard_expired: bool,
    #[serde(default)]
    pub codec: CodecConfig,
    /// Корень иерархии, общий предок всех типов
    pub universal_root: String,
    /// Маркер, неявно реализуемый каждым типом
    #[serde(default)]
    pub catch_all_marker: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransportSettings {
    /// Настройки со значениями по умолчанию для заданных endpoint'а и брокера.
    pub fn new(
        endpoint_name: impl Into<String>,
        broker_address: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            broker_address: broker_address.into(),
            partitions: 1,
            replication_factor: 1,
            max_concurrency: num_cpus::get(),
            poll_batch_size: 100,
            poll_timeout_ms: 250,
            poll_retry_delay_ms: 200,
            max_poll_failures: 10,
            redelivery_delay_ms: 50,
            stop_timeout_ms: 30_000,
            offset_reset: OffsetReset::Earliest,
            error_topic: "error".to_string(),
            discard_expired: true,
            codec: CodecConfig::default(),
            universal_root: "object".to_string(),
            catch_all_marker: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Значения по умолчанию и переменные окружения.
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(Self::defaults()?)
    }

    /// Значения по умолчанию, файл `path` и переменные окружения.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = Self::defaults()?.add_source(File::from(path.as_ref()).required(true));
        Self::build(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let builder = Config::builder()
            // Добавляем значения по умолчанию
            .set_default("partitions", 1)
            .and_then(|b| b.set_default("replication_factor", 1))
            .and_then(|b| b.set_default("max_concurrency", num_cpus::get() as i64))
            .and_then(|b| b.set_default("poll_batch_size", 100))
            .and_then(|b| b.set_default("poll_timeout_ms", 250))
            .and_then(|b| b.set_default("poll_retry_delay_ms", 200))
            .and_then(|b| b.set_default("max_poll_failures", 10))
            .and_then(|b| b.set_default("redelivery_delay_ms", 50))
            .and_then(|b| b.set_default("stop_timeout_ms", 30_000))
            .and_then(|b| b.set_default("offset_reset", "earliest"))
            .and_then(|b| b.set_default("error_topic", "error"))
            .and_then(|b| b.set_default("discard_expired", true))
            .and_then(|b| b.set_default("universal_root", "object"))
            .map_err(map_source_error)?;
        Ok(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let cfg = builder
            // Переменные окружения с префиксом TYPEBUS_
            .add_source(
                Environment::with_prefix("TYPEBUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(map_source_error)?;

        let settings: Self = cfg.try_deserialize().map_err(map_source_error)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Проверяет настройки. Ошибка фатальна и возвращается до старта насоса.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_name.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "endpoint_name".into(),
            });
        }
        self.local_address().to_topic()?;

        if self.broker_address.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "broker_address".into(),
            });
        }
        if self.broker_address.split(',').any(|a| a.trim().is_empty()) {
            return Err(invalid(
                "broker_address",
                "empty entry in broker address list",
            ));
        }

        if self.partitions == 0 {
            return Err(invalid("partitions", "must be positive"));
        }
        if self.replication_factor == 0 {
            return Err(invalid("replication_factor", "must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be positive"));
        }
        if self.poll_batch_size == 0 {
            return Err(invalid("poll_batch_size", "must be positive"));
        }
        if self.max_poll_failures == 0 {
            return Err(invalid("max_poll_failures", "must be positive"));
        }
        if !self.error_topic.is_empty() {
            validate_topic_name(&self.error_topic)?;
            if is_type_topic(&self.error_topic) {
                return Err(TopicNameError::Reserved {
                    name: self.error_topic.clone(),
                }
                .into());
            }
        }
        if self.universal_root.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "universal_root".into(),
            });
        }
        if self.codec.max_headers == 0 {
            return Err(invalid("codec.max_headers", "must be positive"));
        }
        Ok(())
    }

    /// Логический адрес локального endpoint'а.
    pub fn local_address(&self) -> LogicalAddress {
        LogicalAddress::new(self.endpoint_name.clone())
    }

    /// Топик парковки, если она включена.
    pub fn error_topic(&self) -> Option<&str> {
        if self.error_topic.is_empty() {
            None
        } else {
            Some(&self.error_topic)
        }
    }
}

fn invalid(
    key: &str,
    reason: &str,
) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn map_source_error(err: config::ConfigError) -> ConfigError {
    match err {
        config::ConfigError::NotFound(key) => ConfigError::MissingValue { key },
        other => {
            let message = other.to_string();
            // serde сообщает отсутствующее поле как "missing field `name`"
            match message
                .split("missing field `")
                .nth(1)
                .and_then(|rest| rest.split('`').next())
            {
                Some(key) => ConfigError::MissingValue {
                    key: key.to_string(),
                },
                None => ConfigError::Source(message),
            }
        }
    }
}
