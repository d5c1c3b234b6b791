//! Структурное логирование на `tracing`: фильтр из `RUST_LOG` или
//! конфигурации, консольный слой и опциональный файл с ежедневной ротацией.

pub mod config;
mod filters;
mod formatter;
pub mod handle;
pub mod sinks;

pub use config::{ConsoleConfig, FileConfig, LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};
use typebus_error::{GenericError, ResultExt, StackError, StatusCode};

/// Пишет событие `tracing` с уровнем, который код статуса рекомендует для
/// логов: `log_by_status!(err.status_code(), error = %err, "...")`.
macro_rules! log_by_status {
    ($status:expr, $($arg:tt)+) => {
        match $status.log_level() {
            ::typebus_error::LogLevel::Trace => ::tracing::trace!($($arg)+),
            ::typebus_error::LogLevel::Debug => ::tracing::debug!($($arg)+),
            ::typebus_error::LogLevel::Info => ::tracing::info!($($arg)+),
            ::typebus_error::LogLevel::Warn => ::tracing::warn!($($arg)+),
            ::typebus_error::LogLevel::Error => ::tracing::error!($($arg)+),
        }
    };
}
pub(crate) use log_by_status;

/// Устанавливает глобальный subscriber.
///
/// Повторная инициализация в процессе возвращает ошибку.
pub fn init_logging(mut config: LoggingConfig) -> Result<LoggingHandle, StackError> {
    config.apply_env_overrides()?;
    config.validate()?;
    config
        .ensure_log_dir()
        .with_context(|| format!("creating log directory {}", config.file.directory.display()))?;

    let env_filter = filters::build_filter_from_config(&config);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console.enabled {
        layers.push(sinks::console::layer_with_config(&config));
    }

    let file_guard = if config.file.enabled {
        let (file_layer, guard) = sinks::file::layer_with_config(&config);
        layers.push(file_layer);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| {
            StackError::new(GenericError::new(
                StatusCode::Internal,
                format!("failed to install tracing subscriber: {e}"),
            ))
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        filter = %config.build_filter_directive(),
        format = ?config.format,
        file_enabled = config.file.enabled,
        "Logging initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}
