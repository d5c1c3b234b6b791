use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling::daily};
use tracing_subscriber::{layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::{config::LoggingConfig, formatter};

/// Файловый слой с ежедневной ротацией. Запись неблокирующая; `WorkerGuard`
/// должен жить, пока нужен вывод, иначе хвост буфера теряется.
pub fn layer_with_config<S>(config: &LoggingConfig) -> (Box<dyn LayerTrait<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = daily(&config.file.directory, &config.file.prefix);
    let (writer, guard) = non_blocking(appender);
    let layer = formatter::build_layer(config.file.format, &config.console, writer, false);
    (layer, guard)
}
