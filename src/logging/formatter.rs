use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::Layer as LayerTrait,
    registry::LookupSpan,
};

use crate::logging::config::{ConsoleConfig, LogFormat};

/// Строит fmt-слой нужного формата поверх произвольного writer'а.
/// Возвращается boxed trait-объект, чтобы стереть конкретный тип формата.
pub fn build_layer<S, W>(
    format: LogFormat,
    options: &ConsoleConfig,
    writer: W,
    with_ansi: bool,
) -> Box<dyn LayerTrait<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => {
            let json_fmt = fmt::format()
                .json()
                .with_current_span(true)
                .with_span_list(false);
            Box::new(
                fmt::layer()
                    .event_format(json_fmt)
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(options.with_target)
                    .with_thread_ids(options.with_thread_ids)
                    .with_line_number(options.with_line_numbers),
            )
        }
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .event_format(fmt::format().pretty())
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(writer)
                .with_ansi(with_ansi)
                .with_target(options.with_target)
                .with_thread_ids(options.with_thread_ids)
                .with_line_number(options.with_line_numbers),
        ),
        // Compact: минимум информации
        LogFormat::Compact => Box::new(
            fmt::layer()
                .event_format(fmt::format().compact())
                .with_writer(writer)
                .with_ansi(with_ansi)
                .with_target(options.with_target)
                .with_thread_ids(false)
                .with_line_number(false),
        ),
    }
}
