use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling,
};
use tracing_subscriber::registry::LookupSpan;

use crate::logging::{
    config::LoggingConfig,
    formatter::{build_layer, BoxedLayer, LayerStyle},
};

/// Файловый слой с ежедневной ротацией в `log_dir`.
///
/// Запись идёт через фоновый поток; guard нужно держать до завершения.
pub fn layer_with_config<S>(config: &LoggingConfig) -> (BoxedLayer<S>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = rolling::daily(&config.log_dir, &config.file.filename_prefix);
    let (writer, guard): (NonBlocking, WorkerGuard) = tracing_appender::non_blocking(appender);

    let style = LayerStyle {
        ansi: false,
        target: true,
        thread_names: true,
        line_numbers: true,
    };
    (build_layer(config.file.format, style, writer), guard)
}
