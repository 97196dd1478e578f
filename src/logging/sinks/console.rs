use std::io::{self, Stdout};

use tracing_subscriber::registry::LookupSpan;

use crate::logging::{
    config::LoggingConfig,
    formatter::{build_layer, BoxedLayer, LayerStyle},
};

/// Консольный слой в формате `console.format`.
pub fn layer_with_config<S>(config: &LoggingConfig) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let console = &config.console;
    let style = LayerStyle {
        ansi: console.with_ansi,
        target: console.with_target,
        thread_names: console.with_thread_names,
        line_numbers: console.with_line_numbers,
    };
    let writer: fn() -> Stdout = io::stdout;
    build_layer(console.format, style, writer)
}

#[cfg(test)]
mod tests {
    use tracing::info;
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;
    use crate::logging::config::{ConsoleConfig, LogFormat};

    /// Тест проверяет, что слой строится для всех форматов и не паникует
    /// при логировании.
    #[test]
    fn test_layer_for_every_format() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let cfg = LoggingConfig {
                console: ConsoleConfig {
                    format,
                    with_ansi: false,
                    ..Default::default()
                },
                ..Default::default()
            };
            let subscriber = Registry::default().with(layer_with_config(&cfg));
            tracing::subscriber::with_default(subscriber, || {
                info!(%format, "console layer smoke test");
            });
        }
    }
}
