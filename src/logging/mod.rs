//! Логирование на базе `tracing`: консоль, файл с ротацией, фильтр уровней.

pub mod config;
mod filters;
mod formatter;
pub mod handle;
pub mod sinks;

pub use config::{ConsoleConfig, FileConfig, LogFormat, LoggingConfig};
pub use handle::LoggingHandle;
use relaybus_error::{GenericError, RelayResult, StatusCode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Устанавливает глобальный subscriber по конфигурации.
///
/// Повторная инициализация в одном процессе возвращает ошибку.
pub fn init_logging(config: &LoggingConfig) -> RelayResult<LoggingHandle> {
    config.validate()?;
    config.ensure_log_dir()?;

    let env_filter = filters::build_filter_from_config(config);
    let mut layers = Vec::new();

    if config.console.enabled {
        layers.push(sinks::console::layer_with_config(config));
    }

    let file_guard = if config.file.enabled {
        let (layer, guard) = sinks::file::layer_with_config(config);
        layers.push(layer);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| {
            GenericError::new(
                StatusCode::InvalidState,
                format!("logging already initialized: {e}"),
            )
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        console = config.console.enabled,
        console_format = %config.console.format,
        file = config.file.enabled,
        log_dir = %config.log_dir.display(),
        "Logging initialized"
    );

    Ok(LoggingHandle::new(file_guard))
}
