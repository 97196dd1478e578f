use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки загрузки и проверки настроек.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Значение вне допустимого диапазона
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    /// Ошибка источника конфигурации (файл, окружение)
    #[error("Failed to load configuration: {reason}")]
    Load { reason: String },
}

impl ConfigError {
    pub fn invalid(
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn status_code(&self) -> StatusCode {
        StatusCode::InvalidConfig
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
