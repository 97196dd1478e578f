use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки жизненного цикла фоновых компонентов (listener, channel, relay).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    /// Компонент запущен раньше, чем был подключён
    #[error("{component} is not connected, call connect() first")]
    NotConnected { component: String },
    /// Повторный запуск
    #[error("{component} is already running")]
    AlreadyStarted { component: String },
    /// Компонент уже остановлен и не может быть перезапущен
    #[error("{component} has been terminated")]
    Terminated { component: String },
    /// Не удалось создать поток ОС
    #[error("Failed to spawn thread '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },
}

impl ErrorExt for LifecycleError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotConnected { .. } | Self::AlreadyStarted { .. } | Self::Terminated { .. } => {
                StatusCode::InvalidState
            }
            Self::SpawnFailed { .. } => StatusCode::SpawnFailed,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
