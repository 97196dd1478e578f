use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки транспортного уровня: bind, подключение, отправка и приём.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Не удалось занять адрес для прослушивания
    #[error("Failed to bind {address}: {reason}")]
    Bind {
        address: String,
        code: StatusCode,
        reason: String,
    },
    /// Адрес не разбирается как `host:port`
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    /// Не удалось подключиться
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },
    /// Нет соединения, а очередь фреймов на отправку заполнена до high-water mark
    #[error("Not connected to {address}, {limit} frames already waiting")]
    HighWaterMark { address: String, limit: usize },
    /// `connect` ещё не вызывался
    #[error("Endpoint is not configured, call connect() first")]
    NoEndpoint,
    /// Ошибка при отправке фрейма
    #[error("Send to {address} failed: {reason}")]
    SendFailed { address: String, reason: String },
    /// Ошибка при приёме фрейма
    #[error("Receive from {address} failed: {reason}")]
    ReceiveFailed { address: String, reason: String },
    /// Таймаут операции
    #[error("Transport operation timed out")]
    Timeout,
    /// Транспорт уже закрыт
    #[error("Transport is closed")]
    Closed,
    /// Опция не поддерживается данным концом соединения
    #[error("Option '{option}' is not supported by {endpoint}")]
    UnsupportedOption {
        option: &'static str,
        endpoint: &'static str,
    },
}

impl TransportError {
    /// Ошибка bind с кодом, выведенным из `io::Error`.
    pub fn bind(
        address: impl Into<String>,
        err: &std::io::Error,
    ) -> Self {
        Self::Bind {
            address: address.into(),
            code: crate::io_status_code(err),
            reason: err.to_string(),
        }
    }
}

impl ErrorExt for TransportError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Bind { code, .. } => match code {
                StatusCode::AddressInUse | StatusCode::PermissionDenied => *code,
                StatusCode::InvalidAddress => StatusCode::InvalidAddress,
                _ => StatusCode::Io,
            },
            Self::InvalidAddress { .. } => StatusCode::InvalidAddress,
            Self::ConnectFailed { .. } => StatusCode::ConnectionFailed,
            Self::HighWaterMark { .. } => StatusCode::QueueFull,
            Self::NoEndpoint => StatusCode::NotConnected,
            Self::SendFailed { .. } | Self::ReceiveFailed { .. } => StatusCode::Io,
            Self::Timeout => StatusCode::Timeout,
            Self::Closed => StatusCode::ConnectionClosed,
            Self::UnsupportedOption { .. } => StatusCode::Unsupported,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "transport".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::Bind { address, .. }
            | Self::InvalidAddress { address, .. }
            | Self::ConnectFailed { address, .. }
            | Self::HighWaterMark { address, .. }
            | Self::SendFailed { address, .. }
            | Self::ReceiveFailed { address, .. } => tags.push(("address", address.clone())),
            _ => {}
        }

        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_keeps_io_code() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = TransportError::bind("0.0.0.0:1112", &io);
        assert_eq!(err.status_code(), StatusCode::AddressInUse);
        assert!(!err.status_code().is_retryable());
        assert!(err.to_string().contains("0.0.0.0:1112"));
    }

    #[test]
    fn test_tags_carry_address() {
        let err = TransportError::HighWaterMark {
            address: "127.0.0.1:1111".into(),
            limit: 8,
        };
        assert!(err
            .metrics_tags()
            .iter()
            .any(|(k, v)| *k == "address" && v == "127.0.0.1:1111"));
        assert!(err.status_code().is_retryable());
    }
}
