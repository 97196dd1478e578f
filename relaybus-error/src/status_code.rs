use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок relaybus.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки и ошибки состояния компонентов
/// - 2xxx: Ошибки данных и конфигурации
/// - 4xxx: Управление потоком (backpressure)
/// - 6xxx: Сеть / IO
/// - 8xxx: Протокол (фрейминг)
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Internal = 1001,
    InvalidArgs = 1002,
    InvalidState = 1003,
    Unsupported = 1004,
    SpawnFailed = 1005,

    // === 2xxx: Данные и конфигурация ===
    NotFound = 2000,
    InvalidValue = 2002,
    InvalidConfig = 2003,

    // === 4xxx: Управление потоком ===
    QueueFull = 4000,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ConnectionFailed = 6003,
    AddressInUse = 6004,
    PermissionDenied = 6005,
    NotConnected = 6006,
    InvalidAddress = 6007,

    // === 8xxx: Протокол ===
    InvalidFrame = 8000,
    SizeLimit = 8001,
    UnexpectedEof = 8002,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить `StatusCode` из `u32`, `None` для неизвестных
    /// значений.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Сбой временный: следующая отправка может пройти после
    /// переподключения. Воркер канала пишет это поле в лог ошибки отправки.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::QueueFull
                | Self::Io
        )
    }

    /// Ошибка протокола (диапазон 8xxx).
    pub fn is_protocol_error(&self) -> bool {
        (8000..=8999).contains(&self.code())
    }

    /// Сетевая ошибка или ошибка ввода-вывода (диапазон 6xxx).
    pub fn is_network_error(&self) -> bool {
        (6000..=6999).contains(&self.code())
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::NotFound => LogLevel::Debug,
            Self::InvalidArgs | Self::InvalidValue | Self::InvalidConfig => LogLevel::Info,
            Self::QueueFull
            | Self::Timeout
            | Self::ConnectionClosed
            | Self::NotConnected => LogLevel::Warn,
            Self::Internal | Self::AddressInUse | Self::PermissionDenied | Self::SpawnFailed => {
                LogLevel::Error
            }
            _ => LogLevel::Warn,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что сетевые сбои считаются повторяемыми, а ошибки
    /// протокола нет.
    #[test]
    fn test_retryable() {
        assert!(StatusCode::Timeout.is_retryable());
        assert!(StatusCode::NotConnected.is_retryable());
        assert!(!StatusCode::InvalidFrame.is_retryable());
        assert!(!StatusCode::AddressInUse.is_retryable());
    }

    /// Тест проверяет конвертацию через `TryFrom<u32>`.
    #[test]
    fn test_from_u32() {
        let n = StatusCode::AddressInUse.code();
        assert_eq!(n, 6004);
        assert_eq!(StatusCode::from_u32(n), Some(StatusCode::AddressInUse));
        assert!(StatusCode::from_u32(99999).is_none());
        let back: u32 = StatusCode::SizeLimit.into();
        assert_eq!(back, 8001);
    }

    /// Тест проверяет диапазоны.
    #[test]
    fn test_ranges() {
        assert!(StatusCode::InvalidFrame.is_protocol_error());
        assert!(!StatusCode::Timeout.is_protocol_error());
        assert!(StatusCode::Timeout.is_network_error());
        assert!(!StatusCode::QueueFull.is_network_error());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(StatusCode::Timeout.log_level(), LogLevel::Warn);
        assert_eq!(StatusCode::QueueFull.log_level(), LogLevel::Warn);
        assert_eq!(StatusCode::SpawnFailed.log_level(), LogLevel::Error);
        assert_eq!(StatusCode::NotFound.log_level(), LogLevel::Debug);
    }

    /// Тест проверяет, что `Display` содержит имя варианта и код.
    #[test]
    fn test_display_contains_name_and_code() {
        let s = StatusCode::QueueFull.to_string();
        assert!(s.contains("4000"), "got: {s}");
        assert!(s.contains("QueueFull"), "got: {s}");
    }
}
