pub mod config;
pub mod frame;
pub mod listener;
pub mod transport;

pub use config::*;
pub use frame::*;
pub use listener::*;
pub use transport::*;

use crate::{ErrorExt, StatusCode};

/// Ошибка с произвольным кодом и сообщением (используется `bail!`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GenericError {
    code: StatusCode,
    message: String,
}

impl GenericError {
    pub fn new(
        code: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl ErrorExt for GenericError {
    fn status_code(&self) -> StatusCode {
        self.code
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Конвертация из std::io::Error
impl From<std::io::Error> for crate::StackError {
    fn from(err: std::io::Error) -> Self {
        crate::StackError::new(GenericError::new(io_status_code(&err), err.to_string()))
    }
}

/// Код статуса для `std::io::Error` по его `ErrorKind`.
pub fn io_status_code(err: &std::io::Error) -> StatusCode {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => StatusCode::NotFound,
        ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        ErrorKind::AddrInUse => StatusCode::AddressInUse,
        ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => StatusCode::InvalidAddress,
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted => {
            StatusCode::ConnectionFailed
        }
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => StatusCode::ConnectionClosed,
        ErrorKind::NotConnected => StatusCode::NotConnected,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => StatusCode::Timeout,
        ErrorKind::UnexpectedEof => StatusCode::UnexpectedEof,
        _ => StatusCode::Io,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
