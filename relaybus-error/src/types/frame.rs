use std::any::Any;

use crate::{ErrorExt, StatusCode};

/// Ошибки разбора двухсегментного фрейма (topic, payload).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Сегмент длиннее допустимого
    #[error("Segment of {size} bytes exceeds limit of {max} bytes")]
    SegmentTooLarge { size: usize, max: usize },
    /// Неизвестные биты во флагах сегмента
    #[error("Unknown segment flags: {flags:#04x}")]
    UnknownFlags { flags: u8 },
    /// Сегмент topic пришёл без флага MORE
    #[error("Topic segment must be followed by a payload segment")]
    MissingPayload,
    /// После payload заявлен ещё один сегмент
    #[error("Payload segment must be the last one")]
    TrailingSegment,
    /// Соединение закрылось посреди фрейма
    #[error("Connection closed with {pending} bytes of an incomplete frame")]
    Truncated { pending: usize },
}

impl ErrorExt for FrameError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::SegmentTooLarge { .. } => StatusCode::SizeLimit,
            Self::UnknownFlags { .. } | Self::MissingPayload | Self::TrailingSegment => {
                StatusCode::InvalidFrame
            }
            Self::Truncated { .. } => StatusCode::UnexpectedEof,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
