use std::{any::Any, error::Error};

use crate::StatusCode;

/// Общий интерфейс для всех доменных ошибок relaybus (object-safe).
///
/// Каждая ошибка сообщает свой [`StatusCode`] и теги для логов.
pub trait ErrorExt: Error + Send + Sync + 'static {
    /// Код статуса. По умолчанию [`StatusCode::Internal`].
    fn status_code(&self) -> StatusCode {
        StatusCode::Internal
    }

    /// Доступ к ошибке как к [`Any`] для downcast.
    fn as_any(&self) -> &dyn Any;

    /// Подробное сообщение для логов.
    fn log_message(&self) -> String {
        format!("{self:?}")
    }

    /// Пары ключ–значение для структурированных логов.
    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("error_type", self.type_name()),
            ("status_code", self.status_code().to_string()),
        ]
    }

    /// Короткое имя типа ошибки без пути модулей.
    fn type_name(&self) -> String {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("Unknown")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct Plain;

    impl fmt::Display for Plain {
        fn fmt(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "plain failure with secret details")
        }
    }

    impl Error for Plain {}

    impl ErrorExt for Plain {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Missing;

    impl fmt::Display for Missing {
        fn fmt(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "channel is missing")
        }
    }

    impl Error for Missing {}

    impl ErrorExt for Missing {
        fn status_code(&self) -> StatusCode {
            StatusCode::NotFound
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Тест проверяет код по умолчанию.
    #[test]
    fn test_default_status_code() {
        assert_eq!(Plain.status_code(), StatusCode::Internal);
        assert_eq!(Missing.status_code(), StatusCode::NotFound);
    }

    #[test]
    fn test_type_name_and_tags() {
        assert_eq!(Missing.type_name(), "Missing");
        let tags = Missing.metrics_tags();
        assert!(tags
            .iter()
            .any(|(k, v)| *k == "status_code" && v.contains("2000")));
    }

    #[test]
    fn test_as_any_downcast() {
        let e = Missing;
        assert!(e.as_any().downcast_ref::<Missing>().is_some());
        assert!(e.as_any().downcast_ref::<Plain>().is_none());
    }
}
