/// Немедленно возвращает ошибку из текущей функции.
///
/// Формы:
/// - `bail!(err)`: любой тип, конвертируемый в `StackError`;
/// - `bail!(code, "msg")`: `GenericError` с кодом и сообщением;
/// - `bail!(code, "fmt {}", arg)`: то же с форматированием.
///
/// ```ignore
/// use relaybus_error::{bail, StatusCode};
///
/// fn check_capacity(capacity: usize) -> relaybus_error::RelayResult<()> {
///     if capacity == 0 {
///         bail!(StatusCode::InvalidConfig, "queue capacity must be positive");
///     }
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($crate::StackError::from($err))
    };
    ($code:expr, $msg:expr) => {
        return Err($crate::StackError::new(
            $crate::types::GenericError::new($code, $msg)
        ))
    };
    ($code:expr, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::StackError::new(
            $crate::types::GenericError::new($code, format!($fmt, $($arg)*))
        ))
    };
}

/// Проверяет условие и вызывает `bail!`, если оно ложно.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            $crate::bail!($err);
        }
    };
    ($cond:expr, $code:expr, $msg:expr) => {
        if !($cond) {
            $crate::bail!($code, $msg);
        }
    };
    ($cond:expr, $code:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($code, $fmt, $($arg)*);
        }
    };
}

/// Расширение `Result`: `.context(..)` и `.with_context(..)` превращают
/// ошибку в [`StackError`](crate::StackError) и добавляют контекст.
pub trait ResultExt<T> {
    fn context<C>(
        self,
        ctx: C,
    ) -> Result<T, crate::StackError>
    where
        C: Into<String>;

    /// Контекст вычисляется только в случае ошибки.
    fn with_context<C, F>(
        self,
        f: F,
    ) -> Result<T, crate::StackError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<crate::StackError>,
{
    #[track_caller]
    fn context<C>(
        self,
        ctx: C,
    ) -> Result<T, crate::StackError>
    where
        C: Into<String>,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(e.into().context(ctx)),
        }
    }

    #[track_caller]
    fn with_context<C, F>(
        self,
        f: F,
    ) -> Result<T, crate::StackError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(e.into().context(f())),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenericError, RelayResult, StatusCode, TransportError};

    #[test]
    fn test_bail_with_format() {
        fn example(capacity: usize) -> RelayResult<()> {
            bail!(StatusCode::InvalidConfig, "bad capacity: {}", capacity);
        }

        let err = example(0).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
        assert!(err.to_string().contains("bad capacity: 0"));
    }

    #[test]
    fn test_ensure() {
        fn validate(hwm: usize) -> RelayResult<()> {
            ensure!(hwm > 0, StatusCode::InvalidConfig, "hwm must be positive");
            ensure!(hwm <= 1_000_000, TransportError::Timeout);
            Ok(())
        }

        assert!(validate(10).is_ok());
        assert_eq!(
            validate(0).unwrap_err().status_code(),
            StatusCode::InvalidConfig
        );
        assert_eq!(
            validate(2_000_000).unwrap_err().status_code(),
            StatusCode::Timeout
        );
    }

    #[test]
    fn test_result_ext_context() {
        fn inner() -> Result<(), GenericError> {
            Err(GenericError::new(StatusCode::Internal, "inner"))
        }

        fn outer() -> RelayResult<()> {
            inner().context("outer")?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert_eq!(err.contexts().len(), 1);
        assert_eq!(err.contexts()[0].message, "outer");
    }

    #[test]
    fn test_with_context_is_lazy() {
        let ok: Result<u8, GenericError> = Ok(1);
        let value = ok
            .with_context(|| -> String { panic!("must not be evaluated") })
            .unwrap();
        assert_eq!(value, 1);
    }
}
