use std::{sync::Arc, time::Duration};

use relaybus_error::RelayResult;

use super::relay::{Relay, RelayConfig};
use crate::pubsub::Message;

/// Таймаут приёма по умолчанию.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
/// Таймаут отправки по умолчанию.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Интервал между попытками переподключения.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(1);
/// Допустимое число кадров в буферах по умолчанию.
pub const DEFAULT_HIGH_WATER_MARK: usize = 10_000;

/// Опции конца соединения, выставляемые до `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOption {
    ReceiveTimeout(Duration),
    SendTimeout(Duration),
    HighWaterMark(usize),
    /// Сколько ждать отправки хвоста при закрытии. Ноль: закрыть сразу.
    Linger(Duration),
    RecoveryInterval(Duration),
    /// Фильтр по префиксу темы. Можно добавлять несколько.
    Subscribe(String),
}

impl SocketOption {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveTimeout(_) => "receive_timeout",
            Self::SendTimeout(_) => "send_timeout",
            Self::HighWaterMark(_) => "high_water_mark",
            Self::Linger(_) => "linger",
            Self::RecoveryInterval(_) => "recovery_interval",
            Self::Subscribe(_) => "subscribe",
        }
    }
}

/// Отправляющий конец транспорта (sink).
///
/// Принадлежит ровно одному потоку: воркеру своего канала.
pub trait Publisher: Send {
    fn set_option(
        &mut self,
        option: SocketOption,
    ) -> RelayResult<()>;

    /// Запоминает адрес и пытается подключиться.
    ///
    /// Ошибкой считается только некорректный адрес; недоступный узел
    /// переподключается позже, при очередной отправке.
    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()>;

    /// Отправляет один фрейм (topic, payload).
    fn send(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> RelayResult<()>;

    fn close(&mut self);
}

/// Принимающий конец транспорта (source).
pub trait Subscriber: Send {
    fn set_option(
        &mut self,
        option: SocketOption,
    ) -> RelayResult<()>;

    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()>;

    /// Ждёт следующее сообщение не дольше таймаута приёма.
    ///
    /// `Ok(None)`: за интервал ничего не пришло, либо сработал [`Waker`].
    fn receive(&mut self) -> RelayResult<Option<Message>>;

    /// Будильник, прерывающий текущий и все последующие `receive`.
    fn waker(&self) -> Waker;

    fn close(&mut self);
}

/// Прерывает ожидание в [`Subscriber::receive`] из другого потока.
pub trait ReceiveWaker: Send + Sync {
    fn wake(&self);
}

pub type Waker = Arc<dyn ReceiveWaker>;

/// Фабрика концов соединения одного вида транспорта.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn publisher(&self) -> Box<dyn Publisher>;

    fn subscriber(&self) -> Box<dyn Subscriber>;

    /// Поднимает relay для этого транспорта.
    ///
    /// `Ok(None)`: транспорту отдельный relay не нужен.
    fn bootstrap_relay(
        &self,
        config: &RelayConfig,
    ) -> RelayResult<Option<Relay>> {
        Relay::start(config.clone()).map(Some)
    }
}

/// Проверяет, проходит ли тема хотя бы один фильтр.
///
/// Пустой набор фильтров не пропускает ничего.
pub fn matches_any(
    filters: &[String],
    topic: &[u8],
) -> bool {
    filters.iter().any(|f| topic.starts_with(f.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_filtering() {
        let filters = vec!["cam1".to_string(), "sys/".to_string()];
        assert!(matches_any(&filters, b"cam1"));
        assert!(matches_any(&filters, b"cam10"));
        assert!(matches_any(&filters, b"sys/health"));
        assert!(!matches_any(&filters, b"cam2"));
        assert!(!matches_any(&filters, b"sys"));
    }

    #[test]
    fn test_empty_filter_set_matches_nothing() {
        assert!(!matches_any(&[], b"anything"));
        // пустой префикс: подписка на всё
        assert!(matches_any(&[String::new()], b"anything"));
    }

    #[test]
    fn test_option_names() {
        assert_eq!(SocketOption::Linger(Duration::ZERO).name(), "linger");
        assert_eq!(SocketOption::Subscribe("x".into()).name(), "subscribe");
    }
}
