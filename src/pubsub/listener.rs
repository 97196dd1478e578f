use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use relaybus_error::{LifecycleError, RelayResult, ResultExt, TransportError};
use tracing::{debug, error, info, warn};

use crate::network::{
    SocketOption, Subscriber, Waker, DEFAULT_HIGH_WATER_MARK, DEFAULT_RECEIVE_TIMEOUT,
    DEFAULT_RECOVERY_INTERVAL,
};

/// Адрес relay по умолчанию для подписчиков.
pub const DEFAULT_SUBSCRIBE_ADDRESS: &str = "127.0.0.1:1111";

type Handler = Box<dyn Fn(&str, &[u8]) + Send + 'static>;

/// Настройки слушателя подписки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub receive_timeout: Duration,
    pub high_water_mark: usize,
    pub recovery_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct ListenerStats {
    delivered: AtomicU64,
    handler_panics: AtomicU64,
    receive_errors: AtomicU64,
}

/// Снимок счётчиков слушателя.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub delivered: u64,
    pub handler_panics: u64,
    pub receive_errors: u64,
}

/// Фоновый приём сообщений по фильтрам тем и вызов обработчика.
///
/// Порядок использования: [`connect`](Self::connect),
/// [`subscribe`](Self::subscribe), [`start_listening`](Self::start_listening).
/// Обработчик вызывается в потоке слушателя, по одному разу на сообщение.
pub struct SubscriptionListener {
    name: String,
    config: ListenerConfig,
    source: Option<Box<dyn Subscriber>>,
    handler: Option<Handler>,
    address: Option<String>,
    topics: Vec<String>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
    waker: Option<Waker>,
    worker: Option<JoinHandle<()>>,
}

impl SubscriptionListener {
    pub fn new<F>(
        source: Box<dyn Subscriber>,
        handler: F,
    ) -> Self
    where
        F: Fn(&str, &[u8]) + Send + 'static,
    {
        Self::with_config(source, handler, ListenerConfig::default())
    }

    pub fn with_config<F>(
        source: Box<dyn Subscriber>,
        handler: F,
        config: ListenerConfig,
    ) -> Self
    where
        F: Fn(&str, &[u8]) + Send + 'static,
    {
        Self {
            name: "listener".to_string(),
            config,
            source: Some(source),
            handler: Some(Box::new(handler)),
            address: None,
            topics: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ListenerStats::default()),
            waker: None,
            worker: None,
        }
    }

    /// Имя для логов и потока.
    pub fn named(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = name.into();
        self
    }

    /// Применяет настройки к источнику и подключает его к `address`.
    pub fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()> {
        let name = self.name.clone();
        let options = [
            SocketOption::ReceiveTimeout(self.config.receive_timeout),
            SocketOption::HighWaterMark(self.config.high_water_mark),
            SocketOption::RecoveryInterval(self.config.recovery_interval),
        ];
        let source = self.source_mut()?;

        for option in options {
            source
                .set_option(option)
                .with_context(|| format!("configure {name}"))?;
        }
        source
            .connect(address)
            .with_context(|| format!("connect {name} to {address}"))?;

        self.address = Some(address.to_string());
        Ok(())
    }

    /// Добавляет по одному фильтру-префиксу на каждую тему.
    pub fn subscribe<I, S>(
        &mut self,
        topics: I,
    ) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = self.name.clone();
        let mut added = Vec::new();
        {
            let source = self.source_mut()?;
            for topic in topics {
                let topic = topic.into();
                source
                    .set_option(SocketOption::Subscribe(topic.clone()))
                    .with_context(|| format!("subscribe {name} to '{topic}'"))?;
                added.push(topic);
            }
        }

        debug!(listener = %self.name, topics = ?added, "Subscribed");
        self.topics.extend(added);
        Ok(())
    }

    /// Запускает фоновый цикл приёма.
    pub fn start_listening(&mut self) -> RelayResult<()> {
        if self.address.is_none() {
            return Err(LifecycleError::NotConnected {
                component: self.name.clone(),
            }
            .into());
        }
        let (Some(source), Some(handler)) = (self.source.take(), self.handler.take()) else {
            return Err(self.started_error());
        };

        self.waker = Some(source.waker());
        self.running.store(true, Ordering::Release);

        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_listener(name, source, handler, running, stats));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!(listener = %self.name, topics = ?self.topics, "Listener started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(LifecycleError::SpawnFailed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Останавливает цикл и ждёт его завершения.
    ///
    /// Текущий вызов обработчика доигрывается до конца; после возврата
    /// обработчик больше не вызывается. Повторный вызов безопасен.
    pub fn terminate(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!(listener = %self.name, "Listener thread panicked");
            }
            info!(
                listener = %self.name,
                delivered = self.stats.delivered.load(Ordering::Relaxed),
                "Listener stopped"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            handler_panics: self.stats.handler_panics.load(Ordering::Relaxed),
            receive_errors: self.stats.receive_errors.load(Ordering::Relaxed),
        }
    }

    fn source_mut(&mut self) -> RelayResult<&mut Box<dyn Subscriber>> {
        match self.source.as_mut() {
            Some(source) => Ok(source),
            None => Err(LifecycleError::AlreadyStarted {
                component: self.name.clone(),
            }
            .into()),
        }
    }

    fn started_error(&self) -> relaybus_error::StackError {
        LifecycleError::AlreadyStarted {
            component: self.name.clone(),
        }
        .into()
    }
}

impl Drop for SubscriptionListener {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_listener(
    name: String,
    mut source: Box<dyn Subscriber>,
    handler: Handler,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
) {
    debug!(listener = %name, "Listener loop started");

    while running.load(Ordering::Acquire) {
        let msg = match source.receive() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                if matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Closed)) {
                    error!(listener = %name, error = %e, "Source closed, stopping listener");
                    break;
                }
                warn!(listener = %name, error = %e, "Receive failed");
                continue;
            }
        };

        if msg.topic.is_empty() || msg.payload.is_empty() {
            continue;
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        match catch_unwind(AssertUnwindSafe(|| handler(&msg.topic, &msg.payload))) {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    listener = %name,
                    topic = %msg.topic,
                    panic = %panic_message(payload.as_ref()),
                    "Handler panicked"
                );
            }
        }
    }

    source.close();
    running.store(false, Ordering::Release);
    debug!(listener = %name, "Listener loop finished");
}
