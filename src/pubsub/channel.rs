use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use relaybus_error::{LifecycleError, LogLevel, RelayResult, ResultExt, StackError};
use tracing::{debug, error, info, warn};

use super::{queue::DEFAULT_QUEUE_CAPACITY, BoundedQueue, Message};
use crate::network::{
    Publisher, SocketOption, DEFAULT_HIGH_WATER_MARK, DEFAULT_RECOVERY_INTERVAL,
    DEFAULT_SEND_TIMEOUT,
};

/// Настройки канала публикации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub high_water_mark: usize,
    pub linger: Duration,
    pub recovery_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            linger: Duration::ZERO,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
        }
    }
}

/// Счётчики канала.
#[derive(Debug, Default)]
pub struct ChannelStats {
    published: AtomicU64,
    rejected: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Снимок счётчиков канала.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    /// Принято в очередь
    pub published: u64,
    /// Отклонено (пустая тема или канал остановлен)
    pub rejected: u64,
    /// Успешно отправлено в транспорт
    pub sent: u64,
    /// Ошибки отправки
    pub failed: u64,
    /// Вытеснено из переполненной очереди
    pub dropped: u64,
    /// Сейчас в очереди
    pub queued: usize,
}

/// Конвейер публикации одного логического канала.
///
/// Владеет очередью и фоновым потоком, который вычитывает её в транспорт.
/// Порядок сообщений внутри канала сохраняется. Канал работает, пока его
/// очередь не закрыта.
pub struct Channel {
    id: Arc<str>,
    address: String,
    queue: Arc<BoundedQueue<Message>>,
    stats: Arc<ChannelStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Подключает `sink` к `address` и запускает воркер.
    ///
    /// Ошибка возвращается только если адрес некорректен или поток не
    /// удалось создать; недоступный relay не мешает созданию канала.
    pub fn open(
        id: impl Into<Arc<str>>,
        mut sink: Box<dyn Publisher>,
        address: &str,
        config: &ChannelConfig,
    ) -> RelayResult<Self> {
        let id: Arc<str> = id.into();

        for option in [
            SocketOption::SendTimeout(config.send_timeout),
            SocketOption::HighWaterMark(config.high_water_mark),
            SocketOption::Linger(config.linger),
            SocketOption::RecoveryInterval(config.recovery_interval),
        ] {
            sink.set_option(option)
                .with_context(|| format!("configure channel '{id}'"))?;
        }
        sink.connect(address)
            .with_context(|| format!("connect channel '{id}' to {address}"))?;

        let queue = Arc::new(BoundedQueue::with_label(
            format!("channel:{id}"),
            config.queue_capacity,
        ));
        let stats = Arc::new(ChannelStats::default());

        let worker = {
            let id = Arc::clone(&id);
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            let name = format!("channel-{id}");
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(id, queue, sink, stats))
                .map_err(|e| LifecycleError::SpawnFailed {
                    name,
                    reason: e.to_string(),
                })?
        };

        info!(channel = %id, %address, capacity = queue.capacity(), "Channel opened");

        Ok(Self {
            id,
            address: address.to_string(),
            queue,
            stats,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Ставит сообщение в очередь. Не блокируется и не возвращает ошибок.
    ///
    /// Возвращает `true`, если сообщение принято. Пустая тема и публикация
    /// после [`Channel::terminate`] отклоняются.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> bool {
        if topic.is_empty() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %self.id, "Rejected message with empty topic");
            return false;
        }

        match self.queue.try_push(Message::new(topic, payload)) {
            Ok(_) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.id, topic, "Channel is terminated, message dropped");
                false
            }
        }
    }

    /// Останавливает воркер: сообщения, поставленные до вызова, ещё будут
    /// отправлены. Повторный вызов возвращается сразу.
    pub fn terminate(&self) {
        if self.queue.close() {
            debug!(channel = %self.id, queued = self.queue.size(), "Channel closing");
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(channel = %self.id, "Channel worker panicked");
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Адрес relay, к которому подключён канал.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.size()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
            queued: self.queue.size(),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("running", &self.is_running())
            .field("queued", &self.queue.size())
            .finish()
    }
}

fn run_worker(
    id: Arc<str>,
    queue: Arc<BoundedQueue<Message>>,
    mut sink: Box<dyn Publisher>,
    stats: Arc<ChannelStats>,
) {
    debug!(channel = %id, "Channel worker started");

    // None приходит только после terminate, когда очередь уже вычитана
    while let Some(msg) = queue.wait_and_pop() {
        match sink.send(&msg.topic, &msg.payload) {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log_send_failure(&id, &msg.topic, &e);
            }
        }
    }

    sink.close();
    debug!(
        channel = %id,
        sent = stats.sent.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        "Channel worker stopped"
    );
}

/// Уровень записи зависит от кода: временные сетевые сбои идут в `warn`,
/// поломки окружения в `error`.
fn log_send_failure(
    id: &str,
    topic: &str,
    err: &StackError,
) {
    let retryable = err.is_retryable();
    let tags = err.metrics_tags();
    match err.log_level() {
        LogLevel::Error => {
            error!(channel = %id, topic, retryable, ?tags, error = %err, "Send failed, message dropped")
        }
        LogLevel::Warn => {
            warn!(channel = %id, topic, retryable, ?tags, error = %err, "Send failed, message dropped")
        }
        _ => {
            debug!(channel = %id, topic, retryable, ?tags, error = %err, "Send failed, message dropped")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, mpsc};

    use super::*;
    use crate::network::{MemoryHub, Transport};

    fn open(
        hub: &MemoryHub,
        capacity: usize,
    ) -> Channel {
        let config = ChannelConfig {
            queue_capacity: capacity,
            ..ChannelConfig::default()
        };
        Channel::open("cam1", hub.publisher(), "mem://relay", &config).unwrap()
    }

    /// Тест проверяет, что terminate дожидается отправки очереди.
    #[test]
    fn test_terminate_drains_queue() {
        let hub = MemoryHub::new();
        let channel = open(&hub, 100);

        for i in 0..50 {
            channel.publish("cam1", format!("frame {i}"));
        }
        channel.terminate();

        let history = hub.history();
        assert_eq!(history.len(), 50);
        for (i, msg) in history.iter().enumerate() {
            assert_eq!(msg.payload, Bytes::from(format!("frame {i}")));
        }
        assert_eq!(channel.stats().sent, 50);
    }

    /// Тест проверяет, что повторный terminate безопасен.
    #[test]
    fn test_terminate_twice() {
        let hub = MemoryHub::new();
        let channel = open(&hub, 10);
        channel.terminate();
        assert!(!channel.is_running());
        channel.terminate();
    }

    /// Тест проверяет отклонение пустой темы и публикации после остановки.
    #[test]
    fn test_rejects_empty_topic_and_after_terminate() {
        let hub = MemoryHub::new();
        let channel = open(&hub, 10);

        assert!(!channel.publish("", "x"));
        channel.terminate();
        assert!(!channel.publish("cam1", "late"));

        let stats = channel.stats();
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.published, 0);
        assert!(hub.history().is_empty());
    }

    /// Тест проверяет, что terminate на полной очереди ничего не вытесняет:
    /// всё, что лежало в очереди, уходит в транспорт.
    #[test]
    fn test_terminate_on_full_queue_keeps_everything() {
        let hub = MemoryHub::new();
        hub.pause();
        let channel = Arc::new(open(&hub, 3));

        assert!(channel.publish("cam1", "0"));
        assert!(hub.wait_for_blocked(1, Duration::from_secs(5)));
        for p in ["1", "2", "3"] {
            assert!(channel.publish("cam1", p));
        }
        assert_eq!(channel.queue_len(), 3);

        let closer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.terminate())
        };
        thread::sleep(Duration::from_millis(50));
        hub.resume();
        closer.join().unwrap();

        let payloads: Vec<_> = hub.history().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec!["0", "1", "2", "3"]);
        assert_eq!(channel.stats().dropped, 0);
    }

    /// Тест проверяет, что terminate завершается, даже когда параллельные
    /// публикации непрерывно переполняют очередь ёмкости 1.
    #[test]
    fn test_terminate_races_with_publishers() {
        let hub = MemoryHub::new();
        hub.pause();
        let channel = Arc::new(open(&hub, 1));

        assert!(channel.publish("cam1", "first"));
        assert!(hub.wait_for_blocked(1, Duration::from_secs(5)));

        let stop = Arc::new(AtomicBool::new(false));
        let publishers: Vec<_> = (0..4)
            .map(|t| {
                let channel = Arc::clone(&channel);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut i = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        channel.publish("cam1", format!("{t}-{i}"));
                        i += 1;
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        let (done_tx, done_rx) = mpsc::channel();
        let closer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                channel.terminate();
                let _ = done_tx.send(());
            })
        };
        thread::sleep(Duration::from_millis(20));
        hub.resume();

        let finished = done_rx.recv_timeout(Duration::from_secs(5));
        stop.store(true, Ordering::Relaxed);
        for p in publishers {
            p.join().unwrap();
        }
        assert!(finished.is_ok(), "terminate did not return");
        closer.join().unwrap();

        assert!(!channel.is_running());
        assert!(!channel.publish("cam1", "late"));
        let stats = channel.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.published, stats.sent + stats.failed + stats.dropped);
    }

    /// Тест проверяет, что ошибка отправки не останавливает воркер.
    #[test]
    fn test_send_failure_does_not_stop_worker() {
        let hub = MemoryHub::new();
        hub.fail_next_sends(1);
        let channel = open(&hub, 10);

        channel.publish("cam1", "lost");
        channel.publish("cam1", "kept");
        channel.terminate();

        let stats = channel.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(hub.history(), vec![Message::new("cam1", "kept")]);
    }

    /// Тест проверяет, что некорректный адрес не даёт создать канал.
    #[test]
    fn test_open_fails_on_invalid_address() {
        let hub = MemoryHub::new();
        let err = Channel::open("bad", hub.publisher(), "", &ChannelConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }
}
