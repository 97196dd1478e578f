//! Внутрипроцессный транспорт для тестов.
//!
//! [`MemoryHub`] играет роль relay: всё, что отправлено любым publisher'ом
//! хаба, раздаётся всем подключённым subscriber'ам. Адреса проверяются только
//! на непустоту. Хаб ведёт журнал отправок и умеет имитировать сбои и
//! зависшую сеть.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use relaybus_error::{RelayResult, TransportError};
use tracing::{debug, trace};

use super::{
    relay::{Relay, RelayConfig},
    transport::{
        matches_any, Publisher, ReceiveWaker, SocketOption, Subscriber, Transport, Waker,
        DEFAULT_HIGH_WATER_MARK, DEFAULT_RECEIVE_TIMEOUT,
    },
};
use crate::pubsub::Message;

enum Delivery {
    Message(Message),
    Wake,
}

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<Vec<SyncSender<Delivery>>>,
    history: Mutex<Vec<Message>>,
    fail_next: AtomicUsize,
    paused: Mutex<bool>,
    resumed: Condvar,
    blocked: AtomicUsize,
    overflowed: AtomicU64,
}

/// Общая точка обмена для memory-транспорта. Дёшево клонируется.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Все успешно отправленные сообщения в порядке отправки.
    pub fn history(&self) -> Vec<Message> {
        self.inner.history.lock().clone()
    }

    /// Следующие `n` вызовов `send` завершатся ошибкой.
    pub fn fail_next_sends(
        &self,
        n: usize,
    ) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Имитирует зависшую сеть: `send` блокируется до [`MemoryHub::resume`].
    pub fn pause(&self) {
        *self.inner.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.inner.paused.lock() = false;
        self.inner.resumed.notify_all();
    }

    /// Сколько `send` сейчас заблокировано паузой.
    pub fn blocked_senders(&self) -> usize {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// Ждёт, пока паузой не будут заблокированы `n` отправителей.
    pub fn wait_for_blocked(
        &self,
        n: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while self.blocked_senders() < n {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Число подписчиков на момент последней доставки.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Сколько сообщений не поместилось в очереди подписчиков.
    pub fn overflowed(&self) -> u64 {
        self.inner.overflowed.load(Ordering::Relaxed)
    }

    fn wait_while_paused(&self) {
        let mut paused = self.inner.paused.lock();
        if !*paused {
            return;
        }
        self.inner.blocked.fetch_add(1, Ordering::SeqCst);
        while *paused {
            self.inner.resumed.wait(&mut paused);
        }
        self.inner.blocked.fetch_sub(1, Ordering::SeqCst);
    }

    fn deliver(
        &self,
        msg: Message,
    ) {
        self.inner.history.lock().push(msg.clone());

        let mut subs = self.inner.subscribers.lock();
        subs.retain(|tx| match tx.try_send(Delivery::Message(msg.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.overflowed.fetch_add(1, Ordering::Relaxed);
                trace!(topic = %msg.topic, "Subscriber queue full, message dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn attach(
        &self,
        high_water_mark: usize,
    ) -> (SyncSender<Delivery>, Receiver<Delivery>) {
        let (tx, rx) = mpsc::sync_channel(high_water_mark.max(1));
        self.inner.subscribers.lock().push(tx.clone());
        (tx, rx)
    }
}

impl Transport for MemoryHub {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn publisher(&self) -> Box<dyn Publisher> {
        Box::new(MemoryPublisher {
            hub: self.clone(),
            address: None,
        })
    }

    fn subscriber(&self) -> Box<dyn Subscriber> {
        Box::new(MemorySubscriber::new(self.clone()))
    }

    /// Хаб сам является точкой пересылки.
    fn bootstrap_relay(
        &self,
        _config: &RelayConfig,
    ) -> RelayResult<Option<Relay>> {
        Ok(None)
    }
}

fn check_address(address: &str) -> RelayResult<()> {
    if address.trim().is_empty() {
        return Err(TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "address is empty".to_string(),
        }
        .into());
    }
    Ok(())
}

pub struct MemoryPublisher {
    hub: MemoryHub,
    address: Option<String>,
}

impl Publisher for MemoryPublisher {
    fn set_option(
        &mut self,
        _option: SocketOption,
    ) -> RelayResult<()> {
        Ok(())
    }

    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()> {
        check_address(address)?;
        self.address = Some(address.to_string());
        Ok(())
    }

    fn send(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> RelayResult<()> {
        let Some(address) = self.address.as_ref() else {
            return Err(TransportError::NoEndpoint.into());
        };

        self.hub.wait_while_paused();

        let fail = self
            .hub
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::SendFailed {
                address: address.clone(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        self.hub.deliver(Message::new(topic, payload.to_vec()));
        Ok(())
    }

    fn close(&mut self) {
        self.address = None;
    }
}

#[derive(Default)]
struct MemoryWake {
    woken: AtomicBool,
    tx: Mutex<Option<SyncSender<Delivery>>>,
}

impl ReceiveWaker for MemoryWake {
    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(Delivery::Wake);
        }
    }
}

pub struct MemorySubscriber {
    hub: MemoryHub,
    rx: Option<Receiver<Delivery>>,
    filters: Vec<String>,
    receive_timeout: Duration,
    high_water_mark: usize,
    wake: Arc<MemoryWake>,
}

impl MemorySubscriber {
    fn new(hub: MemoryHub) -> Self {
        Self {
            hub,
            rx: None,
            filters: Vec::new(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            wake: Arc::new(MemoryWake::default()),
        }
    }
}

impl Subscriber for MemorySubscriber {
    fn set_option(
        &mut self,
        option: SocketOption,
    ) -> RelayResult<()> {
        match option {
            SocketOption::ReceiveTimeout(timeout) => self.receive_timeout = timeout,
            SocketOption::HighWaterMark(hwm) => self.high_water_mark = hwm,
            SocketOption::Subscribe(prefix) => {
                if !self.filters.contains(&prefix) {
                    self.filters.push(prefix);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()> {
        check_address(address)?;
        let (tx, rx) = self.hub.attach(self.high_water_mark);
        *self.wake.tx.lock() = Some(tx);
        self.rx = Some(rx);
        debug!(address, "Memory subscriber attached");
        Ok(())
    }

    fn receive(&mut self) -> RelayResult<Option<Message>> {
        let Some(rx) = self.rx.as_ref() else {
            return Err(TransportError::NoEndpoint.into());
        };

        let deadline = Instant::now() + self.receive_timeout;
        loop {
            if self.wake.woken.load(Ordering::Acquire) {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match rx.recv_timeout(remaining) {
                Ok(Delivery::Message(msg)) => {
                    if matches_any(&self.filters, msg.topic.as_bytes()) {
                        return Ok(Some(msg));
                    }
                }
                Ok(Delivery::Wake) => continue,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed.into()),
            }
        }
    }

    fn waker(&self) -> Waker {
        self.wake.clone()
    }

    fn close(&mut self) {
        *self.wake.tx.lock() = None;
        self.rx = None;
    }
}
