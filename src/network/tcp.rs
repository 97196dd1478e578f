//! Блокирующий TCP-транспорт на `std::net`.
//!
//! Оба конца переподключаются сами: не чаще одного раза за
//! `recovery_interval`. Фильтрация по префиксу темы выполняется на стороне
//! подписчика, relay пересылает все фреймы.
//!
//! High-water mark ограничивает буферы обоих концов: publisher держит не
//! больше `hwm` фреймов, пока relay недоступен, и отказывает в остальных;
//! subscriber держит не больше `hwm` разобранных сообщений и вытесняет самые
//! старые.

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use relaybus_error::{RelayResult, TransportError};
use tracing::{debug, info, warn};

use super::{
    frame::{check_eof, decode_frame, encode_frame},
    transport::{
        matches_any, Publisher, ReceiveWaker, SocketOption, Subscriber, Transport, Waker,
        DEFAULT_HIGH_WATER_MARK, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RECOVERY_INTERVAL,
        DEFAULT_SEND_TIMEOUT,
    },
};
use crate::pubsub::Message;

const READ_CHUNK: usize = 8 * 1024;

/// TCP-транспорт. Relay поднимается реализацией по умолчанию
/// [`Transport::bootstrap_relay`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn publisher(&self) -> Box<dyn Publisher> {
        Box::new(TcpPublisher::new())
    }

    fn subscriber(&self) -> Box<dyn Subscriber> {
        Box::new(TcpSubscriber::new())
    }
}

/// Разбирает `host:port` в первый подходящий адрес.
pub fn resolve(address: &str) -> RelayResult<SocketAddr> {
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| {
        TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "no addresses resolved".to_string(),
        }
        .into()
    })
}

/// Общая логика "не чаще раза за интервал" для обоих концов.
#[derive(Debug)]
struct Reconnect {
    interval: Duration,
    last_attempt: Option<Instant>,
}

impl Reconnect {
    fn new() -> Self {
        Self {
            interval: DEFAULT_RECOVERY_INTERVAL,
            last_attempt: None,
        }
    }

    fn due(&self) -> bool {
        self.last_attempt
            .map_or(true, |at| at.elapsed() >= self.interval)
    }

    /// Сколько осталось ждать до следующей попытки.
    fn remaining(&self) -> Duration {
        self.last_attempt
            .map(|at| self.interval.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn attempt(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> std::io::Result<TcpStream> {
        self.last_attempt = Some(Instant::now());
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Publisher
////////////////////////////////////////////////////////////////////////////////

/// Отправляющий конец: пишет фреймы в одно TCP-соединение.
///
/// Пока соединения нет, фреймы копятся в `backlog` (не больше
/// `high_water_mark`) и уходят первыми после переподключения.
#[derive(Debug)]
pub struct TcpPublisher {
    address: Option<(String, SocketAddr)>,
    stream: Option<TcpStream>,
    send_timeout: Duration,
    linger: Duration,
    high_water_mark: usize,
    reconnect: Reconnect,
    buf: BytesMut,
    backlog: VecDeque<Bytes>,
}

impl TcpPublisher {
    pub fn new() -> Self {
        Self {
            address: None,
            stream: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            linger: Duration::ZERO,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            reconnect: Reconnect::new(),
            buf: BytesMut::new(),
            backlog: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Сколько фреймов ждёт переподключения.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn try_connect(&mut self) {
        let Some((address, addr)) = self.address.clone() else {
            return;
        };

        match self.reconnect.attempt(addr, self.send_timeout) {
            Ok(stream) => {
                if let Err(e) = stream.set_write_timeout(Some(self.send_timeout)) {
                    warn!(%address, error = %e, "Failed to set write timeout");
                }
                info!(%address, "Publisher connected");
                self.stream = Some(stream);
            }
            Err(e) => {
                warn!(
                    %address,
                    error = %e,
                    retry_in_ms = self.reconnect.interval.as_millis() as u64,
                    "Publisher connection failed"
                );
            }
        }
    }
}

impl Default for TcpPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for TcpPublisher {
    fn set_option(
        &mut self,
        option: SocketOption,
    ) -> RelayResult<()> {
        match option {
            SocketOption::SendTimeout(timeout) => self.send_timeout = timeout,
            SocketOption::Linger(linger) => self.linger = linger,
            SocketOption::RecoveryInterval(interval) => self.reconnect.interval = interval,
            SocketOption::HighWaterMark(hwm) => self.high_water_mark = hwm,
            other => {
                return Err(TransportError::UnsupportedOption {
                    option: other.name(),
                    endpoint: "tcp publisher",
                }
                .into())
            }
        }
        Ok(())
    }

    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()> {
        let addr = resolve(address)?;
        self.address = Some((address.to_string(), addr));
        self.try_connect();
        Ok(())
    }

    fn send(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> RelayResult<()> {
        let address = match &self.address {
            Some((address, _)) => address.clone(),
            None => return Err(TransportError::NoEndpoint.into()),
        };

        if self.stream.is_none() && self.reconnect.due() {
            self.try_connect();
        }

        self.buf.clear();
        encode_frame(topic.as_bytes(), payload, &mut self.buf)?;

        let Some(stream) = self.stream.as_mut() else {
            if self.backlog.len() >= self.high_water_mark {
                return Err(TransportError::HighWaterMark {
                    address,
                    limit: self.high_water_mark,
                }
                .into());
            }
            self.backlog.push_back(self.buf.split().freeze());
            return Ok(());
        };

        if !self.backlog.is_empty() {
            debug!(%address, frames = self.backlog.len(), "Flushing backlog");
        }
        while let Some(frame) = self.backlog.front() {
            if let Err(e) = write_frame(stream, frame, &address) {
                // фрейм остаётся в backlog и уйдёт после переподключения
                self.stream = None;
                return Err(e.into());
            }
            self.backlog.pop_front();
        }

        if let Err(e) = write_frame(stream, &self.buf, &address) {
            // соединение в неизвестном состоянии: часть фрейма могла уйти
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.backlog.is_empty() {
            warn!(
                frames = self.backlog.len(),
                "Publisher closed while disconnected, backlog discarded"
            );
            self.backlog.clear();
        }
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        if self.linger.is_zero() {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        // даём relay дочитать хвост: закрываем запись и ждём EOF не дольше linger
        let _ = stream.flush();
        let _ = stream.shutdown(Shutdown::Write);
        let _ = stream.set_read_timeout(Some(self.linger));
        let mut sink = [0u8; 256];
        let deadline = Instant::now() + self.linger;
        while Instant::now() < deadline {
            match stream.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

fn write_frame(
    stream: &mut TcpStream,
    frame: &[u8],
    address: &str,
) -> Result<(), TransportError> {
    stream.write_all(frame).map_err(|e| match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::SendFailed {
            address: address.to_string(),
            reason: e.to_string(),
        },
    })
}

////////////////////////////////////////////////////////////////////////////////
// Subscriber
////////////////////////////////////////////////////////////////////////////////

/// Принимающий конец: читает фреймы и отдаёт только подходящие по префиксу.
///
/// Всё, что уже прочитано из сокета, сразу разбирается в `pending`; при
/// переполнении high-water mark вытесняются самые старые сообщения.
#[derive(Debug)]
pub struct TcpSubscriber {
    address: Option<(String, SocketAddr)>,
    stream: Option<TcpStream>,
    filters: Vec<String>,
    receive_timeout: Duration,
    high_water_mark: usize,
    reconnect: Reconnect,
    buf: BytesMut,
    pending: VecDeque<Message>,
    dropped: u64,
    wake: Arc<TcpWake>,
}

#[derive(Debug, Default)]
struct TcpWake {
    woken: AtomicBool,
    /// Клон текущего сокета: `wake` закрывает его чтение, и блокирующий
    /// `read` сразу возвращает EOF.
    stream: Mutex<Option<TcpStream>>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReceiveWaker for TcpWake {
    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }
}

impl TcpWake {
    fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Спит до `timeout` или до пробуждения.
    fn sleep(
        &self,
        timeout: Duration,
    ) {
        let mut guard = self.lock.lock();
        if !self.is_woken() {
            self.cond.wait_for(&mut guard, timeout);
        }
    }

    fn register(
        &self,
        stream: Option<TcpStream>,
    ) {
        *self.stream.lock() = stream;
    }
}

impl TcpSubscriber {
    pub fn new() -> Self {
        Self {
            address: None,
            stream: None,
            filters: Vec::new(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            reconnect: Reconnect::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            pending: VecDeque::new(),
            dropped: 0,
            wake: Arc::new(TcpWake::default()),
        }
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Сколько сообщений вытеснено из-за high-water mark.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Разбирает все целые фреймы из буфера в `pending`.
    fn decode_pending(&mut self) -> RelayResult<()> {
        while let Some(frame) = decode_frame(&mut self.buf)? {
            if !matches_any(&self.filters, &frame.topic) {
                continue;
            }
            if self.pending.len() >= self.high_water_mark.max(1) {
                self.pending.pop_front();
                self.dropped += 1;
                warn!(
                    address = %self.address_label(),
                    hwm = self.high_water_mark,
                    dropped_total = self.dropped,
                    "Subscriber buffer is full, dropping oldest message"
                );
            }
            self.pending.push_back(frame.into_message());
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn try_connect(&mut self) {
        let Some((address, addr)) = self.address.clone() else {
            return;
        };

        match self.reconnect.attempt(addr, self.receive_timeout) {
            Ok(stream) => {
                self.wake.register(stream.try_clone().ok());
                info!(%address, "Subscriber connected");
                self.stream = Some(stream);
                // после wake сокет сразу закрываем на чтение
                if self.wake.is_woken() {
                    self.wake.wake();
                }
            }
            Err(e) => {
                warn!(
                    %address,
                    error = %e,
                    retry_in_ms = self.reconnect.interval.as_millis() as u64,
                    "Subscriber connection failed"
                );
            }
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.wake.register(None);
        self.buf.clear();
    }

    fn address_label(&self) -> String {
        self.address
            .as_ref()
            .map(|(address, _)| address.clone())
            .unwrap_or_default()
    }
}

impl Default for TcpSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber for TcpSubscriber {
    fn set_option(
        &mut self,
        option: SocketOption,
    ) -> RelayResult<()> {
        match option {
            SocketOption::ReceiveTimeout(timeout) => self.receive_timeout = timeout,
            SocketOption::RecoveryInterval(interval) => self.reconnect.interval = interval,
            SocketOption::HighWaterMark(hwm) => self.high_water_mark = hwm,
            SocketOption::Subscribe(prefix) => {
                if !self.filters.contains(&prefix) {
                    self.filters.push(prefix);
                }
            }
            other => {
                return Err(TransportError::UnsupportedOption {
                    option: other.name(),
                    endpoint: "tcp subscriber",
                }
                .into())
            }
        }
        Ok(())
    }

    fn connect(
        &mut self,
        address: &str,
    ) -> RelayResult<()> {
        let addr = resolve(address)?;
        self.address = Some((address.to_string(), addr));
        self.try_connect();
        Ok(())
    }

    fn receive(&mut self) -> RelayResult<Option<Message>> {
        if self.address.is_none() {
            return Err(TransportError::NoEndpoint.into());
        }

        let deadline = Instant::now() + self.receive_timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            // сначала то, что уже разобрано
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }

            if self.wake.is_woken() {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;

            if self.stream.is_none() {
                if self.reconnect.due() {
                    self.try_connect();
                }
                if self.stream.is_none() {
                    self.wake
                        .sleep(remaining.min(self.reconnect.remaining().max(Duration::from_millis(1))));
                    continue;
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            if let Err(e) = stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1)))) {
                warn!(error = %e, "Failed to set read timeout");
            }

            match stream.read(&mut chunk) {
                Ok(0) => {
                    if self.wake.is_woken() {
                        return Ok(None);
                    }
                    if let Err(e) = check_eof(&self.buf) {
                        warn!(address = %self.address_label(), error = %e, "Connection closed mid-frame");
                    } else {
                        info!(address = %self.address_label(), "Relay closed the connection");
                    }
                    self.drop_connection();
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if let Err(e) = self.decode_pending() {
                        warn!(address = %self.address_label(), error = %e, "Protocol error, dropping connection");
                        self.drop_connection();
                        return Err(e);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    let address = self.address_label();
                    self.drop_connection();
                    return Err(TransportError::ReceiveFailed {
                        address,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    fn waker(&self) -> Waker {
        self.wake.clone()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.wake.register(None);
        self.buf.clear();
        self.pending.clear();
        debug!(dropped = self.dropped, "Subscriber closed");
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    /// Тест проверяет, что некорректный адрес отклоняется сразу.
    #[test]
    fn test_connect_rejects_invalid_address() {
        let mut publisher = TcpPublisher::new();
        let err = publisher.connect("not an address").unwrap_err();
        assert_eq!(
            err.status_code(),
            relaybus_error::StatusCode::InvalidAddress
        );
    }

    /// Тест проверяет, что без relay фреймы копятся до high-water mark, а
    /// дальше send отказывает с QueueFull.
    #[test]
    fn test_backlog_is_bounded_by_high_water_mark() {
        // занимаем порт и сразу освобождаем: на нём никто не слушает
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let mut publisher = TcpPublisher::new();
        publisher
            .set_option(SocketOption::RecoveryInterval(Duration::from_secs(60)))
            .unwrap();
        publisher.set_option(SocketOption::HighWaterMark(2)).unwrap();
        publisher.connect(&addr.to_string()).unwrap();
        assert!(!publisher.is_connected());

        publisher.send("t", b"1").unwrap();
        publisher.send("t", b"2").unwrap();
        let err = publisher.send("t", b"3").unwrap_err();
        assert_eq!(err.status_code(), relaybus_error::StatusCode::QueueFull);
        assert!(err.is_retryable());
        assert_eq!(publisher.backlog_len(), 2);

        publisher.close();
        assert_eq!(publisher.backlog_len(), 0);
    }

    /// Тест проверяет, что после переподключения backlog уходит раньше
    /// нового фрейма.
    #[test]
    fn test_backlog_flushed_after_reconnect() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let mut publisher = TcpPublisher::new();
        publisher
            .set_option(SocketOption::RecoveryInterval(Duration::from_millis(10)))
            .unwrap();
        publisher.connect(&addr.to_string()).unwrap();
        publisher.send("t", b"early 1").unwrap();
        publisher.send("t", b"early 2").unwrap();
        assert_eq!(publisher.backlog_len(), 2);

        let listener = TcpListener::bind(addr).unwrap();
        let reader = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            conn.read_to_end(&mut raw).unwrap();
            raw
        });

        thread::sleep(Duration::from_millis(20));
        publisher.send("t", b"now").unwrap();
        assert!(publisher.is_connected());
        assert_eq!(publisher.backlog_len(), 0);
        publisher.close();

        let mut buf = BytesMut::from(&reader.join().unwrap()[..]);
        let payloads: Vec<_> = std::iter::from_fn(|| decode_frame(&mut buf).unwrap())
            .map(|f| f.payload)
            .collect();
        assert_eq!(payloads, vec![&b"early 1"[..], &b"early 2"[..], &b"now"[..]]);
    }

    /// Тест проверяет, что subscriber держит не больше high-water mark
    /// разобранных сообщений и вытесняет самые старые.
    #[test]
    fn test_subscriber_pending_is_bounded_by_high_water_mark() {
        let mut sub = TcpSubscriber::new();
        sub.set_option(SocketOption::HighWaterMark(2)).unwrap();
        sub.set_option(SocketOption::Subscribe("x".into())).unwrap();

        for i in 0..5 {
            encode_frame(format!("x{i}").as_bytes(), b"p", &mut sub.buf).unwrap();
        }
        encode_frame(b"y", b"skip", &mut sub.buf).unwrap();
        sub.decode_pending().unwrap();

        let topics: Vec<_> = sub.pending.iter().map(|m| m.topic.clone()).collect();
        assert_eq!(topics, vec!["x3", "x4"]);
        assert_eq!(sub.dropped(), 3);
        assert!(sub.buf.is_empty());
    }

    /// Тест проверяет, что publisher пишет корректные фреймы.
    #[test]
    fn test_publisher_writes_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let reader = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            conn.read_to_end(&mut raw).unwrap();
            raw
        });

        let mut publisher = TcpPublisher::new();
        publisher.connect(&addr.to_string()).unwrap();
        publisher.send("cam1", b"hello").unwrap();
        publisher.send("cam2", b"world").unwrap();
        publisher.close();

        let mut buf = BytesMut::from(&reader.join().unwrap()[..]);
        let a = decode_frame(&mut buf).unwrap().unwrap();
        let b = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!((&a.topic[..], &a.payload[..]), (&b"cam1"[..], &b"hello"[..]));
        assert_eq!((&b.topic[..], &b.payload[..]), (&b"cam2"[..], &b"world"[..]));
    }

    /// Тест проверяет фильтр по префиксу на стороне подписчика.
    #[test]
    fn test_subscriber_filters_by_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            encode_frame(b"y", b"skip", &mut buf).unwrap();
            encode_frame(b"x1", b"take", &mut buf).unwrap();
            conn.write_all(&buf).unwrap();
            // держим соединение, пока подписчик читает
            thread::sleep(Duration::from_millis(300));
        });

        let mut sub = TcpSubscriber::new();
        sub.set_option(SocketOption::Subscribe("x".into())).unwrap();
        sub.connect(&addr.to_string()).unwrap();

        let msg = sub.receive().unwrap().unwrap();
        assert_eq!(msg.topic, "x1");
        assert_eq!(&msg.payload[..], b"take");

        writer.join().unwrap();
        sub.close();
    }

    /// Тест проверяет, что waker прерывает ожидание раньше таймаута.
    #[test]
    fn test_waker_interrupts_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _keep = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(conn);
        });

        let mut sub = TcpSubscriber::new();
        sub.set_option(SocketOption::ReceiveTimeout(Duration::from_secs(10)))
            .unwrap();
        sub.set_option(SocketOption::Subscribe(String::new()))
            .unwrap();
        sub.connect(&addr.to_string()).unwrap();

        let waker = sub.waker();
        let started = Instant::now();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            waker.wake();
        });

        assert!(sub.receive().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        interrupter.join().unwrap();
    }
}
