//! Relay: точка пересылки между publisher'ами и subscriber'ами.
//!
//! Relay слушает два адреса. На входной (frontend) подключаются publisher'ы,
//! на выходной (backend) подписчики. Каждый принятый фрейм без изменений
//! рассылается всем подключённым подписчикам. Темы не разбираются, истории
//! нет: подписчик, подключившийся позже, ранних фреймов не увидит.
//!
//! Relay работает в собственном потоке ОС с однопоточным runtime tokio.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use relaybus_error::{LifecycleError, RelayResult, ResultExt, TransportError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, watch},
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use super::{
    frame::{check_eof, decode_frame},
    transport::{DEFAULT_HIGH_WATER_MARK, DEFAULT_RECOVERY_INTERVAL, DEFAULT_SEND_TIMEOUT},
};

/// Адрес входной точки по умолчанию (publisher'ы).
pub const DEFAULT_FRONTEND_BIND: &str = "0.0.0.0:1112";
/// Адрес выходной точки по умолчанию (subscriber'ы).
pub const DEFAULT_BACKEND_BIND: &str = "0.0.0.0:1111";

const READ_BUFFER: usize = 16 * 1024;

/// Настройки relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub frontend_bind: String,
    pub backend_bind: String,
    /// Сколько фреймов может ждать во входной очереди и сколько может
    /// отстать медленный подписчик.
    pub high_water_mark: usize,
    /// Пауза перед повтором после ошибки `accept`.
    pub recovery_interval: Duration,
    /// Таймаут записи фрейма подписчику.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frontend_bind: DEFAULT_FRONTEND_BIND.to_string(),
            backend_bind: DEFAULT_BACKEND_BIND.to_string(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /// Обе точки на loopback со случайными портами.
    pub fn ephemeral() -> Self {
        Self {
            frontend_bind: "127.0.0.1:0".to_string(),
            backend_bind: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

/// Счётчики relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    lagged: AtomicU64,
    protocol_errors: AtomicU64,
    task_panics: AtomicU64,
    publishers: AtomicUsize,
    subscribers: AtomicUsize,
}

impl RelayStats {
    /// Фреймов принято от publisher'ов.
    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    /// Фреймов записано подписчикам (сумма по всем).
    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Фреймов пропущено медленными подписчиками.
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Задач соединений, завершившихся паникой.
    pub fn task_panics(&self) -> u64 {
        self.task_panics.load(Ordering::Relaxed)
    }

    pub fn publishers(&self) -> usize {
        self.publishers.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

/// Запущенный relay. Остановка: [`Relay::stop`] или `Drop`.
#[derive(Debug)]
pub struct Relay {
    frontend: SocketAddr,
    backend: SocketAddr,
    stats: Arc<RelayStats>,
    shutdown: watch::Sender<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Занимает оба адреса и запускает поток пересылки.
    ///
    /// Ошибки bind (адрес занят, нет прав) возвращаются сразу.
    pub fn start(config: RelayConfig) -> RelayResult<Self> {
        let frontend = bind(&config.frontend_bind).context("relay frontend")?;
        let backend = bind(&config.backend_bind).context("relay backend")?;
        let frontend_addr = frontend.local_addr()?;
        let backend_addr = backend.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("relay runtime")?;

        let stats = Arc::new(RelayStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread = {
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("relay".to_string())
                .spawn(move || {
                    runtime.block_on(run(frontend, backend, config, stats, shutdown_rx));
                })
                .map_err(|e| LifecycleError::SpawnFailed {
                    name: "relay".to_string(),
                    reason: e.to_string(),
                })?
        };

        info!(
            frontend = %frontend_addr,
            backend = %backend_addr,
            "Relay started"
        );

        Ok(Self {
            frontend: frontend_addr,
            backend: backend_addr,
            stats,
            shutdown: shutdown_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Фактический адрес входной точки (после bind на порт 0 тоже).
    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.backend
    }

    /// Адрес, по которому publisher'ам стоит подключаться к relay.
    pub fn frontend_connect_addr(&self) -> SocketAddr {
        connectable(self.frontend)
    }

    pub fn backend_connect_addr(&self) -> SocketAddr {
        connectable(self.backend)
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Останавливает relay и ждёт завершения его потока. Повторный вызов
    /// ничего не делает.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        let _ = self.shutdown.send(true);
        if handle.join().is_err() {
            error!("Relay thread panicked");
        }
        info!(
            frames_in = self.stats.frames_in(),
            frames_out = self.stats.frames_out(),
            lagged = self.stats.lagged(),
            "Relay stopped"
        );
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(address: &str) -> RelayResult<std::net::TcpListener> {
    let listener =
        std::net::TcpListener::bind(address).map_err(|e| TransportError::bind(address, &e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| TransportError::bind(address, &e))?;
    Ok(listener)
}

/// Неуказанный IP (`0.0.0.0`, `::`) заменяется на loopback.
pub fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

async fn run(
    frontend: std::net::TcpListener,
    backend: std::net::TcpListener,
    config: RelayConfig,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (frontend, backend) = match (
        TcpListener::from_std(frontend),
        TcpListener::from_std(backend),
    ) {
        (Ok(f), Ok(b)) => (f, b),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to register relay listeners");
            return;
        }
    };

    let hwm = config.high_water_mark.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(hwm);
    let (fanout_tx, _) = broadcast::channel::<Bytes>(hwm);

    let mut tasks = JoinSet::new();
    tasks.spawn(fanout(inbound_rx, fanout_tx.clone(), Arc::clone(&stats)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = frontend.accept() => match accepted {
                Ok((stream, peer)) => {
                    tasks.spawn(serve_publisher(
                        stream,
                        peer,
                        inbound_tx.clone(),
                        Arc::clone(&stats),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Frontend accept failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(config.recovery_interval) => {}
                    }
                }
            },
            accepted = backend.accept() => match accepted {
                Ok((stream, peer)) => {
                    // подписка на рассылку до того, как соединение начнёт обслуживаться
                    let frames = fanout_tx.subscribe();
                    stats.subscribers.fetch_add(1, Ordering::Relaxed);
                    tasks.spawn(serve_subscriber(
                        stream,
                        peer,
                        frames,
                        config.send_timeout,
                        Arc::clone(&stats),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Backend accept failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(config.recovery_interval) => {}
                    }
                }
            },
            // завершённые задачи соединений
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                note_task_exit(&stats, joined);
            }
        }
    }

    tasks.shutdown().await;
    debug!("Relay loop finished");
}

fn note_task_exit(
    stats: &RelayStats,
    joined: Result<(), JoinError>,
) {
    let Err(e) = joined else {
        return;
    };
    if e.is_panic() {
        stats.task_panics.fetch_add(1, Ordering::Relaxed);
        error!(error = %e, "Relay connection task panicked");
    } else {
        debug!(error = %e, "Relay connection task cancelled");
    }
}

async fn fanout(
    mut inbound: mpsc::Receiver<Bytes>,
    frames: broadcast::Sender<Bytes>,
    stats: Arc<RelayStats>,
) {
    while let Some(frame) = inbound.recv().await {
        stats.frames_in.fetch_add(1, Ordering::Relaxed);
        // нет подписчиков: фрейм никому не нужен
        let _ = frames.send(frame);
    }
}

async fn serve_publisher(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Bytes>,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    stats.publishers.fetch_add(1, Ordering::Relaxed);
    debug!(%peer, "Publisher attached");

    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    'conn: loop {
        loop {
            match decode_frame(&mut buf) {
                Ok(Some(frame)) => {
                    let bytes = match frame.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(%peer, error = %e, "Failed to re-encode frame");
                            continue;
                        }
                    };
                    // очередь полна: перестаём читать сокет, пока не освободится
                    if inbound.send(bytes).await.is_err() {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, error = %e, "Protocol error, closing publisher connection");
                    break 'conn;
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    if let Err(e) = check_eof(&buf) {
                        warn!(%peer, error = %e, "Publisher disconnected mid-frame");
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(%peer, error = %e, "Publisher read failed");
                    break;
                }
            }
        }
    }

    stats.publishers.fetch_sub(1, Ordering::Relaxed);
    debug!(%peer, "Publisher detached");
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Bytes>,
    send_timeout: Duration,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, "Subscriber attached");

    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            // подписчик ничего не пишет: 0 или ошибка означают отключение
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            frame = frames.recv() => match frame {
                Ok(frame) => match timeout(send_timeout, writer.write_all(&frame)).await {
                    Ok(Ok(())) => {
                        stats.frames_out.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        debug!(%peer, error = %e, "Subscriber write failed, dropping connection");
                        break;
                    }
                    Err(_) => {
                        warn!(%peer, timeout_ms = send_timeout.as_millis() as u64, "Subscriber write timed out, dropping connection");
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    stats.lagged.fetch_add(skipped, Ordering::Relaxed);
                    warn!(%peer, skipped, "Slow subscriber skipped frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    stats.subscribers.fetch_sub(1, Ordering::Relaxed);
    debug!(%peer, "Subscriber detached");
}
