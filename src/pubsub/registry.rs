use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use relaybus_error::{LifecycleError, RelayResult, StackError};
use tracing::{debug, error, info, warn};

use super::{Channel, ChannelConfig};
use crate::network::{Relay, RelayConfig, Transport};

/// Адрес relay по умолчанию для publisher'ов.
pub const DEFAULT_PUBLISH_ADDRESS: &str = "127.0.0.1:1112";

/// Настройки реестра каналов.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Куда подключаются каналы, пока реестр не поднял собственный relay.
    pub publish_address: String,
    pub channel: ChannelConfig,
    pub relay: RelayConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            publish_address: DEFAULT_PUBLISH_ADDRESS.to_string(),
            channel: ChannelConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<Arc<str>, Arc<Channel>>,
    /// Порядок регистрации, в нём же каналы останавливаются.
    order: Vec<Arc<str>>,
    /// Адрес поднятого реестром relay.
    relay_address: Option<String>,
    closed: bool,
}

/// Реестр логических каналов: единая точка публикации.
///
/// Создаётся явно и разделяется через `Arc`. Подключение нового канала идёт
/// без блокировки реестра, а вставка в карту под ней: если канал с тем же
/// идентификатором успели вставить раньше, новый останавливается, и в реестре
/// всегда ровно один канал на идентификатор.
pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    // порядок блокировок: relay, затем state
    relay: Mutex<Option<Arc<Relay>>>,
}

impl ChannelRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(RegistryState::default()),
            relay: Mutex::new(None),
        }
    }

    /// Публикует сообщение в канал `channel_id`.
    ///
    /// Незарегистрированный канал создаётся на лету (с предупреждением).
    /// Возвращает `true`, если канал принял сообщение; `false`, если канал
    /// создать не удалось, он уже остановлен или тема пустая.
    pub fn publish(
        &self,
        channel_id: &str,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> bool {
        let channel = match self.channel(channel_id) {
            Some(channel) => channel,
            None => {
                warn!(
                    channel = channel_id,
                    "Publishing to unregistered channel, creating it lazily"
                );
                match self.get_or_create(channel_id) {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!(channel = channel_id, error = %e, "Failed to create channel");
                        return false;
                    }
                }
            }
        };

        channel.publish(topic, payload)
    }

    /// Регистрирует каналы. Уже известные идентификаторы не трогаются.
    ///
    /// При `bootstrap_relay` сначала поднимается relay (если его ещё нет), и
    /// все каналы подключаются к его фактическому адресу.
    pub fn register_channels<I, S>(
        &self,
        ids: I,
        bootstrap_relay: bool,
    ) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if bootstrap_relay {
            self.ensure_relay()?;
        }

        for id in ids {
            let id = id.as_ref();
            if self.channel(id).is_some() {
                debug!(channel = id, "Channel already registered");
                continue;
            }
            self.get_or_create(id)?;
        }
        Ok(())
    }

    /// Поднимает relay через транспорт, если он ещё не запущен.
    pub fn ensure_relay(&self) -> RelayResult<Option<Arc<Relay>>> {
        let mut relay = self.relay.lock();
        if let Some(existing) = relay.as_ref() {
            return Ok(Some(Arc::clone(existing)));
        }

        let Some(started) = self.transport.bootstrap_relay(&self.config.relay)? else {
            debug!(
                transport = self.transport.name(),
                "Transport does not need a separate relay"
            );
            return Ok(None);
        };

        let started = Arc::new(started);
        self.state.lock().relay_address = Some(started.frontend_connect_addr().to_string());
        *relay = Some(Arc::clone(&started));
        Ok(Some(started))
    }

    pub fn channel(
        &self,
        channel_id: &str,
    ) -> Option<Arc<Channel>> {
        self.state.lock().channels.get(channel_id).cloned()
    }

    /// Идентификаторы в порядке регистрации.
    pub fn channel_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .order
            .iter()
            .map(|id| id.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relay, поднятый этим реестром.
    pub fn relay(&self) -> Option<Arc<Relay>> {
        self.relay.lock().clone()
    }

    /// Адрес, к которому подключаются новые каналы.
    pub fn publish_address(&self) -> String {
        self.state
            .lock()
            .relay_address
            .clone()
            .unwrap_or_else(|| self.config.publish_address.clone())
    }

    /// Останавливает все каналы в порядке регистрации, затем relay.
    ///
    /// После этого новые каналы не создаются.
    pub fn shutdown(&self) {
        let channels: Vec<Arc<Channel>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .order
                .iter()
                .filter_map(|id| state.channels.get(id).cloned())
                .collect()
        };

        for channel in &channels {
            channel.terminate();
        }

        if let Some(relay) = self.relay.lock().take() {
            relay.stop();
        }

        info!(channels = channels.len(), "Channel registry shut down");
    }

    fn get_or_create(
        &self,
        channel_id: &str,
    ) -> RelayResult<Arc<Channel>> {
        let address = {
            let state = self.state.lock();
            if let Some(existing) = state.channels.get(channel_id) {
                return Ok(Arc::clone(existing));
            }
            if state.closed {
                return Err(registry_closed());
            }
            state
                .relay_address
                .clone()
                .unwrap_or_else(|| self.config.publish_address.clone())
        };

        // connect может ждать сеть до send_timeout, реестр в это время свободен
        let id: Arc<str> = Arc::from(channel_id);
        let opened = Channel::open(
            Arc::clone(&id),
            self.transport.publisher(),
            &address,
            &self.config.channel,
        )?;

        let mut state = self.state.lock();
        if let Some(existing) = state.channels.get(channel_id) {
            let existing = Arc::clone(existing);
            drop(state);
            debug!(channel = channel_id, "Channel was created concurrently, closing duplicate");
            opened.terminate();
            return Ok(existing);
        }
        if state.closed {
            drop(state);
            opened.terminate();
            return Err(registry_closed());
        }

        let channel = Arc::new(opened);
        state.channels.insert(Arc::clone(&id), Arc::clone(&channel));
        state.order.push(id);
        Ok(channel)
    }
}

fn registry_closed() -> StackError {
    LifecycleError::Terminated {
        component: "channel registry".to_string(),
    }
    .into()
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
