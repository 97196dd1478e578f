use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use ::config::{Config, Environment, File};
use relaybus_error::{ensure, ConfigError, RelayResult};
use serde::{Deserialize, Serialize};

use crate::{
    logging::LoggingConfig,
    network::{
        RelayConfig, DEFAULT_BACKEND_BIND, DEFAULT_FRONTEND_BIND, DEFAULT_HIGH_WATER_MARK,
        DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RECOVERY_INTERVAL, DEFAULT_SEND_TIMEOUT,
    },
    pubsub::{
        ChannelConfig, ListenerConfig, RegistryConfig, DEFAULT_PUBLISH_ADDRESS,
        DEFAULT_QUEUE_CAPACITY, DEFAULT_SUBSCRIBE_ADDRESS,
    },
};

/// Файл настроек, который читается из рабочего каталога, если есть.
pub const DEFAULT_CONFIG_FILE: &str = "relaybus.toml";
/// Переменная окружения с явным путём к файлу настроек.
pub const CONFIG_PATH_ENV: &str = "RELAYBUS_CONFIG";
const ENV_PREFIX: &str = "RELAYBUS";

/// Секция `[relay]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySettings {
    /// Поднимать relay в этом процессе
    pub bootstrap: bool,
    pub frontend_bind: String,
    pub backend_bind: String,
    pub high_water_mark: usize,
    pub recovery_interval_ms: u64,
    pub send_timeout_ms: u64,
}

/// Секция `[publisher]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherSettings {
    /// Адрес relay, если он не поднимается локально
    pub address: String,
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    pub high_water_mark: usize,
    pub linger_ms: u64,
    pub recovery_interval_ms: u64,
}

/// Секция `[subscriber]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubscriberSettings {
    pub address: String,
    pub receive_timeout_ms: u64,
    pub high_water_mark: usize,
    pub recovery_interval_ms: u64,
}

/// Настройки процесса целиком.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub relay: RelaySettings,
    pub publisher: PublisherSettings,
    pub subscriber: SubscriberSettings,
    pub logging: LoggingConfig,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bootstrap: true,
            frontend_bind: DEFAULT_FRONTEND_BIND.to_string(),
            backend_bind: DEFAULT_BACKEND_BIND.to_string(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            recovery_interval_ms: millis(DEFAULT_RECOVERY_INTERVAL),
            send_timeout_ms: millis(DEFAULT_SEND_TIMEOUT),
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_PUBLISH_ADDRESS.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout_ms: millis(DEFAULT_SEND_TIMEOUT),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            linger_ms: 0,
            recovery_interval_ms: millis(DEFAULT_RECOVERY_INTERVAL),
        }
    }
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_SUBSCRIBE_ADDRESS.to_string(),
            receive_timeout_ms: millis(DEFAULT_RECEIVE_TIMEOUT),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            recovery_interval_ms: millis(DEFAULT_RECOVERY_INTERVAL),
        }
    }
}

impl Settings {
    /// Загружает настройки: значения по умолчанию, затем файл, затем
    /// окружение (`RELAYBUS_PUBLISHER__QUEUE_CAPACITY=500`).
    ///
    /// Явно переданный файл обязан существовать; `relaybus.toml` в рабочем
    /// каталоге читается, только если он есть.
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let file = match path {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(path) => File::from(PathBuf::from(path)).required(true),
                None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
            },
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| ConfigError::Load {
                reason: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Отклоняет нулевые ёмкости, таймауты и пустые адреса.
    pub fn validate(&self) -> RelayResult<()> {
        non_empty("relay.frontend_bind", &self.relay.frontend_bind)?;
        non_empty("relay.backend_bind", &self.relay.backend_bind)?;
        positive("relay.high_water_mark", self.relay.high_water_mark as u64)?;
        positive("relay.recovery_interval_ms", self.relay.recovery_interval_ms)?;
        positive("relay.send_timeout_ms", self.relay.send_timeout_ms)?;

        non_empty("publisher.address", &self.publisher.address)?;
        positive("publisher.queue_capacity", self.publisher.queue_capacity as u64)?;
        positive("publisher.send_timeout_ms", self.publisher.send_timeout_ms)?;
        positive("publisher.high_water_mark", self.publisher.high_water_mark as u64)?;
        positive(
            "publisher.recovery_interval_ms",
            self.publisher.recovery_interval_ms,
        )?;

        non_empty("subscriber.address", &self.subscriber.address)?;
        positive("subscriber.receive_timeout_ms", self.subscriber.receive_timeout_ms)?;
        positive("subscriber.high_water_mark", self.subscriber.high_water_mark as u64)?;
        positive(
            "subscriber.recovery_interval_ms",
            self.subscriber.recovery_interval_ms,
        )?;

        self.logging.validate()
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            frontend_bind: self.relay.frontend_bind.clone(),
            backend_bind: self.relay.backend_bind.clone(),
            high_water_mark: self.relay.high_water_mark,
            recovery_interval: Duration::from_millis(self.relay.recovery_interval_ms),
            send_timeout: Duration::from_millis(self.relay.send_timeout_ms),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            queue_capacity: self.publisher.queue_capacity,
            send_timeout: Duration::from_millis(self.publisher.send_timeout_ms),
            high_water_mark: self.publisher.high_water_mark,
            linger: Duration::from_millis(self.publisher.linger_ms),
            recovery_interval: Duration::from_millis(self.publisher.recovery_interval_ms),
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            receive_timeout: Duration::from_millis(self.subscriber.receive_timeout_ms),
            high_water_mark: self.subscriber.high_water_mark,
            recovery_interval: Duration::from_millis(self.subscriber.recovery_interval_ms),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            publish_address: self.publisher.address.clone(),
            channel: self.channel_config(),
            relay: self.relay_config(),
        }
    }
}

fn positive(
    key: &str,
    value: u64,
) -> RelayResult<()> {
    ensure!(value > 0, ConfigError::invalid(key, "must be greater than zero"));
    Ok(())
}

fn non_empty(
    key: &str,
    value: &str,
) -> RelayResult<()> {
    ensure!(
        !value.trim().is_empty(),
        ConfigError::invalid(key, "must not be empty")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use relaybus_error::StatusCode;
    use serial_test::serial;

    use super::*;

    struct EnvGuard(Vec<(&'static str, Option<String>)>);

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            let saved = vars
                .iter()
                .map(|(k, v)| {
                    let prev = std::env::var(k).ok();
                    std::env::set_var(k, v);
                    (*k, prev)
                })
                .collect();
            Self(saved)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, prev) in self.0.drain(..) {
                match prev {
                    Some(v) => std::env::set_var(k, v),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.relay.bootstrap);
        assert_eq!(settings.publisher.address, DEFAULT_PUBLISH_ADDRESS);
        assert_eq!(settings.subscriber.address, DEFAULT_SUBSCRIBE_ADDRESS);
        assert_eq!(settings.channel_config(), ChannelConfig::default());
        assert_eq!(settings.relay_config(), RelayConfig::default());
        assert_eq!(settings.listener_config(), ListenerConfig::default());
    }

    /// Тест проверяет, что нулевые значения отклоняются с именем ключа.
    #[test]
    fn test_zero_values_rejected() {
        let mut settings = Settings::default();
        settings.publisher.queue_capacity = 0;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
        assert!(err.to_string().contains("publisher.queue_capacity"));

        let mut settings = Settings::default();
        settings.subscriber.receive_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.relay.backend_bind = " ".into();
        let err = settings.validate().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
        assert!(err.to_string().contains("relay.backend_bind"));
        assert!(err.to_string().contains("must not be empty"));
    }

    /// Тест проверяет чтение файла: заданные ключи переопределяют значения
    /// по умолчанию, остальные сохраняются.
    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybus.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[relay]
bootstrap = false

[publisher]
address = "10.0.0.5:1112"
queue_capacity = 64
linger_ms = 250

[logging]
level = "debug"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert!(!settings.relay.bootstrap);
        assert_eq!(settings.publisher.address, "10.0.0.5:1112");
        assert_eq!(settings.channel_config().queue_capacity, 64);
        assert_eq!(settings.channel_config().linger, Duration::from_millis(250));
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.subscriber, SubscriberSettings::default());
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/relaybus.toml"))).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
    }

    /// Тест проверяет переопределение через переменные окружения.
    #[test]
    #[serial]
    fn test_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();

        let _env = EnvGuard::set(&[
            ("RELAYBUS_PUBLISHER__QUEUE_CAPACITY", "5"),
            ("RELAYBUS_SUBSCRIBER__ADDRESS", "127.0.0.1:9999"),
        ]);

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.publisher.queue_capacity, 5);
        assert_eq!(settings.subscriber.address, "127.0.0.1:9999");
    }

    #[test]
    #[serial]
    fn test_env_zero_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();

        let _env = EnvGuard::set(&[("RELAYBUS_RELAY__HIGH_WATER_MARK", "0")]);
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("relay.high_water_mark"));
    }
}
