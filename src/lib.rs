/// Process settings: defaults, `relaybus.toml`, `RELAYBUS_*` environment.
pub mod config;
/// Logging on top of `tracing` (formats, filters, sinks).
pub mod logging;
/// Transports, wire frames and the forwarding relay.
pub mod network;
/// Pub/Sub pipeline: queue, channels, registry, listeners.
pub mod pubsub;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Settings.
pub use config::Settings;
/// Logging entry point.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Transports and relay.
pub use network::{
    MemoryHub, Publisher, Relay, RelayConfig, Subscriber, TcpTransport, Transport,
};
/// Pub/Sub API.
pub use pubsub::{
    BoundedQueue, Channel, ChannelConfig, ChannelRegistry, ListenerConfig, Message,
    RegistryConfig, SubscriptionListener,
};
/// Errors.
pub use relaybus_error::{RelayResult, StackError, StatusCode};
