use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use relaybus::{
    init_logging,
    network::{TcpSubscriber, TcpTransport},
    ChannelRegistry, Settings, SubscriptionListener,
};
use tracing::{info, warn};

/// Demo: several camera channels published through a local relay and read
/// back by one listener per channel.
#[derive(Debug, Parser)]
#[command(name = "relaybus", version, about)]
struct Args {
    /// Settings file (otherwise `relaybus.toml` or `RELAYBUS_CONFIG`)
    #[arg(short, long, env = "RELAYBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Channel ids, also used as topics
    #[arg(long, value_delimiter = ',', default_value = "cam1,cam2,cam3")]
    channels: Vec<String>,

    /// Delay between publish rounds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Connect to an external relay instead of starting one
    #[arg(long)]
    no_bootstrap: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("load settings")?;
    let logging = init_logging(&settings.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        revision = env!("RELAYBUS_GIT_REVISION"),
        built = env!("RELAYBUS_BUILD_TIME"),
        channels = ?args.channels,
        "Starting relaybus"
    );

    let bootstrap = settings.relay.bootstrap && !args.no_bootstrap;
    let registry = Arc::new(ChannelRegistry::new(
        Arc::new(TcpTransport),
        settings.registry_config(),
    ));
    registry
        .register_channels(&args.channels, bootstrap)
        .context("register channels")?;

    let subscribe_address = match registry.relay() {
        Some(relay) => {
            info!(
                frontend = %relay.frontend_addr(),
                backend = %relay.backend_addr(),
                "Relay running"
            );
            relay.backend_connect_addr().to_string()
        }
        None => settings.subscriber.address.clone(),
    };

    let mut listeners = Vec::with_capacity(args.channels.len());
    for id in &args.channels {
        let channel = id.clone();
        let mut listener = SubscriptionListener::with_config(
            Box::new(TcpSubscriber::new()),
            move |topic: &str, payload: &[u8]| {
                info!(
                    channel = %channel,
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "Received"
                );
            },
            settings.listener_config(),
        )
        .named(format!("listener-{id}"));
        listener.connect(&subscribe_address)?;
        listener.subscribe([id.as_str()])?;
        listener.start_listening()?;
        listeners.push(listener);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut round: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for id in &args.channels {
                    if !registry.publish(id, id, format!("frame {round} from {id}")) {
                        warn!(channel = %id, "Message was not accepted");
                    }
                }
                round += 1;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    info!(rounds = round, "Shutting down");
    tokio::task::spawn_blocking(move || {
        for listener in &mut listeners {
            listener.terminate();
        }
        registry.shutdown();
    })
    .await
    .context("shutdown task")?;

    logging.shutdown();
    Ok(())
}
