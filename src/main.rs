//! MQTT Messenger - Main Entry Point
//!
//! Command-line front end for publishing, subscribing and inspecting build
//! information.

use clap::{Parser, Subcommand};
use mqtt_messenger::config::{LogArgs, LogSettings, MqttArgs};
use mqtt_messenger::lifecycle_span;
use mqtt_messenger::observability::{init_logging, LevelWatcher};
use mqtt_messenger::version::{self, BuildInfo};
use mqtt_messenger::{
    new_persistent_session, ClientConfig, ConfigError, Message, MessengerConfig, Messenger,
    Publisher, QoS, SessionClient, SessionSettings, Subscriber, SubscriptionFilters,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Instrument};

/// Publish and subscribe over a persistent MQTT session
#[derive(Parser)]
#[command(name = "mqtt-messenger")]
#[command(about = "Publish and subscribe over a persistent MQTT session")]
#[command(version)]
struct Cli {
    /// TOML configuration file; replaces the MQTT and log flags when given
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Client identifier; a random one is generated when empty
    #[arg(long = "client-id", env = "MQTT_CLIENT_ID", default_value = "")]
    client_id: String,

    #[command(flatten)]
    will: WillArgs,

    #[command(flatten)]
    mqtt: MqttArgs,

    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct WillArgs {
    /// Last-will topic; no will is registered when empty
    #[arg(long = "will.topic", env = "MQTT_WILL_TOPIC", default_value = "")]
    topic: String,

    /// Last-will payload
    #[arg(long = "will.message", env = "MQTT_WILL_MESSAGE", default_value = "")]
    message: String,

    /// Last-will QoS (0, 1 or 2)
    #[arg(long = "will.qos", env = "MQTT_WILL_QOS", default_value = "0", value_parser = parse_qos)]
    qos: QoS,

    /// Retain the last-will message
    #[arg(long = "will.retain", env = "MQTT_WILL_RETAIN")]
    retain: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message and wait for its acknowledgement
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "1", value_parser = parse_qos)]
        qos: QoS,
        #[arg(long)]
        retain: bool,
    },
    /// Print messages matching the filters until interrupted
    Subscribe {
        #[arg(long = "filter", required = true)]
        filters: Vec<String>,
        #[arg(long, default_value = "1", value_parser = parse_qos)]
        qos: QoS,
    },
    /// Print build information
    Version {
        /// Include build environment details
        #[arg(long)]
        full: bool,
    },
    /// Serve build information over HTTP at /version
    ServeVersion {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
    },
}

fn parse_qos(s: &str) -> Result<QoS, String> {
    let value: u8 = s
        .parse()
        .map_err(|_| format!("QoS must be 0, 1 or 2, got '{s}'"))?;
    QoS::try_from(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::Version { full } = cli.command {
        let info = BuildInfo::current();
        if full {
            println!("{}", info.full_report());
        } else {
            println!("{}", info.summary());
        }
        return;
    }

    let (settings, log_settings) = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let level = match init_logging(&log_settings) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };
    let watcher = match LevelWatcher::spawn(level) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Runtime log level toggling unavailable");
            None
        }
    };

    info!("Starting mqtt-messenger v{}", env!("CARGO_PKG_VERSION"));

    let client_config = build_client_config(&cli);
    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => {
            run_publish(client_config, &settings, &topic, &message, qos, retain)
                .instrument(lifecycle_span!(command = "publish"))
                .await
        }
        Commands::Subscribe { filters, qos } => {
            run_subscribe(client_config, &settings, filters, qos)
                .instrument(lifecycle_span!(command = "subscribe"))
                .await
        }
        Commands::ServeVersion { listen } => run_serve_version(listen)
            .instrument(lifecycle_span!(command = "serve-version"))
            .await,
        Commands::Version { .. } => Ok(()),
    };

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_settings(cli: &Cli) -> Result<(SessionSettings, LogSettings), ConfigError> {
    match &cli.config {
        Some(path) => {
            let config = MessengerConfig::load_from_file(path)?;
            Ok((config.mqtt, config.log))
        }
        None => Ok((cli.mqtt.clone().into(), cli.log.clone().into())),
    }
}

fn build_client_config(cli: &Cli) -> ClientConfig {
    ClientConfig::new(cli.client_id.clone())
        .with_will(
            cli.will.topic.clone(),
            cli.will.message.clone(),
            cli.will.qos,
            cli.will.retain,
        )
        .on_connect(|| info!("Connected to MQTT broker"))
        .on_connection_lost(|e| warn!(error = %e, "Lost connection to MQTT broker"))
}

async fn run_publish(
    config: ClientConfig,
    settings: &SessionSettings,
    topic: &str,
    message: &str,
    qos: QoS,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Arc::new(new_persistent_session(config, settings)?);
    session.connect().await?;

    let messenger = Messenger::new(session.clone());
    let result = messenger
        .publish(topic, message.as_bytes(), qos, retain)
        .await;

    session.disconnect().await?;
    result?;
    info!(topic, qos = %qos, "Message published");
    Ok(())
}

async fn run_subscribe(
    config: ClientConfig,
    settings: &SessionSettings,
    filters: Vec<String>,
    qos: QoS,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Arc::new(new_persistent_session(config, settings)?);
    let messenger = Messenger::new(session.clone());

    let filters: SubscriptionFilters = filters.into_iter().map(|filter| (filter, qos)).collect();
    messenger.subscribe_multiple(
        filters,
        Arc::new(|message: Message| {
            println!(
                "{} {}",
                message.topic(),
                String::from_utf8_lossy(message.payload())
            );
        }),
    );

    session.connect().await?;
    info!("Waiting for messages, press Ctrl-C to stop");
    signal::ctrl_c().await?;

    info!("Interrupt received, disconnecting");
    session.disconnect().await?;
    Ok(())
}

async fn run_serve_version(listen: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    version::serve(listen, async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    })
    .await?;
    Ok(())
}
