//! CLI for mqtt-engine
//!
//! Subcommands:
//! - `subscribe`: subscribe to one or more filters and log what arrives until Ctrl-C
//! - `publish`: publish one message and exit
//!
//! The broker endpoint and client options come from configuration
//! (`config/default.*` or `--config`, then `MQTT_ENGINE_*` variables).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mqtt_engine::config::{load_config, load_config_from};
use mqtt_engine::utils::logging;
use mqtt_engine::{LoggingCallbacks, MqttClient, QoS, Settings};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqtt-engine", version, about = "MQTT 3.1.1 client")]
struct Cli {
    /// Configuration file to load instead of `config/default`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe and log incoming messages until Ctrl-C
    Subscribe {
        /// Topic filter, may be given several times
        #[arg(long = "topic", required = true)]
        topics: Vec<String>,
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
    /// Publish a single message
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let settings = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Command::Subscribe { topics, qos } => run_subscribe(settings, topics, qos).await,
        Command::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(settings, &topic, message, qos, retain).await,
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_subscribe(
    settings: Settings,
    topics: Vec<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let client = MqttClient::new(settings, LoggingCallbacks);
    client.connect().await?;

    let filters: Vec<(&str, QoS)> = topics.iter().map(|t| (t.as_str(), qos)).collect();
    let granted = client
        .subscribe_many(&filters, |msg| {
            info!("{} => {}", msg.topic, String::from_utf8_lossy(&msg.payload));
        })
        .await?;
    for ((filter, _), code) in filters.iter().zip(&granted) {
        match code {
            Some(qos) => info!("Subscribed to '{}' with QoS {}", filter, *qos as u8),
            None => error!("Broker rejected subscription to '{}'", filter),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Disconnecting.");
    client.disconnect().await?;
    Ok(())
}

async fn run_publish(
    settings: Settings,
    topic: &str,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let client = MqttClient::new(settings, LoggingCallbacks);
    client.connect().await?;

    let published = client.publish(topic, message, qos, retain).await;
    client.disconnect().await?;
    published?;
    info!("Published to '{}'", topic);
    Ok(())
}
