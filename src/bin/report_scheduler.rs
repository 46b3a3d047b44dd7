use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use co2_device::broker::{MessageBroker, MqttBroker, Topics};
use co2_device::config::DeviceConfig;
use co2_device::logging;
use co2_device::runtime::shutdown_signal;
use co2_device::scheduler::{BrokerDispatcher, JsonFileSource, ReportScheduler};

const CLIENT_ID: &str = "report-scheduler";

#[derive(Parser, Debug)]
#[command(author, version, about = "Daily CO2 report scheduler", long_about = None)]
struct Args {
    /// Subscriber list, a JSON array (overrides SUBSCRIBERS_FILE)
    #[arg(long)]
    subscribers: Option<PathBuf>,

    /// MQTT broker host (overrides MQTT_BROKER)
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port (overrides MQTT_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(None)?;

    let subscribers = args
        .subscribers
        .or_else(|| std::env::var("SUBSCRIBERS_FILE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("subscribers.json"));

    let mut config = DeviceConfig::default();
    config.mqtt_broker = args
        .host
        .or_else(|| std::env::var("MQTT_BROKER").ok())
        .unwrap_or(config.mqtt_broker);
    config.mqtt_port = args
        .port
        .or_else(|| std::env::var("MQTT_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(config.mqtt_port);
    info!(subscribers = %subscribers.display(), broker = %config.mqtt_broker, "Report scheduler starting");

    let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
    let (broker, event_loop) =
        MqttBroker::start(&config, CLIENT_ID, Topics::for_service(CLIENT_ID), inbound_tx);
    // Nothing is expected inbound; keep the channel open so the event loop keeps running.
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            debug!(topic = %message.topic, "Ignoring inbound message");
        }
    });

    let source = JsonFileSource::new(subscribers);
    let dispatcher = BrokerDispatcher::new(broker.clone());
    ReportScheduler::new()
        .run(&source, &dispatcher, shutdown_signal())
        .await;

    if let Err(e) = broker.shutdown().await {
        warn!(error = %e, "Broker shutdown incomplete");
    }
    event_loop.abort();
    Ok(())
}
