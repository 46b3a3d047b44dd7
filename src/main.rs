use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use co2_device::broker::{MqttBroker, Topics};
use co2_device::config::{default_install_dir, DeviceConfig, RuntimeTiming, DEFAULT_MAIN_PROGRAM};
use co2_device::display::ConsoleDisplay;
use co2_device::health::{self, HealthCheckPlan, MqttProbe};
use co2_device::logging;
use co2_device::process::RunOutcome;
use co2_device::runtime::{self, DeviceRuntime};
use co2_device::sensor::SensorReader;
use co2_device::simulate::SimulatedSensor;
use co2_device::storage::{InstallLayout, DEVICE_LOG};

#[derive(Parser, Debug)]
#[command(author, version, about = "CO2 monitor device runtime", long_about = None)]
struct Args {
    /// Run the post-update self-check and exit
    #[arg(long)]
    health_check: bool,

    /// Installation directory holding config.json and version.json
    #[arg(long)]
    install_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let install_dir = args
        .install_dir
        .or_else(|| std::env::var("INSTALL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_install_dir);
    let layout = InstallLayout::new(install_dir, DEFAULT_MAIN_PROGRAM);
    if let Err(e) = logging::init(Some(&layout.log_file(DEVICE_LOG))) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    if args.health_check {
        return match run_health_check(&layout).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Health check failed");
                ExitCode::FAILURE
            }
        };
    }

    match run_device(layout).await {
        Ok(outcome) => {
            info!(?outcome, "Device runtime exiting");
            outcome.into()
        }
        Err(e) => {
            error!(error = %e, "Device runtime failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_health_check(layout: &InstallLayout) -> Result<()> {
    let config = DeviceConfig::load(layout)?;
    let device_uid = config.resolve_device_uid(layout)?;
    let mut sensor = SensorReader::new(Box::new(SimulatedSensor::new()));
    let probe = MqttProbe {
        config,
        client_id: format!("{device_uid}-health"),
    };
    health::run(
        &mut sensor,
        &probe,
        &layout.health_marker(),
        &HealthCheckPlan::default(),
    )
    .await
}

async fn run_device(layout: InstallLayout) -> Result<RunOutcome> {
    let config = DeviceConfig::load(&layout)?;
    let device_uid = config.resolve_device_uid(&layout)?;
    info!(device_uid = %device_uid, name = %config.device_name, "Device starting");

    let timing = RuntimeTiming::default();
    let simulated = SimulatedSensor::new()
        .with_sample_period(timing.sample_period)
        .with_warmup(timing.sensor_warmup);
    let mut sensor = SensorReader::new(Box::new(simulated));
    if let Err(e) = sensor.init() {
        error!(error = %e, "Sensor initialization failed, continuing without readings");
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (broker, event_loop) =
        MqttBroker::start(&config, &device_uid, Topics::for_device(&device_uid), inbound_tx);

    let (config_tx, config_rx) = watch::channel(config.clone());
    let persister = runtime::spawn_config_persister(layout.clone(), config_rx);

    let meta = runtime::collect_meta(&device_uid, &layout);
    info!(ip = %meta.ip, firmware = %meta.firmware_version, os = %meta.os_version, "Device info");

    let device = DeviceRuntime::new(
        sensor,
        Box::new(ConsoleDisplay),
        broker,
        meta,
        config,
        config_tx,
    )
    .with_timing(timing);
    let outcome = device.run(inbound_rx).await;

    // The runtime owned the only config sender; the persister drains and stops.
    if let Err(e) = persister.await {
        warn!(error = %e, "Config persister ended abnormally");
    }
    if tokio::time::timeout(Duration::from_secs(2), event_loop).await.is_err() {
        warn!("MQTT event loop did not stop in time");
    }
    Ok(outcome)
}
