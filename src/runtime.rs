//! Device main loop: dual-cadence polling, telemetry, and the command interpreter.
//!
//! All runtime state is owned by [`DeviceRuntime`]. The broker task only forwards raw
//! messages over a channel, so commands and ticks are applied one at a time by the loop.

use chrono::{DateTime, Utc};
use std::fs;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::{MessageBroker, RawInbound, Topics};
use crate::command::{self, Command, Inbound, DEFAULT_CALIBRATION_PPM, MAX_LIVE_MODE_MINUTES};
use crate::config::{ConfigPatch, DeviceConfig, RuntimeTiming};
use crate::display::Display;
use crate::process::RunOutcome;
use crate::sensor::SensorReader;
use crate::storage::{self, InstallLayout};
use crate::types::{DeviceMeta, LocalVersionRecord, Reading, TelemetryPayload};

pub const STARTING_TEXT: &str = "Starting...";
pub const CONNECTING_TEXT: &str = "Connecting...";
pub const CALIBRATING_TEXT: &str = "Calibrating...";

/// Saturates instead of failing; an oversized interval never comes due.
fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn is_due(last: Option<DateTime<Utc>>, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
    last.map_or(true, |last| now - last >= interval)
}

/// Live telemetry window. Expiry is evaluated lazily, nothing needs to fire when it ends.
#[derive(Debug, Default, Clone)]
pub struct LiveModeWindow {
    until: Option<DateTime<Utc>>,
}

impl LiveModeWindow {
    pub fn activate(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.until = Some(
            now.checked_add_signed(span(duration))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }

    pub fn deactivate(&mut self) {
        self.until = None;
    }

    pub fn is_active(&mut self, now: DateTime<Utc>) -> bool {
        match self.until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Live mode expired");
                self.until = None;
                false
            }
            None => false,
        }
    }
}

/// What the loop should do after handling a message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Flow {
    Continue,
    Exit(RunOutcome),
}

pub struct DeviceRuntime {
    sensor: SensorReader,
    display: Box<dyn Display>,
    broker: Arc<dyn MessageBroker>,
    topics: Topics,
    meta: DeviceMeta,
    config: DeviceConfig,
    config_tx: watch::Sender<DeviceConfig>,
    timing: RuntimeTiming,
    started_at: DateTime<Utc>,
    live: LiveModeWindow,
    cached: Option<Reading>,
    last_display: Option<DateTime<Utc>>,
    last_telemetry: Option<DateTime<Utc>>,
    reconnect_after: Option<DateTime<Utc>>,
    showing_error: bool,
    status_hold_until: Option<DateTime<Utc>>,
    in_flight: Vec<JoinHandle<()>>,
}

impl DeviceRuntime {
    pub fn new(
        sensor: SensorReader,
        display: Box<dyn Display>,
        broker: Arc<dyn MessageBroker>,
        meta: DeviceMeta,
        config: DeviceConfig,
        config_tx: watch::Sender<DeviceConfig>,
    ) -> Self {
        DeviceRuntime {
            sensor,
            display,
            broker,
            topics: Topics::for_device(&meta.device_uid),
            meta,
            config,
            config_tx,
            timing: RuntimeTiming::default(),
            started_at: Utc::now(),
            live: LiveModeWindow::default(),
            cached: None,
            last_display: None,
            last_telemetry: None,
            reconnect_after: None,
            showing_error: false,
            status_hold_until: None,
            in_flight: Vec::new(),
        }
    }

    pub fn with_timing(mut self, timing: RuntimeTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_start(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Live interval while live mode lasts, the configured send interval otherwise.
    pub fn effective_telemetry_interval(&mut self, now: DateTime<Utc>) -> Duration {
        if self.live.is_active(now) {
            self.timing.live_interval
        } else {
            Duration::from_secs(self.config.send_interval)
        }
    }

    /// Drives the loop until a command or a signal ends it, then shuts everything down.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<RawInbound>) -> RunOutcome {
        if self.config.display_enabled {
            self.display.show_status(STARTING_TEXT);
            if !self.broker.is_connected() {
                self.display.show_status(CONNECTING_TEXT);
            }
        }

        let mut ticker = tokio::time::interval(self.timing.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                Some(message) = inbound.recv() => {
                    if let Flow::Exit(outcome) = self.handle_inbound(&message, Utc::now()).await {
                        break outcome;
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break RunOutcome::Normal;
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// One loop iteration: a single sensor read shared by both cadences, if either is due.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let live = self.live.is_active(now);
        let holding_status = self.status_hold_until.is_some_and(|until| now < until);
        let display_due = self.config.display_enabled
            && !holding_status
            && is_due(self.last_display, span(self.timing.display_interval), now);
        let telemetry_interval = span(self.effective_telemetry_interval(now));
        let telemetry_due = is_due(self.last_telemetry, telemetry_interval, now);
        if !display_due && !telemetry_due {
            return;
        }

        let reading = self.sensor.read(now);
        if let Some(reading) = reading {
            self.cached = Some(reading);
        }

        if display_due {
            self.last_display = Some(now);
            self.refresh_display(reading, now);
        }
        if telemetry_due {
            self.send_telemetry(reading, now, live);
        }
    }

    fn refresh_display(&mut self, fresh: Option<Reading>, now: DateTime<Utc>) {
        let staleness = span(self.timing.display_staleness);
        let shown = fresh.or_else(|| self.cached.filter(|c| now - c.taken_at <= staleness));
        if let Some(reading) = shown {
            self.display.render(reading.co2, reading.temperature, reading.humidity);
            self.showing_error = false;
            return;
        }
        // Grace period after boot while the sensor skips its first samples.
        if self.cached.is_none() && now - self.started_at <= staleness {
            return;
        }
        if !self.showing_error {
            warn!("No sensor reading within the staleness window");
            self.display.show_error();
            self.showing_error = true;
        }
    }

    fn send_telemetry(&mut self, reading: Option<Reading>, now: DateTime<Utc>, live: bool) {
        let Some(reading) = reading else {
            debug!("No fresh reading, telemetry skipped");
            return;
        };
        if !self.broker.is_connected() {
            if self.reconnect_after.map_or(true, |after| now >= after) {
                warn!("Broker disconnected, requesting reconnect");
                self.broker.request_reconnect();
                self.reconnect_after = Some(now + span(self.timing.reconnect_backoff));
            }
            return;
        }
        self.reconnect_after = None;
        self.publish_telemetry(reading, now, live);
        self.last_telemetry = Some(now);
    }

    /// Hands the payload to a publish task so a slow broker never holds up the loop.
    fn publish_telemetry(&mut self, reading: Reading, now: DateTime<Utc>, live: bool) {
        let uptime = (now - self.started_at).num_seconds().max(0) as u64;
        let payload = TelemetryPayload::new(&reading, &self.meta, uptime, live);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode telemetry");
                return;
            }
        };

        let broker = self.broker.clone();
        let topic = self.topics.telemetry.clone();
        let timeout = self.timing.publish_timeout;
        self.in_flight.retain(|task| !task.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            match tokio::time::timeout(timeout, broker.publish(&topic, bytes, false)).await {
                Ok(Ok(())) => info!(
                    co2 = reading.co2,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    live,
                    "Telemetry sent"
                ),
                Ok(Err(e)) => error!(error = %e, "Telemetry publish failed"),
                Err(_) => error!("Telemetry publish timed out"),
            }
        }));
    }

    /// Waits for publishes still in flight; each one is bounded by the publish timeout.
    pub async fn flush_publishes(&mut self) {
        for task in self.in_flight.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Telemetry publish task failed");
            }
        }
    }

    pub async fn handle_inbound(&mut self, message: &RawInbound, now: DateTime<Utc>) -> Flow {
        match command::decode(&self.topics, &message.topic, &message.payload) {
            Ok(Inbound::Config(patch)) => {
                self.apply_config(&patch);
                Flow::Continue
            }
            Ok(Inbound::Command(command)) => self.apply_command(command, now).await,
            Err(e) => {
                warn!(error = %e, "Ignoring inbound message");
                Flow::Continue
            }
        }
    }

    /// Merges present fields and hands the result to the persister.
    pub fn apply_config(&mut self, patch: &ConfigPatch) {
        let was_enabled = self.config.display_enabled;
        let changed = self.config.merge(patch);
        info!(changed = ?changed, "Config updated");
        if changed.iter().any(|f| *f == "mqtt_broker" || *f == "mqtt_port") {
            info!("Broker address change takes effect after restart");
        }
        if was_enabled && !self.config.display_enabled {
            self.display.clear();
        } else if !was_enabled && self.config.display_enabled {
            self.last_display = None;
            self.showing_error = false;
        }
        self.config_tx.send_replace(self.config.clone());
    }

    pub async fn apply_command(&mut self, command: Command, now: DateTime<Utc>) -> Flow {
        info!(command = ?command, "Command received");
        match command {
            Command::Restart => return Flow::Exit(RunOutcome::Normal),
            Command::ForceUpdate => return Flow::Exit(RunOutcome::ForceUpdate),
            Command::Status => self.publish_status(now),
            Command::LiveMode { duration_minutes } => {
                let duration = match duration_minutes.filter(|m| *m > 0) {
                    Some(requested) => {
                        let minutes = requested.min(MAX_LIVE_MODE_MINUTES);
                        if minutes < requested {
                            warn!(requested, max = MAX_LIVE_MODE_MINUTES, "Clamping live mode duration");
                        }
                        Duration::from_secs(minutes * 60)
                    }
                    None => self.timing.default_live_duration,
                };
                self.live.activate(now, duration);
                info!(duration = ?duration, "Live mode enabled");
            }
            Command::LiveModeOff => {
                self.live.deactivate();
                info!("Live mode disabled");
            }
            Command::DisplayOn => self.apply_config(&ConfigPatch {
                display_enabled: Some(true),
                ..ConfigPatch::default()
            }),
            Command::DisplayOff => self.apply_config(&ConfigPatch {
                display_enabled: Some(false),
                ..ConfigPatch::default()
            }),
            Command::Calibrate { target_co2 } => {
                self.calibrate(target_co2.unwrap_or(DEFAULT_CALIBRATION_PPM), now).await
            }
        }
        Flow::Continue
    }

    /// Publishes a new sample, or the one measured in the current sample period if the
    /// sensor has nothing newer yet.
    fn publish_status(&mut self, now: DateTime<Utc>) {
        let period = span(self.timing.sample_period);
        let Some(reading) = self
            .sensor
            .read(now)
            .or_else(|| self.sensor.current_sample(now, period))
        else {
            warn!("Status requested but no fresh reading available");
            return;
        };
        self.cached = Some(reading);
        if !self.broker.is_connected() {
            warn!("Status requested while broker disconnected");
            self.broker.request_reconnect();
            return;
        }
        let live = self.live.is_active(now);
        self.publish_telemetry(reading, now, live);
        self.last_telemetry = Some(now);
    }

    /// Forced recalibration. Periodic measurement is restarted on every path.
    async fn calibrate(&mut self, target_ppm: u16, now: DateTime<Utc>) {
        info!(target_ppm, "Starting forced recalibration");
        let show = self.config.display_enabled;
        if show {
            self.display.show_status(CALIBRATING_TEXT);
        }

        match self.sensor.stop_periodic() {
            Ok(()) => {
                tokio::time::sleep(self.timing.calibration_settle).await;
                match self.sensor.forced_recalibration(target_ppm) {
                    Ok(correction) => {
                        info!(target_ppm, correction, "Forced recalibration applied");
                        if show {
                            self.display.show_status(&format!("FRC: {correction:+} ppm"));
                        }
                    }
                    Err(e) => error!(error = %e, "Forced recalibration failed"),
                }
            }
            Err(e) => error!(error = %e, "Calibration aborted"),
        }

        if let Err(e) = self.sensor.start_periodic() {
            error!(error = %e, "Failed to restart periodic measurement");
        }
        let resumed = now + span(self.timing.calibration_settle);
        self.sensor.distrust_until(resumed + span(self.timing.sensor_warmup));
        self.status_hold_until = Some(resumed + span(self.timing.calibration_banner));
        self.last_display = None;
    }

    /// Publishes "offline", stops the sensor and blanks the panel.
    pub async fn shutdown(&mut self) {
        info!("Shutting down device runtime");
        self.flush_publishes().await;
        if let Err(e) = self.broker.shutdown().await {
            warn!(error = %e, "Broker shutdown incomplete");
        }
        self.sensor.shutdown();
        self.display.clear();
    }
}

/// Writes every config the runtime publishes; failures are logged and the next change retried.
pub fn spawn_config_persister(
    layout: InstallLayout,
    mut updates: watch::Receiver<DeviceConfig>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let config = updates.borrow_and_update().clone();
            match config.save(&layout) {
                Ok(()) => debug!("Config saved"),
                Err(e) => warn!(error = %e, "Failed to persist config"),
            }
        }
    })
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Static device facts attached to telemetry.
pub fn collect_meta(device_uid: &str, layout: &InstallLayout) -> DeviceMeta {
    DeviceMeta {
        device_uid: device_uid.to_string(),
        ip: local_ip().unwrap_or_else(|| "unknown".to_string()),
        firmware_version: firmware_version(layout),
        os_version: os_version(),
    }
}

/// Address of the interface that routes outward; no packet is sent.
pub fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

pub fn firmware_version(layout: &InstallLayout) -> String {
    match storage::read_json::<LocalVersionRecord>(&layout.version()) {
        Ok(Some(record)) => record.version,
        _ => "unknown".to_string(),
    }
}

pub fn os_version() -> String {
    if let Ok(release) = fs::read_to_string("/etc/os-release") {
        if let Some(name) = parse_pretty_name(&release) {
            return name;
        }
    }
    let kernel = |key: &str| {
        fs::read_to_string(format!("/proc/sys/kernel/{key}"))
            .ok()
            .map(|s| s.trim().to_string())
    };
    match (kernel("ostype"), kernel("osrelease")) {
        (Some(name), Some(release)) => format!("{name} {release}"),
        _ => std::env::consts::OS.to_string(),
    }
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
