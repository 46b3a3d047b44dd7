use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::DEFAULT_LIVE_MODE_MINUTES;
use crate::storage::{self, InstallLayout};

pub const DEFAULT_MAIN_PROGRAM: &str = "co2-device";

/// Upper bound for `send_interval`; larger values are clamped.
pub const MAX_SEND_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Exit code the runtime uses to ask the loader for a fresh update check.
pub const FORCE_UPDATE_EXIT_CODE: i32 = 100;

/// Runtime configuration persisted as `config.json`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    /// Telemetry interval in seconds outside live mode.
    pub send_interval: u64,
    pub display_enabled: bool,
    pub device_uid: String,
    pub device_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            send_interval: 60,
            display_enabled: true,
            device_uid: String::new(),
            device_name: "CO2 Monitor".to_string(),
        }
    }
}

/// Fields a broker config push may carry; absent fields are left untouched.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ConfigPatch {
    pub send_interval: Option<u64>,
    pub display_enabled: Option<bool>,
    pub mqtt_broker: Option<String>,
    pub mqtt_port: Option<u16>,
    pub device_name: Option<String>,
}

impl DeviceConfig {
    /// `config.json` over the defaults, then environment overrides.
    pub fn load(layout: &InstallLayout) -> Result<Self> {
        let mut config = match storage::read_json::<DeviceConfig>(&layout.config()) {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::default(),
            Err(e) => {
                warn!(error = %e, "Could not load config file, using defaults");
                DeviceConfig::default()
            }
        };

        if let Ok(broker) = env::var("MQTT_BROKER") {
            config.mqtt_broker = broker;
        }
        config.mqtt_port = get_env_var_u64("MQTT_PORT", config.mqtt_port.into())
            .try_into()
            .unwrap_or(config.mqtt_port);
        config.send_interval = get_env_var_u64("SEND_INTERVAL", config.send_interval);
        if config.send_interval > MAX_SEND_INTERVAL_SECS {
            warn!(send_interval = config.send_interval, max = MAX_SEND_INTERVAL_SECS, "Clamping send_interval");
            config.send_interval = MAX_SEND_INTERVAL_SECS;
        }
        if let Ok(uid) = env::var("DEVICE_UID") {
            config.device_uid = uid;
        }
        Ok(config)
    }

    /// Full rewrite of `config.json` through a temp file.
    pub fn save(&self, layout: &InstallLayout) -> Result<()> {
        storage::write_json_atomic(&layout.config(), self)
    }

    /// Applies the fields present in `patch`, returning the names of fields that changed.
    pub fn merge(&mut self, patch: &ConfigPatch) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if let Some(requested) = patch.send_interval {
            let interval = requested.min(MAX_SEND_INTERVAL_SECS);
            if interval < requested {
                warn!(requested, max = MAX_SEND_INTERVAL_SECS, "Clamping send_interval");
            }
            if interval == 0 {
                warn!("Ignoring send_interval of 0 seconds");
            } else if interval != self.send_interval {
                self.send_interval = interval;
                changed.push("send_interval");
            }
        }
        if let Some(enabled) = patch.display_enabled {
            if enabled != self.display_enabled {
                self.display_enabled = enabled;
                changed.push("display_enabled");
            }
        }
        if let Some(broker) = &patch.mqtt_broker {
            if *broker != self.mqtt_broker {
                self.mqtt_broker = broker.clone();
                changed.push("mqtt_broker");
            }
        }
        if let Some(port) = patch.mqtt_port {
            if port != self.mqtt_port {
                self.mqtt_port = port;
                changed.push("mqtt_port");
            }
        }
        if let Some(name) = &patch.device_name {
            if *name != self.device_name {
                self.device_name = name.clone();
                changed.push("device_name");
            }
        }
        changed
    }

    /// Config value first, then the `.device_uid` file, else a fresh id persisted to that file.
    pub fn resolve_device_uid(&self, layout: &InstallLayout) -> Result<String> {
        if !self.device_uid.is_empty() {
            return Ok(self.device_uid.clone());
        }
        let uid_file = layout.device_uid();
        if let Ok(existing) = fs::read_to_string(&uid_file) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }
        let generated = format!("rpi_{}", &Uuid::new_v4().simple().to_string()[..12]);
        storage::write_atomic(&uid_file, generated.as_bytes())?;
        info!(device_uid = %generated, "Generated device uid");
        Ok(generated)
    }
}

/// Design defaults of the device runtime loop.
#[derive(Debug, Clone)]
pub struct RuntimeTiming {
    pub tick: Duration,
    /// Sensor measurement period; a sample stays current until the next one is due.
    pub sample_period: Duration,
    pub display_interval: Duration,
    pub live_interval: Duration,
    pub display_staleness: Duration,
    pub default_live_duration: Duration,
    pub reconnect_backoff: Duration,
    pub publish_timeout: Duration,
    pub calibration_settle: Duration,
    pub calibration_banner: Duration,
    pub sensor_warmup: Duration,
}

impl Default for RuntimeTiming {
    fn default() -> Self {
        RuntimeTiming {
            tick: Duration::from_millis(500),
            sample_period: Duration::from_secs(5),
            display_interval: Duration::from_secs(5),
            live_interval: Duration::from_secs(5),
            display_staleness: Duration::from_secs(15),
            default_live_duration: Duration::from_secs(DEFAULT_LIVE_MODE_MINUTES * 60),
            reconnect_backoff: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            calibration_settle: Duration::from_millis(500),
            calibration_banner: Duration::from_secs(3),
            sensor_warmup: Duration::from_secs(5),
        }
    }
}

/// Bootstrap loader settings.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub server_url: String,
    pub install_dir: PathBuf,
    pub main_program: String,
    pub health_check_timeout: Duration,
    pub health_poll_interval: Duration,
    pub download_retries: u32,
    pub retry_delay: Duration,
    pub crash_cooldown: Duration,
    pub install_command: Option<String>,
    pub install_timeout: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        LoaderSettings {
            server_url: "http://localhost:8000/api/device".to_string(),
            install_dir: default_install_dir(),
            main_program: DEFAULT_MAIN_PROGRAM.to_string(),
            health_check_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(1),
            download_retries: 3,
            retry_delay: Duration::from_secs(5),
            crash_cooldown: Duration::from_secs(30),
            install_command: None,
            install_timeout: Duration::from_secs(300),
        }
    }
}

impl LoaderSettings {
    pub fn from_env() -> Self {
        let defaults = LoaderSettings::default();
        LoaderSettings {
            server_url: env::var("UPDATE_SERVER_URL").unwrap_or(defaults.server_url),
            install_dir: env::var("INSTALL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.install_dir),
            main_program: env::var("MAIN_PROGRAM").unwrap_or(defaults.main_program),
            health_check_timeout: Duration::from_secs(get_env_var_u64(
                "HEALTH_CHECK_TIMEOUT_SECS",
                defaults.health_check_timeout.as_secs(),
            )),
            health_poll_interval: defaults.health_poll_interval,
            download_retries: get_env_var_u64("DOWNLOAD_RETRIES", defaults.download_retries.into())
                .max(1) as u32,
            retry_delay: Duration::from_secs(get_env_var_u64(
                "RETRY_DELAY_SECS",
                defaults.retry_delay.as_secs(),
            )),
            crash_cooldown: Duration::from_secs(get_env_var_u64(
                "CRASH_COOLDOWN_SECS",
                defaults.crash_cooldown.as_secs(),
            )),
            install_command: env::var("INSTALL_COMMAND").ok().filter(|c| !c.trim().is_empty()),
            install_timeout: defaults.install_timeout,
        }
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(&self.install_dir, &self.main_program)
    }
}

pub fn default_install_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("co2-monitor")
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::TestDir;

    #[test]
    fn merge_touches_only_present_fields() {
        let mut config = DeviceConfig::default();
        let patch: ConfigPatch = serde_json::from_str(r#"{"send_interval": 120}"#).unwrap();
        let changed = config.merge(&patch);
        assert_eq!(changed, vec!["send_interval"]);
        assert_eq!(config.send_interval, 120);
        assert!(config.display_enabled);
        assert_eq!(config.mqtt_broker, "localhost");
    }

    #[test]
    fn merge_rejects_zero_interval() {
        let mut config = DeviceConfig::default();
        let changed = config.merge(&ConfigPatch {
            send_interval: Some(0),
            ..ConfigPatch::default()
        });
        assert!(changed.is_empty());
        assert_eq!(config.send_interval, 60);
    }

    #[test]
    fn merge_clamps_oversized_interval() {
        let mut config = DeviceConfig::default();
        let changed = config.merge(&ConfigPatch {
            send_interval: Some(u64::MAX),
            ..ConfigPatch::default()
        });
        assert_eq!(changed, vec!["send_interval"]);
        assert_eq!(config.send_interval, MAX_SEND_INTERVAL_SECS);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let config: DeviceConfig = serde_json::from_str(r#"{"send_interval": 30}"#).unwrap();
        assert_eq!(config.send_interval, 30);
        assert_eq!(config.mqtt_port, 1883);
        assert!(config.display_enabled);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = TestDir::new();
        let layout = InstallLayout::new(dir.path(), DEFAULT_MAIN_PROGRAM);
        let mut config = DeviceConfig::default();
        config.display_enabled = false;
        config.device_uid = "rpi_test".into();
        config.save(&layout).unwrap();
        let on_disk: DeviceConfig = storage::read_json(&layout.config()).unwrap().unwrap();
        assert_eq!(on_disk, config);
    }

    #[test]
    fn device_uid_is_generated_once_and_reused() {
        let dir = TestDir::new();
        let layout = InstallLayout::new(dir.path(), DEFAULT_MAIN_PROGRAM);
        let config = DeviceConfig::default();
        let first = config.resolve_device_uid(&layout).unwrap();
        let second = config.resolve_device_uid(&layout).unwrap();
        assert!(first.starts_with("rpi_"));
        assert_eq!(first.len(), 16);
        assert_eq!(first, second);
    }
}
