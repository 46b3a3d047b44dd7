use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Start of the Unix epoch, the date assumed for a device that never committed an update.
pub fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Firmware description served by the update server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FirmwareManifest {
    pub version: String,
    #[serde(default = "epoch_date")]
    pub date: NaiveDate,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub changelog: String,
}

/// On-device mirror of the last committed manifest (`version.json`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocalVersionRecord {
    pub version: String,
    #[serde(default = "epoch_date")]
    pub date: NaiveDate,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for LocalVersionRecord {
    fn default() -> Self {
        LocalVersionRecord {
            version: "0.0.0".to_string(),
            date: epoch_date(),
            hash: String::new(),
            changelog: String::new(),
            updated_at: None,
        }
    }
}

impl LocalVersionRecord {
    pub fn committed(manifest: &FirmwareManifest, at: DateTime<Utc>) -> Self {
        LocalVersionRecord {
            version: manifest.version.clone(),
            date: manifest.date,
            hash: manifest.hash.clone(),
            changelog: manifest.changelog.clone(),
            updated_at: Some(at),
        }
    }
}

/// One accepted sensor sample.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub co2: u16,
    pub temperature: f32,
    pub humidity: f32,
    pub taken_at: DateTime<Utc>,
}

/// Static facts about the device attached to every telemetry message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceMeta {
    pub device_uid: String,
    pub ip: String,
    pub firmware_version: String,
    pub os_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TelemetryPayload {
    pub co2: u16,
    pub temperature: f32,
    pub humidity: f32,
    pub timestamp: DateTime<Utc>,
    pub uptime: u64,
    pub live_mode: bool,
    #[serde(flatten)]
    pub meta: DeviceMeta,
}

impl TelemetryPayload {
    pub fn new(reading: &Reading, meta: &DeviceMeta, uptime: u64, live_mode: bool) -> Self {
        TelemetryPayload {
            co2: reading.co2,
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: reading.taken_at,
            uptime,
            live_mode,
            meta: meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_server_json() {
        let json = r#"{"version":"2.0.1","date":"2025-01-02","hash":"abc","changelog":"fix"}"#;
        let manifest: FirmwareManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.version, "2.0.1");
        assert_eq!(manifest.date, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        assert_eq!(manifest.hash, "abc");
    }

    #[test]
    fn manifest_without_hash_is_accepted() {
        let manifest: FirmwareManifest =
            serde_json::from_str(r#"{"version":"1.0.0","date":"2024-12-01"}"#).unwrap();
        assert!(manifest.hash.is_empty());
        assert!(manifest.changelog.is_empty());
    }

    #[test]
    fn default_record_means_never_updated() {
        let record = LocalVersionRecord::default();
        assert_eq!(record.version, "0.0.0");
        assert_eq!(record.date, epoch_date());
        assert!(record.hash.is_empty());
    }

    #[test]
    fn telemetry_flattens_device_meta() {
        let reading = Reading {
            co2: 612,
            temperature: 22.4,
            humidity: 41.0,
            taken_at: Utc::now(),
        };
        let meta = DeviceMeta {
            device_uid: "rpi_0001".into(),
            ip: "10.0.0.5".into(),
            firmware_version: "2.0.0".into(),
            os_version: "Debian 12".into(),
        };
        let value = serde_json::to_value(TelemetryPayload::new(&reading, &meta, 30, false)).unwrap();
        assert_eq!(value["co2"], 612);
        assert_eq!(value["device_uid"], "rpi_0001");
        assert_eq!(value["uptime"], 30);
        assert!(value.get("meta").is_none());
    }
}
