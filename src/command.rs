use serde::Deserialize;

use crate::broker::Topics;
use crate::config::ConfigPatch;
use crate::error::PayloadError;

pub const DEFAULT_LIVE_MODE_MINUTES: u64 = 5;
/// Longest live mode window a single command can request.
pub const MAX_LIVE_MODE_MINUTES: u64 = 24 * 60;
/// Fresh outdoor air.
pub const DEFAULT_CALIBRATION_PPM: u16 = 420;

/// Commands accepted on `devices/<uid>/commands`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Restart,
    ForceUpdate,
    Status,
    LiveMode {
        #[serde(default, alias = "duration")]
        duration_minutes: Option<u64>,
    },
    LiveModeOff,
    DisplayOn,
    DisplayOff,
    Calibrate {
        #[serde(default)]
        target_co2: Option<u16>,
    },
}

/// A decoded broker message addressed to this device.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Config(ConfigPatch),
    Command(Command),
}

/// Maps a raw publish onto a typed message; unknown commands fail here and nowhere else.
pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Inbound, PayloadError> {
    let invalid = |source| PayloadError::Invalid {
        topic: topic.to_string(),
        source,
    };
    if topic == topics.config {
        serde_json::from_slice(payload).map(Inbound::Config).map_err(invalid)
    } else if topic == topics.commands {
        serde_json::from_slice(payload).map(Inbound::Command).map_err(invalid)
    } else {
        Err(PayloadError::UnknownTopic(topic.to_string()))
    }
}
