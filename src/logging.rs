use anyhow::Result;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::storage;

const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Installs the global subscriber: stdout plus an append-only on-device log file.
///
/// The file layer writes synchronously so a line is on disk before the process exits.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rumqttc=warn"));

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let stdout_layer = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            storage::roll_log(path, MAX_LOG_BYTES)?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()?;
    Ok(())
}
