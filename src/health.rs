//! Self-check mode: proves a freshly installed build can reach its sensor and broker.
//!
//! The marker file is written only after every step succeeded; the loader treats its
//! absence as failure.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::broker;
use crate::config::DeviceConfig;
use crate::sensor::SensorReader;
use crate::storage;

#[derive(Debug, Clone)]
pub struct HealthCheckPlan {
    /// Enough attempts to cover the sensor's skipped warm-up readings.
    pub read_attempts: u32,
    pub read_interval: Duration,
    pub broker_timeout: Duration,
}

impl Default for HealthCheckPlan {
    fn default() -> Self {
        HealthCheckPlan {
            read_attempts: 5,
            read_interval: Duration::from_secs(5),
            broker_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn wait_connected(&self, timeout: Duration) -> Result<()>;
}

pub struct MqttProbe {
    pub config: DeviceConfig,
    pub client_id: String,
}

#[async_trait]
impl ConnectivityProbe for MqttProbe {
    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        broker::probe_connection(&self.config, &self.client_id, timeout).await
    }
}

pub async fn run(
    sensor: &mut SensorReader,
    probe: &dyn ConnectivityProbe,
    marker: &Path,
    plan: &HealthCheckPlan,
) -> Result<()> {
    info!("Running health check");
    storage::remove_if_exists(marker)?;

    if let Err(e) = sensor.init() {
        error!(error = %e, "Health check FAILED: sensor init failed");
        bail!("sensor init failed: {e}");
    }

    let mut reading = None;
    for attempt in 1..=plan.read_attempts {
        tokio::time::sleep(plan.read_interval).await;
        reading = sensor.read(Utc::now());
        if reading.is_some() {
            break;
        }
        warn!(attempt, attempts = plan.read_attempts, "Health check: waiting for sensor");
    }
    let Some(reading) = reading else {
        error!(attempts = plan.read_attempts, "Health check FAILED: no sensor reading");
        return Err(anyhow!("no sensor reading after {} attempts", plan.read_attempts));
    };
    info!(co2 = reading.co2, "Health check: sensor OK");

    if let Err(e) = probe.wait_connected(plan.broker_timeout).await {
        error!(error = %e, "Health check FAILED: broker unreachable");
        return Err(e);
    }
    info!("Health check: broker OK");

    storage::write_atomic(marker, Utc::now().to_rfc3339().as_bytes())?;
    info!("Health check PASSED");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::fake::{sample, FakeSensor};
    use crate::storage::test_support::TestDir;

    struct StubProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for StubProbe {
        async fn wait_connected(&self, _timeout: Duration) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(anyhow!("connection refused"))
            }
        }
    }

    fn quick_plan() -> HealthCheckPlan {
        HealthCheckPlan {
            read_attempts: 5,
            read_interval: Duration::from_millis(1),
            broker_timeout: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn healthy_device_writes_marker_after_skipped_readings() {
        let dir = TestDir::new();
        let marker = dir.path().join(".health_ok");
        let mut reader = SensorReader::new(Box::new(FakeSensor::steady(sample(550.0))));
        run(&mut reader, &StubProbe(true), &marker, &quick_plan()).await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn sensor_init_failure_leaves_no_marker() {
        let dir = TestDir::new();
        let marker = dir.path().join(".health_ok");
        let mut sensor = FakeSensor::steady(sample(550.0));
        sensor.fail_init = true;
        let mut reader = SensorReader::new(Box::new(sensor));
        assert!(run(&mut reader, &StubProbe(true), &marker, &quick_plan()).await.is_err());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn silent_sensor_fails_after_bounded_attempts() {
        let dir = TestDir::new();
        let marker = dir.path().join(".health_ok");
        let mut sensor = FakeSensor::steady(sample(550.0));
        sensor.fallback = None;
        let reads = sensor.reads.clone();
        let mut reader = SensorReader::new(Box::new(sensor));
        assert!(run(&mut reader, &StubProbe(true), &marker, &quick_plan()).await.is_err());
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_and_clears_stale_marker() {
        let dir = TestDir::new();
        let marker = dir.path().join(".health_ok");
        std::fs::write(&marker, "left over").unwrap();
        let mut reader = SensorReader::new(Box::new(FakeSensor::steady(sample(550.0))));
        assert!(run(&mut reader, &StubProbe(false), &marker, &quick_plan()).await.is_err());
        assert!(!marker.exists());
    }
}
