//! Sensor capability and the read boundary that turns driver output into trusted readings.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::SensorError;
use crate::types::Reading;

/// Raw sample as reported by the driver, before validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub co2: f32,
    pub temperature: f32,
    pub humidity: f32,
}

/// Vendor driver seam for an SCD4x-class CO2 sensor.
pub trait Sensor: Send {
    fn init(&mut self) -> Result<(), SensorError>;
    /// `Ok(None)` when no new sample is ready yet.
    fn read_raw(&mut self) -> Result<Option<RawSample>, SensorError>;
    fn start_periodic_measurement(&mut self) -> Result<(), SensorError>;
    fn stop_periodic_measurement(&mut self) -> Result<(), SensorError>;
    /// Tells the sensor the true CO2 level right now; returns the applied correction in ppm.
    fn forced_recalibration(&mut self, target_ppm: u16) -> Result<i16, SensorError>;
}

const READINGS_TO_SKIP: u8 = 2;
const CO2_RANGE: (f32, f32) = (300.0, 10_000.0);
const TEMPERATURE_RANGE: (f32, f32) = (-10.0, 50.0);
const HUMIDITY_RANGE: (f32, f32) = (0.0, 100.0);
const MAX_CO2_JUMP: f32 = 500.0;
const MAX_TEMPERATURE_JUMP: f32 = 3.0;

/// Wraps a driver: skips warm-up samples, rejects implausible values and swallows driver errors.
pub struct SensorReader {
    sensor: Box<dyn Sensor>,
    initialized: bool,
    to_skip: u8,
    last_valid: Option<Reading>,
    untrusted_until: Option<DateTime<Utc>>,
}

impl SensorReader {
    pub fn new(sensor: Box<dyn Sensor>) -> Self {
        SensorReader {
            sensor,
            initialized: false,
            to_skip: READINGS_TO_SKIP,
            last_valid: None,
            untrusted_until: None,
        }
    }

    pub fn init(&mut self) -> Result<(), SensorError> {
        self.sensor.init()?;
        self.initialized = true;
        self.to_skip = READINGS_TO_SKIP;
        Ok(())
    }

    /// A fresh, validated reading or `None`. Never returns an older reading.
    pub fn read(&mut self, now: DateTime<Utc>) -> Option<Reading> {
        if !self.initialized {
            return None;
        }
        if let Some(until) = self.untrusted_until {
            if now < until {
                return None;
            }
            self.untrusted_until = None;
        }

        let sample = match self.sensor.read_raw() {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                debug!("Sensor data not ready");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Sensor read failed");
                return None;
            }
        };

        if self.to_skip > 0 {
            self.to_skip -= 1;
            debug!(remaining = self.to_skip, "Skipping initial sensor reading");
            return None;
        }

        if !self.is_plausible(&sample) {
            warn!(
                co2 = sample.co2,
                temperature = sample.temperature,
                humidity = sample.humidity,
                "Rejected implausible reading"
            );
            return None;
        }

        let reading = Reading {
            co2: sample.co2.round() as u16,
            temperature: round1(sample.temperature),
            humidity: round1(sample.humidity),
            taken_at: now,
        };
        self.last_valid = Some(reading);
        Some(reading)
    }

    /// The last validated sample if it is younger than `period`, i.e. the sensor has not
    /// measured anything newer since.
    pub fn current_sample(&self, now: DateTime<Utc>, period: chrono::Duration) -> Option<Reading> {
        self.last_valid
            .filter(|reading| now >= reading.taken_at && now - reading.taken_at < period)
    }

    fn is_plausible(&self, sample: &RawSample) -> bool {
        let in_range = |v: f32, (lo, hi): (f32, f32)| v.is_finite() && v >= lo && v <= hi;
        if !in_range(sample.co2, CO2_RANGE)
            || !in_range(sample.temperature, TEMPERATURE_RANGE)
            || !in_range(sample.humidity, HUMIDITY_RANGE)
        {
            return false;
        }
        if let Some(last) = &self.last_valid {
            if (sample.co2 - f32::from(last.co2)).abs() > MAX_CO2_JUMP {
                return false;
            }
            if (sample.temperature - last.temperature).abs() > MAX_TEMPERATURE_JUMP {
                return false;
            }
        }
        true
    }

    pub fn stop_periodic(&mut self) -> Result<(), SensorError> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }
        self.sensor.stop_periodic_measurement()
    }

    pub fn start_periodic(&mut self) -> Result<(), SensorError> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }
        self.sensor.start_periodic_measurement()
    }

    pub fn forced_recalibration(&mut self, target_ppm: u16) -> Result<i16, SensorError> {
        if !self.initialized {
            return Err(SensorError::NotInitialized);
        }
        self.sensor.forced_recalibration(target_ppm)
    }

    /// Readings are discarded until `until`; the jump filter restarts from scratch.
    pub fn distrust_until(&mut self, until: DateTime<Utc>) {
        self.untrusted_until = Some(until);
        self.last_valid = None;
    }

    /// Best-effort stop used on shutdown.
    pub fn shutdown(&mut self) {
        if self.initialized {
            if let Err(e) = self.sensor.stop_periodic_measurement() {
                warn!(error = %e, "Failed to stop sensor");
            }
        }
    }
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    pub type Script = Result<Option<RawSample>, SensorError>;

    /// Scripted driver; once the script runs out it repeats `fallback`.
    pub struct FakeSensor {
        pub script: VecDeque<Script>,
        pub fallback: Option<RawSample>,
        pub reads: Arc<AtomicUsize>,
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail_init: bool,
    }

    impl FakeSensor {
        pub fn steady(sample: RawSample) -> Self {
            FakeSensor {
                script: VecDeque::new(),
                fallback: Some(sample),
                reads: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_init: false,
            }
        }
    }

    pub fn sample(co2: f32) -> RawSample {
        RawSample {
            co2,
            temperature: 22.0,
            humidity: 45.0,
        }
    }

    impl Sensor for FakeSensor {
        fn init(&mut self) -> Result<(), SensorError> {
            self.calls.lock().unwrap().push("init".into());
            if self.fail_init {
                return Err(SensorError::Driver("no i2c device".into()));
            }
            Ok(())
        }

        fn read_raw(&mut self) -> Result<Option<RawSample>, SensorError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.script.pop_front().unwrap_or(Ok(self.fallback))
        }

        fn start_periodic_measurement(&mut self) -> Result<(), SensorError> {
            self.calls.lock().unwrap().push("start".into());
            Ok(())
        }

        fn stop_periodic_measurement(&mut self) -> Result<(), SensorError> {
            self.calls.lock().unwrap().push("stop".into());
            Ok(())
        }

        fn forced_recalibration(&mut self, target_ppm: u16) -> Result<i16, SensorError> {
            self.calls.lock().unwrap().push(format!("frc:{target_ppm}"));
            Ok(-12)
        }
    }
}
