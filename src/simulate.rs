use rand::Rng;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::SensorError;
use crate::sensor::{RawSample, Sensor};

// Matches the SCD4x periodic measurement rate.
const SAMPLE_PERIOD: Duration = Duration::from_secs(5);

/// Stand-in for the SCD41 on hosts without an I2C bus: a slow random walk
/// that only produces a sample once per measurement period.
pub struct SimulatedSensor {
    co2: f32,
    temperature: f32,
    humidity: f32,
    running: bool,
    offset: f32,
    last_sample: Option<Instant>,
    sample_period: Duration,
    warmup: Duration,
    ready_at: Option<Instant>,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        SimulatedSensor {
            co2: 600.0,
            temperature: 22.0,
            humidity: 45.0,
            running: false,
            offset: 0.0,
            last_sample: None,
            sample_period: SAMPLE_PERIOD,
            warmup: Duration::ZERO,
            ready_at: None,
        }
    }

    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }

    /// Holds back samples for `warmup` after every (re)start, like a real sensor settling.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    fn start(&mut self) {
        self.running = true;
        self.ready_at = Some(Instant::now() + self.warmup);
    }

    fn step(&mut self) {
        let mut rng = rand::thread_rng();
        self.co2 = (self.co2 + rng.gen_range(-25.0..25.0)).clamp(400.0, 2500.0);
        self.temperature = (self.temperature + rng.gen_range(-0.2..0.2)).clamp(17.5, 27.5);
        self.humidity = (self.humidity + rng.gen_range(-0.5..0.5)).clamp(30.0, 65.0);
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensor for SimulatedSensor {
    fn init(&mut self) -> Result<(), SensorError> {
        self.start();
        self.last_sample = None;
        info!("Simulated sensor initialized");
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Option<RawSample>, SensorError> {
        if !self.running {
            return Ok(None);
        }
        if self.ready_at.is_some_and(|ready| Instant::now() < ready) {
            return Ok(None);
        }
        if let Some(last) = self.last_sample {
            if last.elapsed() < self.sample_period {
                return Ok(None);
            }
        }
        self.last_sample = Some(Instant::now());
        self.step();
        Ok(Some(RawSample {
            co2: self.co2 + self.offset,
            temperature: self.temperature,
            humidity: self.humidity,
        }))
    }

    fn start_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.start();
        Ok(())
    }

    fn stop_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.running = false;
        Ok(())
    }

    fn forced_recalibration(&mut self, target_ppm: u16) -> Result<i16, SensorError> {
        if self.running {
            return Err(SensorError::Driver(
                "forced recalibration requires periodic measurement to be stopped".into(),
            ));
        }
        let correction = f32::from(target_ppm) - self.co2;
        self.offset = correction;
        Ok(correction.round() as i16)
    }
}
