// Ports, timing, wheel geometry and runtime configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Session transport
pub const SERVER_PORT: u16 = 5333;
pub const RECV_BUFFER_SIZE: usize = 256;
pub const LISTEN_BACKLOG: u32 = 1; // one pending connection
pub const RECV_BACKOFF: Duration = Duration::from_millis(10);
// Warn this often while the next accept waits for a session-end trip to land
pub const TRIP_WAIT_WARN: Duration = Duration::from_secs(1);

// Control loop frequency
pub const LOOP_HZ: u64 = 100;
pub const MAX_LOOP_HZ: u64 = 1_000_000; // one tick per microsecond

// The cycle clock re-bases itself after this long to keep millisecond math small
pub const TIMER_HORIZON: Duration = Duration::from_secs(1700);

// Drive train geometry
pub const WHEEL_CIRCUMFERENCE: f32 = 1.092; // meters
pub const TICKS_PER_REVOLUTION: f32 = 48.0;
pub const GEAR_RATIO: f32 = 32.0;

// Battery sense: 3.3V ADC reference behind a 470k/51k divider
pub const BATTERY_SCALE: f32 = 3.3 * 521.0 / 51.0;

// Actuator accepts signed commands in [-MAX_COMMAND, MAX_COMMAND]
pub const MAX_COMMAND: i32 = 127;

/// How the control cycle is scheduled relative to the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Control cycle runs as its own task at `loop_hz`
    #[default]
    Concurrent,
    /// Control cycle runs once per received command, inside the session loop
    Lockstep,
}

/// Wheel geometry used to turn encoder ticks into linear speed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelGeometry {
    pub wheel_circumference: f32,
    pub ticks_per_revolution: f32,
    pub gear_ratio: f32,
}

impl Default for WheelGeometry {
    fn default() -> Self {
        Self {
            wheel_circumference: WHEEL_CIRCUMFERENCE,
            ticks_per_revolution: TICKS_PER_REVOLUTION,
            gear_ratio: GEAR_RATIO,
        }
    }
}

impl WheelGeometry {
    pub fn meters_per_tick(&self) -> f32 {
        self.wheel_circumference / (self.ticks_per_revolution * self.gear_ratio)
    }
}

/// Parameters of the simulated drive base
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Wheel speed (m/s) reached at a full-scale actuator command
    pub max_wheel_speed: f32,
    /// First-order response time constant of each wheel
    pub time_constant_sec: f32,
    /// Raw battery ADC reading in [0, 1]
    pub battery_raw: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_wheel_speed: 2.0,
            time_constant_sec: 0.15,
            battery_raw: 0.78, // ~25.9V
        }
    }
}

/// Runtime configuration, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bind_addr: String,
    pub loop_hz: u64,
    pub mode: ScheduleMode,
    pub geometry: WheelGeometry,
    pub sim: SimConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", SERVER_PORT),
            loop_hz: LOOP_HZ,
            mode: ScheduleMode::default(),
            geometry: WheelGeometry::default(),
            sim: SimConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings the runtime cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.loop_hz == 0 || self.loop_hz > MAX_LOOP_HZ {
            return Err(Error::Config(format!(
                "loop_hz must be in 1..={}, got {}",
                MAX_LOOP_HZ, self.loop_hz
            )));
        }
        Ok(())
    }

    /// Control tick period derived from `loop_hz`, never shorter than 1us nor
    /// longer than 1s
    pub fn loop_period(&self) -> Duration {
        Duration::from_micros((1_000_000 / self.loop_hz.max(1)).max(1))
    }
}
