// Simulated differential drive base
//
// Each wheel follows the actuator command through a first-order lag. Encoder ticks
// accumulate fractionally so slow wheels still report motion over several reads.
// One shared world backs all three platform capabilities, so clones of the same
// `SimulatedBase` can be handed to the control cycle and kept for inspection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{EncoderSource, EncoderTicks, MotorActuator, SafetyIo};
use crate::config::{MAX_COMMAND, SimConfig, WheelGeometry};
use crate::error::Result;
use crate::messages::WheelSpeeds;

#[derive(Debug, Clone, Copy)]
enum SimClock {
    /// Physics advances with wall-clock time on every access
    Wall { last_step: Instant },
    /// Physics advances only through `SimulatedBase::advance`
    Manual,
}

#[derive(Debug, Default, Clone, Copy)]
struct SimWheel {
    speed: f32,            // m/s
    tick_accumulator: f32, // fractional ticks not yet reported
}

#[derive(Debug)]
struct SimWorld {
    config: SimConfig,
    meters_per_tick: f32,
    clock: SimClock,
    wheels: [SimWheel; 2], // [left, right]
    command: (i32, i32),
    safety_line_normal: bool,
    safety_light: bool,
    stop_count: u32,
}

impl SimWorld {
    fn integrate(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        if dt <= 0.0 {
            return;
        }

        let blend = 1.0 - (-dt / self.config.time_constant_sec.max(1e-3)).exp();
        let commands = [self.command.0, self.command.1];

        for (wheel, &command) in self.wheels.iter_mut().zip(commands.iter()) {
            let target = command as f32 / MAX_COMMAND as f32 * self.config.max_wheel_speed;
            wheel.speed += (target - wheel.speed) * blend;
            wheel.tick_accumulator += wheel.speed * dt / self.meters_per_tick;
        }
    }

    fn sync_clock(&mut self) {
        if let SimClock::Wall { last_step } = self.clock {
            let now = Instant::now();
            self.integrate(now.saturating_duration_since(last_step));
            self.clock = SimClock::Wall { last_step: now };
        }
    }
}

/// Simulated drive base implementing every platform capability
#[derive(Debug, Clone)]
pub struct SimulatedBase {
    world: Arc<Mutex<SimWorld>>,
}

impl SimulatedBase {
    /// Simulation driven by wall-clock time
    pub fn new(config: SimConfig, geometry: WheelGeometry) -> Self {
        Self::with_clock(
            config,
            geometry,
            SimClock::Wall {
                last_step: Instant::now(),
            },
        )
    }

    /// Simulation that only moves when `advance` is called
    pub fn manual(config: SimConfig, geometry: WheelGeometry) -> Self {
        Self::with_clock(config, geometry, SimClock::Manual)
    }

    fn with_clock(config: SimConfig, geometry: WheelGeometry, clock: SimClock) -> Self {
        let world = SimWorld {
            config,
            meters_per_tick: geometry.meters_per_tick(),
            clock,
            wheels: [SimWheel::default(); 2],
            command: (0, 0),
            safety_line_normal: true,
            safety_light: false,
            stop_count: 0,
        };
        Self {
            world: Arc::new(Mutex::new(world)),
        }
    }

    fn world(&self) -> MutexGuard<'_, SimWorld> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Step the physics by `dt` (manual clock only; ignored on wall clock)
    pub fn advance(&self, dt: Duration) {
        let mut world = self.world();
        if let SimClock::Manual = world.clock {
            world.integrate(dt);
        }
    }

    /// Set the safety line level (`false` = tripped, like a pulled e-stop)
    pub fn set_safety_line(&self, normal: bool) {
        debug!("Simulated safety line -> {}", if normal { "normal" } else { "tripped" });
        self.world().safety_line_normal = normal;
    }

    pub fn set_battery_raw(&self, raw: f32) {
        self.world().config.battery_raw = raw.clamp(0.0, 1.0);
    }

    pub fn safety_light(&self) -> bool {
        self.world().safety_light
    }

    pub fn wheel_speeds(&self) -> WheelSpeeds {
        let world = self.world();
        WheelSpeeds::new(world.wheels[0].speed, world.wheels[1].speed)
    }

    /// Number of unconditional stop commands received
    pub fn stop_count(&self) -> u32 {
        self.world().stop_count
    }
}

impl EncoderSource for SimulatedBase {
    fn read_ticks(&mut self) -> Result<EncoderTicks> {
        let mut world = self.world();
        world.sync_clock();

        let mut ticks = [0i32; 2];
        for (wheel, out) in world.wheels.iter_mut().zip(ticks.iter_mut()) {
            let whole = wheel.tick_accumulator.trunc();
            wheel.tick_accumulator -= whole;
            *out = whole as i32;
        }

        Ok(EncoderTicks {
            left: ticks[0],
            right: ticks[1],
        })
    }
}

impl MotorActuator for SimulatedBase {
    fn set_speeds(&mut self, left: i32, right: i32) -> Result<()> {
        let mut world = self.world();
        world.sync_clock();
        world.command = (
            left.clamp(-MAX_COMMAND, MAX_COMMAND),
            right.clamp(-MAX_COMMAND, MAX_COMMAND),
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut world = self.world();
        world.sync_clock();
        world.command = (0, 0);
        world.stop_count += 1;
        Ok(())
    }

    fn outputs(&self) -> (i32, i32) {
        self.world().command
    }
}

impl SafetyIo for SimulatedBase {
    fn read_safety_line(&mut self) -> bool {
        self.world().safety_line_normal
    }

    fn read_battery_raw(&mut self) -> f32 {
        self.world().config.battery_raw
    }

    fn set_safety_light(&mut self, on: bool) {
        self.world().safety_light = on;
    }
}
