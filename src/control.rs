// Control cycle driver
//
// Each tick: measure dt, sample the safety line and encoders, evaluate the e-stop
// supervisor, run both PID channels (or stop on a trip), command the actuator and
// publish feedback into the shared state.

use std::time::{Duration, Instant};

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::config::{BATTERY_SCALE, TIMER_HORIZON, WheelGeometry};
use crate::estop::{EstopTransition, SafetyLine};
use crate::messages::WheelSpeeds;
use crate::pid::PidRuntime;
use crate::platform::{EncoderSource, EncoderTicks, MotorActuator, SafetyIo};
use crate::state::SharedControlState;

/// Elapsed-time source for the control loop.
///
/// Time is measured against a base that is moved forward once it passes the
/// horizon. The lap that crosses the horizon still reports its real length and the
/// next lap is measured from the new base, so dt never goes negative.
#[derive(Debug, Clone, Copy)]
pub struct CycleClock {
    base: Instant,
    last: Duration, // previous lap, relative to base
    horizon: Duration,
}

impl CycleClock {
    pub fn new(start: Instant) -> Self {
        Self::with_horizon(start, TIMER_HORIZON)
    }

    pub fn with_horizon(start: Instant, horizon: Duration) -> Self {
        Self {
            base: start,
            last: Duration::ZERO,
            horizon,
        }
    }

    /// Seconds since the previous lap (zero if `now` is not later)
    pub fn lap(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.base);
        let dt = elapsed.saturating_sub(self.last);

        if elapsed >= self.horizon {
            self.base = now;
            self.last = Duration::ZERO;
        } else {
            self.last = elapsed;
        }

        dt.as_secs_f32()
    }
}

/// What the actuator was told this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Stop,
    Drive { left: i32, right: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub dt_sec: f32,
    pub transition: EstopTransition,
    pub command: ActuatorCommand,
}

/// Runs both PID channels and the e-stop supervisor against the platform
pub struct ControlCycle {
    encoders: Box<dyn EncoderSource>,
    actuator: Box<dyn MotorActuator>,
    safety: Box<dyn SafetyIo>,
    clock: CycleClock,
    meters_per_tick: f32,
    left_pid: PidRuntime,
    right_pid: PidRuntime,
}

impl ControlCycle {
    pub fn new(
        encoders: Box<dyn EncoderSource>,
        actuator: Box<dyn MotorActuator>,
        safety: Box<dyn SafetyIo>,
        geometry: WheelGeometry,
    ) -> Self {
        Self {
            encoders,
            actuator,
            safety,
            clock: CycleClock::new(Instant::now()),
            meters_per_tick: geometry.meters_per_tick(),
            left_pid: PidRuntime::new(),
            right_pid: PidRuntime::new(),
        }
    }

    /// Replace the cycle clock (e.g. to start from a known instant)
    pub fn with_clock(mut self, clock: CycleClock) -> Self {
        self.clock = clock;
        self
    }

    /// Controller memory of the (left, right) channels
    pub fn pid_runtimes(&self) -> (PidRuntime, PidRuntime) {
        (self.left_pid, self.right_pid)
    }

    fn ticks_to_speeds(&self, ticks: EncoderTicks, dt_sec: f32) -> WheelSpeeds {
        WheelSpeeds::new(
            self.meters_per_tick * ticks.left as f32 / dt_sec,
            self.meters_per_tick * ticks.right as f32 / dt_sec,
        )
    }

    /// Run one control cycle at time `now`
    pub fn tick(&mut self, state: &SharedControlState, now: Instant) -> CycleReport {
        let dt_sec = self.clock.lap(now);
        let line = SafetyLine::from(self.safety.read_safety_line());
        let battery_raw = self.safety.read_battery_raw();

        // A zero-length cycle leaves the ticks in the counters for the next one
        let measured = if dt_sec > 0.0 {
            match self.encoders.read_ticks() {
                Ok(ticks) => Some(self.ticks_to_speeds(ticks, dt_sec)),
                Err(e) => {
                    warn!("Encoder read failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (transition, command, request_consumed) = {
            let mut s = state.lock();

            // Supervisor first, so a trip shows up in this cycle's output
            let request_consumed = s.estop.trip_pending();
            let transition = s.estop.evaluate(line);

            if let Some(speeds) = measured {
                s.left.actual_speed = speeds.left;
                s.right.actual_speed = speeds.right;
            }
            s.dt_sec = dt_sec;
            s.battery_voltage = battery_raw * BATTERY_SCALE;

            let command = if transition.is_tripped() {
                // Re-zeroed on every tripped cycle: a stale setpoint written by the
                // session in between must not survive
                s.zero_desired_speeds();
                if let EstopTransition::Tripped(_) = transition {
                    self.left_pid.reset();
                    self.right_pid.reset();
                }
                ActuatorCommand::Stop
            } else {
                let left = self.left_pid.compute(
                    s.left.desired_speed,
                    s.left.actual_speed,
                    dt_sec,
                    &s.tuning.left,
                );
                let right = self.right_pid.compute(
                    s.right.desired_speed,
                    s.right.actual_speed,
                    dt_sec,
                    &s.tuning.right,
                );
                ActuatorCommand::Drive { left, right }
            };

            (transition, command, request_consumed)
        };

        match transition {
            EstopTransition::Tripped(cause) => warn!("Estop tripped ({:?}), stopping motors", cause),
            EstopTransition::Rearmed => info!("Safety line normal, estop re-armed"),
            EstopTransition::Armed | EstopTransition::Held => {}
        }

        self.safety.set_safety_light(transition.is_tripped());

        let result = match command {
            ActuatorCommand::Stop => self.actuator.stop(),
            ActuatorCommand::Drive { left, right } => self.actuator.set_speeds(left, right),
        };
        if let Err(e) = result {
            error!("Actuator command {:?} failed: {}", command, e);
        }

        let (left_output, right_output) = self.actuator.outputs();
        {
            let mut s = state.lock();
            s.left.control_output = left_output;
            s.right.control_output = right_output;
        }
        if request_consumed {
            state.notify_trip_enacted();
        }

        CycleReport {
            dt_sec,
            transition,
            command,
        }
    }
}

impl Drop for ControlCycle {
    fn drop(&mut self) {
        // Never leave the motors running behind a dead control loop
        if let Err(e) = self.actuator.stop() {
            warn!("Failed to stop motors on drop: {}", e);
        }
    }
}

/// Drive `cycle` at a fixed period for the life of the process
pub async fn run_control_loop(mut cycle: ControlCycle, state: SharedControlState, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Control cycle started: {:?} period", period);

    loop {
        tick.tick().await;

        let started = Instant::now();
        cycle.tick(&state, started);

        let cost = started.elapsed();
        if cost > period {
            warn!("Control tick took {:?}, over the {:?} period", cost, period);
        }
    }
}
