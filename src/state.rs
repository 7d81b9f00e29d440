// Shared control state between the control cycle and the session handler
//
// One mutex guards the whole structure. Each command group, each cycle update and
// each telemetry snapshot happens under a single lock, and the lock is never held
// across an await or a network wait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TRIP_WAIT_WARN;
use crate::estop::EstopSupervisor;
use crate::messages::{Command, Telemetry, Tuning, WheelSpeeds};

/// Per-channel setpoint and feedback
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelState {
    pub desired_speed: f32,  // m/s, from the client
    pub actual_speed: f32,   // m/s, from the encoders
    pub control_output: i32, // last realized actuator command
}

#[derive(Debug, Clone, Default)]
pub struct ControlState {
    pub left: ChannelState,
    pub right: ChannelState,
    pub tuning: Tuning,
    pub dt_sec: f32,
    pub battery_voltage: f32,
    pub estop: EstopSupervisor,
}

impl ControlState {
    pub fn desired_speeds(&self) -> WheelSpeeds {
        WheelSpeeds::new(self.left.desired_speed, self.right.desired_speed)
    }

    pub fn zero_desired_speeds(&mut self) {
        self.left.desired_speed = 0.0;
        self.right.desired_speed = 0.0;
    }

    /// Apply whichever groups the command carries
    pub fn apply(&mut self, cmd: &Command) {
        if let Some(tuning) = cmd.tuning {
            debug!("Tuning update: {:?}", tuning);
            self.tuning = tuning;
        }
        if let Some(speeds) = cmd.speeds {
            self.left.desired_speed = speeds.left;
            self.right.desired_speed = speeds.right;
        }
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            tuning: self.tuning,
            actual: WheelSpeeds::new(self.left.actual_speed, self.right.actual_speed),
            dt_sec: self.dt_sec,
            voltage: self.battery_voltage,
            estop_armed: self.estop.is_armed(),
            left_output: self.left.control_output,
            right_output: self.right.control_output,
        }
    }
}

/// Cloneable handle to the one `ControlState` of the process
#[derive(Debug, Clone, Default)]
pub struct SharedControlState {
    inner: Arc<Mutex<ControlState>>,
    /// Signalled by the control cycle after it acted on a trip request
    trip_enacted: Arc<Notify>,
}

impl SharedControlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access. A poisoned lock is recovered so the control cycle can
    /// keep commanding stops after a panic elsewhere.
    pub fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Control state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn apply_command(&self, cmd: &Command) {
        self.lock().apply(cmd);
    }

    pub fn telemetry(&self) -> Telemetry {
        self.lock().telemetry()
    }

    /// Fail-safe trip from outside the control cycle: setpoints drop immediately,
    /// the supervisor trips and stops the motors on its next evaluation.
    pub fn request_trip(&self) {
        let mut state = self.lock();
        state.zero_desired_speeds();
        state.estop.request_trip();
    }

    /// Called by the control cycle once a consumed trip request has stopped the motors
    pub fn notify_trip_enacted(&self) {
        self.trip_enacted.notify_waiters();
    }

    /// Resolves once no trip request is left for the control cycle to act on
    pub async fn trip_settled(&self) {
        loop {
            let notified = self.trip_enacted.notified();
            tokio::pin!(notified);
            // Register before checking, so a tick in between is not missed
            notified.as_mut().enable();

            let pending = self.lock().estop.trip_pending();
            if !pending {
                return;
            }
            if timeout(TRIP_WAIT_WARN, notified).await.is_err() {
                warn!("Still waiting for the control cycle to enact the estop trip");
            }
        }
    }

    /// Reset the interlock to armed for a newly accepted session
    pub fn begin_session(&self) {
        info!("Session started, estop armed");
        self.lock().estop.arm_for_session();
    }
}
