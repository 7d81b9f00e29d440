// Per-wheel velocity PID with feedforward
//
// Discrete PID on wheel velocity with:
// 1. Derivative on measurement (no kick on setpoint steps), low-pass filtered
// 2. Integral accumulated over dt and clamped to +/- 60 / k_i (anti-windup)
// 3. Feedforward proportional to the desired speed
// 4. Deadband near rest to stop the wheels hunting

/// Smoothing factor for the derivative low-pass filter
pub const DERIVATIVE_ALPHA: f32 = 0.75;

/// Integral clamp is INTEGRAL_CLAMP_NUMERATOR / k_i
pub const INTEGRAL_CLAMP_NUMERATOR: f32 = 60.0;

/// Both desired and actual speed below this (m/s) forces a zero command
pub const DEADBAND: f32 = 0.16;

/// Client-tunable gains for one motor channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorCoefficients {
    pub k_p: f32,
    pub k_i: f32,
    pub k_d: f32,
    pub k_v: f32, // feedforward
}

impl MotorCoefficients {
    pub fn new(k_p: f32, k_i: f32, k_d: f32, k_v: f32) -> Self {
        Self { k_p, k_i, k_d, k_v }
    }

    /// Bound on the integral accumulator, or `None` when `k_i` gives no finite bound.
    ///
    /// With `k_i == 0` the integral term contributes nothing, so the accumulator is
    /// held at zero instead of winding up unbounded behind a zero gain.
    pub fn integral_clamp(&self) -> Option<f32> {
        if self.k_i == 0.0 {
            return None;
        }
        let clamp = (INTEGRAL_CLAMP_NUMERATOR / self.k_i).abs();
        clamp.is_finite().then_some(clamp)
    }
}

/// Controller memory for one channel, owned by the control cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidRuntime {
    pub i_error: f32,
    pub filtered_derivative: f32,
    pub previous_actual_speed: f32,
    pub last_signal: i32,
}

impl PidRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Compute the motor command for one channel and one control cycle.
    ///
    /// # Arguments
    /// * `desired_speed` - Commanded wheel speed in m/s
    /// * `actual_speed` - Measured wheel speed in m/s
    /// * `dt_sec` - Time since the previous cycle; a non-positive or non-finite value
    ///   makes this a no-op that returns the previous signal
    /// * `coeffs` - Channel gains
    pub fn compute(
        &mut self,
        desired_speed: f32,
        actual_speed: f32,
        dt_sec: f32,
        coeffs: &MotorCoefficients,
    ) -> i32 {
        if !(dt_sec > 0.0 && dt_sec.is_finite()) {
            return self.last_signal;
        }

        let error = desired_speed - actual_speed;

        // Rate of change of the measurement, not of the error
        self.filtered_derivative = DERIVATIVE_ALPHA * (self.previous_actual_speed - actual_speed)
            / dt_sec
            + (1.0 - DERIVATIVE_ALPHA) * self.filtered_derivative;

        self.i_error = match coeffs.integral_clamp() {
            Some(clamp) => (self.i_error + error * dt_sec).clamp(-clamp, clamp),
            None => 0.0,
        };

        let feedback = coeffs.k_p * error
            + coeffs.k_d * self.filtered_derivative
            + coeffs.k_i * self.i_error;
        let feedforward = coeffs.k_v * desired_speed;

        // `as` saturates, and maps NaN to 0
        let mut signal = (feedforward + feedback).round() as i32;

        if actual_speed.abs() < DEADBAND && desired_speed.abs() < DEADBAND {
            signal = 0;
        }

        self.previous_actual_speed = actual_speed;
        self.last_signal = signal;
        signal
    }
}
