// Platform adapters for the control cycle
//
// The control core only talks to hardware through these three capabilities:
// - EncoderSource: tick counts since the last read
// - MotorActuator: signed speed commands, realized output, unconditional stop
// - SafetyIo: safety line, battery sense and the safety light

pub mod sim;

use crate::error::Result;

pub use sim::SimulatedBase;

/// Left/right tick counts accumulated since the previous read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderTicks {
    pub left: i32,
    pub right: i32,
}

pub trait EncoderSource: Send {
    /// Read and clear the tick counters
    fn read_ticks(&mut self) -> Result<EncoderTicks>;
}

pub trait MotorActuator: Send {
    /// Command both channels. The actuator may saturate the values.
    fn set_speeds(&mut self, left: i32, right: i32) -> Result<()>;

    /// Stop both motors regardless of any previous command
    fn stop(&mut self) -> Result<()>;

    /// Last realized (left, right) output
    fn outputs(&self) -> (i32, i32);
}

pub trait SafetyIo: Send {
    /// `true` while the safety line reads its normal level
    fn read_safety_line(&mut self) -> bool;

    /// Raw battery ADC reading in [0, 1]
    fn read_battery_raw(&mut self) -> f32;

    fn set_safety_light(&mut self, on: bool);
}
