// Wire frames exchanged with the navigation computer, and their domain forms
//
// Frames are protobuf messages with explicit field presence. Each received segment
// is decoded on its own; each telemetry frame is written as one segment.

use prost::Message;

use crate::error::{Error, Result};
use crate::pid::MotorCoefficients;

/// Navigation computer -> runtime
///
/// Tuning fields (p/i/d/kv for both sides) travel together, and so do the two
/// speed fields. A group is either fully present or fully absent.
#[derive(Clone, PartialEq, Message)]
pub struct CommandFrame {
    #[prost(float, optional, tag = "1")]
    pub p_l: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub p_r: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub i_l: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub i_r: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub d_l: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub d_r: Option<f32>,
    #[prost(float, optional, tag = "7")]
    pub speed_l: Option<f32>,
    #[prost(float, optional, tag = "8")]
    pub speed_r: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub kv_l: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub kv_r: Option<f32>,
}

/// Runtime -> navigation computer, always fully populated
#[derive(Clone, PartialEq, Message)]
pub struct TelemetryFrame {
    #[prost(float, optional, tag = "1")]
    pub p_l: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub p_r: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub i_l: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub i_r: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub d_l: Option<f32>,
    #[prost(float, optional, tag = "6")]
    pub d_r: Option<f32>,
    #[prost(float, optional, tag = "7")]
    pub speed_l: Option<f32>,
    #[prost(float, optional, tag = "8")]
    pub speed_r: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub dt_sec: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub voltage: Option<f32>,
    /// true = armed (safe to move), false = tripped
    #[prost(bool, optional, tag = "11")]
    pub estop: Option<bool>,
    #[prost(float, optional, tag = "12")]
    pub kv_l: Option<f32>,
    #[prost(float, optional, tag = "13")]
    pub kv_r: Option<f32>,
    #[prost(sint32, optional, tag = "14")]
    pub left_output: Option<i32>,
    #[prost(sint32, optional, tag = "15")]
    pub right_output: Option<i32>,
}

/// Gains for both channels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tuning {
    pub left: MotorCoefficients,
    pub right: MotorCoefficients,
}

/// A left/right pair of wheel speeds in m/s
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSpeeds {
    pub left: f32,
    pub right: f32,
}

impl WheelSpeeds {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// A validated command: each group replaces its state atomically when present
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Command {
    pub tuning: Option<Tuning>,
    pub speeds: Option<WheelSpeeds>,
}

/// Snapshot of everything reported back to the client
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub tuning: Tuning,
    pub actual: WheelSpeeds,
    pub dt_sec: f32,
    pub voltage: f32,
    pub estop_armed: bool,
    pub left_output: i32,
    pub right_output: i32,
}

/// Collect a field group: `None` if absent, error if only partly present or non-finite
fn field_group<const N: usize>(name: &str, fields: [Option<f32>; N]) -> Result<Option<[f32; N]>> {
    let present = fields.iter().filter(|f| f.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != N {
        return Err(Error::MalformedFrame(format!(
            "{} group has {} of {} fields",
            name, present, N
        )));
    }

    let values = fields.map(|f| f.unwrap_or_default());
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::MalformedFrame(format!(
            "{} group contains a non-finite value",
            name
        )));
    }
    Ok(Some(values))
}

impl TryFrom<&CommandFrame> for Command {
    type Error = Error;

    fn try_from(frame: &CommandFrame) -> Result<Self> {
        let tuning = field_group(
            "tuning",
            [
                frame.p_l, frame.i_l, frame.d_l, frame.kv_l, frame.p_r, frame.i_r, frame.d_r,
                frame.kv_r,
            ],
        )?
        .map(|[p_l, i_l, d_l, kv_l, p_r, i_r, d_r, kv_r]| Tuning {
            left: MotorCoefficients::new(p_l, i_l, d_l, kv_l),
            right: MotorCoefficients::new(p_r, i_r, d_r, kv_r),
        });

        let speeds = field_group("speed", [frame.speed_l, frame.speed_r])?
            .map(|[left, right]| WheelSpeeds { left, right });

        Ok(Self { tuning, speeds })
    }
}

impl From<&Command> for CommandFrame {
    fn from(cmd: &Command) -> Self {
        let mut frame = CommandFrame::default();
        if let Some(tuning) = cmd.tuning {
            frame.p_l = Some(tuning.left.k_p);
            frame.i_l = Some(tuning.left.k_i);
            frame.d_l = Some(tuning.left.k_d);
            frame.kv_l = Some(tuning.left.k_v);
            frame.p_r = Some(tuning.right.k_p);
            frame.i_r = Some(tuning.right.k_i);
            frame.d_r = Some(tuning.right.k_d);
            frame.kv_r = Some(tuning.right.k_v);
        }
        if let Some(speeds) = cmd.speeds {
            frame.speed_l = Some(speeds.left);
            frame.speed_r = Some(speeds.right);
        }
        frame
    }
}

impl From<&Telemetry> for TelemetryFrame {
    fn from(t: &Telemetry) -> Self {
        Self {
            p_l: Some(t.tuning.left.k_p),
            p_r: Some(t.tuning.right.k_p),
            i_l: Some(t.tuning.left.k_i),
            i_r: Some(t.tuning.right.k_i),
            d_l: Some(t.tuning.left.k_d),
            d_r: Some(t.tuning.right.k_d),
            speed_l: Some(t.actual.left),
            speed_r: Some(t.actual.right),
            dt_sec: Some(t.dt_sec),
            voltage: Some(t.voltage),
            estop: Some(t.estop_armed),
            kv_l: Some(t.tuning.left.k_v),
            kv_r: Some(t.tuning.right.k_v),
            left_output: Some(t.left_output),
            right_output: Some(t.right_output),
        }
    }
}

// Peer side: absent fields read as zero / tripped
impl From<&TelemetryFrame> for Telemetry {
    fn from(f: &TelemetryFrame) -> Self {
        let v = |field: Option<f32>| field.unwrap_or_default();
        Self {
            tuning: Tuning {
                left: MotorCoefficients::new(v(f.p_l), v(f.i_l), v(f.d_l), v(f.kv_l)),
                right: MotorCoefficients::new(v(f.p_r), v(f.i_r), v(f.d_r), v(f.kv_r)),
            },
            actual: WheelSpeeds::new(v(f.speed_l), v(f.speed_r)),
            dt_sec: v(f.dt_sec),
            voltage: v(f.voltage),
            estop_armed: f.estop.unwrap_or(false),
            left_output: f.left_output.unwrap_or_default(),
            right_output: f.right_output.unwrap_or_default(),
        }
    }
}

/// Decode and validate one inbound segment
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let frame = CommandFrame::decode(bytes)?;
    Command::try_from(&frame)
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    CommandFrame::from(cmd).encode_to_vec()
}

/// Encode telemetry into `buf` (cleared first)
pub fn encode_telemetry(telemetry: &Telemetry, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    TelemetryFrame::from(telemetry).encode(buf)?;
    Ok(())
}

pub fn decode_telemetry(bytes: &[u8]) -> Result<Telemetry> {
    let frame = TelemetryFrame::decode(bytes)?;
    Ok(Telemetry::from(&frame))
}
