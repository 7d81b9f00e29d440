// Motor-control runtime for a two-wheel ground vehicle
//
// Closes a velocity PID loop per wheel, enforces the e-stop interlock and serves
// setpoints/telemetry to a single navigation client over TCP.

pub mod config;
pub mod control;
pub mod error;
pub mod estop;
pub mod messages;
pub mod pid;
pub mod platform;
pub mod runtime;
pub mod session;
pub mod state;

pub use error::{Error, Result};
