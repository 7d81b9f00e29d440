// Runtime wiring: control cycle + session server over one shared state
//
// Concurrent mode runs the control cycle on its own task at a fixed rate while the
// session loop waits on the network. Lockstep mode hands the control cycle to the
// session loop, which ticks it once per received command.

use tokio::net::TcpListener;
use tracing::info;

use crate::config::{RuntimeConfig, ScheduleMode};
use crate::control::{ControlCycle, run_control_loop};
use crate::error::Result;
use crate::platform::SimulatedBase;
use crate::session::{SessionHandler, bind_listener, serve};
use crate::state::SharedControlState;

/// Control cycle over a simulated base, plus a handle to the simulation
pub fn simulated_cycle(config: &RuntimeConfig) -> (ControlCycle, SimulatedBase) {
    let base = SimulatedBase::new(config.sim, config.geometry);
    let cycle = ControlCycle::new(
        Box::new(base.clone()),
        Box::new(base.clone()),
        Box::new(base.clone()),
        config.geometry,
    );
    (cycle, base)
}

/// Bind the session endpoint and run until the process is stopped.
/// Only transport setup failures return.
pub async fn run(config: RuntimeConfig, cycle: ControlCycle) -> Result<()> {
    config.validate()?;
    info!("Opening session listener on {}...", config.bind_addr);
    let listener = bind_listener(&config.bind_addr)?;
    run_with_listener(listener, &config, SharedControlState::new(), cycle).await;
    Ok(())
}

pub async fn run_with_listener(
    listener: TcpListener,
    config: &RuntimeConfig,
    state: SharedControlState,
    cycle: ControlCycle,
) {
    let handler = match config.mode {
        ScheduleMode::Concurrent => {
            let period = config.loop_period();
            tokio::spawn(run_control_loop(cycle, state.clone(), period));
            info!("Runtime started: {}Hz control loop, concurrent sessions", config.loop_hz);
            SessionHandler::new(state)
        }
        ScheduleMode::Lockstep => {
            info!("Runtime started: control cycle in lockstep with commands");
            SessionHandler::lockstep(state, cycle)
        }
    };

    serve(listener, handler).await;
}
