// Keyboard teleop: W/S drive, A/D turn, R/F speed, Q quit
//
// Stands in for the navigation computer on the bench: sends the tuning once, then
// wheel speeds at ~50Hz, and logs telemetry as it changes.
use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use wheelbase_runtime::config::RECV_BUFFER_SIZE;
use wheelbase_runtime::messages::{
    Command, Telemetry, Tuning, WheelSpeeds, decode_telemetry, encode_command,
};
use wheelbase_runtime::pid::MotorCoefficients;

const SPEEDS: [f32; 3] = [0.3, 0.8, 1.5]; // m/s
const TURN_SPEEDS: [f32; 3] = [0.2, 0.4, 0.8]; // m/s difference between wheels
const INPUT_TIMEOUT_MS: u64 = 100; // Reset speeds after this much time with no input
const REPLY_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(about = "Keyboard teleop client for the wheelbase runtime")]
struct Args {
    /// Runtime address
    #[arg(long, default_value = "127.0.0.1:5333")]
    addr: String,
    #[arg(long, default_value_t = 40.0)]
    kp: f32,
    #[arg(long, default_value_t = 2.0)]
    ki: f32,
    #[arg(long, default_value_t = 0.5)]
    kd: f32,
    #[arg(long, default_value_t = 60.0)]
    kv: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    info!("Connecting to {}...", args.addr);
    let mut stream = TcpStream::connect(&args.addr).await?;
    stream.set_nodelay(true)?;

    let coeffs = MotorCoefficients::new(args.kp, args.ki, args.kd, args.kv);
    let tuning = Command {
        tuning: Some(Tuning {
            left: coeffs,
            right: coeffs,
        }),
        speeds: None,
    };
    if let Some(telemetry) = send(&mut stream, &tuning).await? {
        info!("Tuning acknowledged: {:?}", telemetry.tuning);
    }

    info!("Controls: W/S=drive, A/D=turn, R/F=speed, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&mut stream).await;
    disable_raw_mode()?;

    result
}

/// Send one command and wait briefly for its telemetry reply
async fn send(
    stream: &mut TcpStream,
    cmd: &Command,
) -> Result<Option<Telemetry>, Box<dyn std::error::Error + Send + Sync>> {
    stream.write_all(&encode_command(cmd)).await?;

    let mut buf = [0u8; RECV_BUFFER_SIZE];
    match timeout(REPLY_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(0)) => Err("runtime closed the connection".into()),
        Ok(Ok(n)) => match decode_telemetry(&buf[..n]) {
            Ok(telemetry) => Ok(Some(telemetry)),
            Err(e) => {
                warn!("Bad telemetry frame: {}", e);
                Ok(None)
            }
        },
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(None), // no reply in time
    }
}

async fn run_teleop(
    stream: &mut TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;

    let mut forward = 0.0;
    let mut turn = 0.0;
    let mut last_movement_input = Instant::now();
    let mut last_estop: Option<bool> = None;

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        forward = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        forward = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        turn = TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        turn = -TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            forward = 0.0;
            turn = 0.0;
        }

        let cmd = Command {
            tuning: None,
            speeds: Some(WheelSpeeds::new(forward - turn, forward + turn)),
        };
        if let Some(telemetry) = send(stream, &cmd).await? {
            if last_estop != Some(telemetry.estop_armed) {
                if telemetry.estop_armed {
                    info!("Estop armed ({:.1}V)", telemetry.voltage);
                } else {
                    warn!("Estop TRIPPED");
                }
                last_estop = Some(telemetry.estop_armed);
            }
        }
    }

    // Leave the base at rest before hanging up
    send(stream, &Command {
        tuning: None,
        speeds: Some(WheelSpeeds::zero()),
    })
    .await?;
    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
