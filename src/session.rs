// Session protocol handler
//
// One client at a time. Every received segment is decoded as a command frame and
// answered with a telemetry frame; undecodable segments are dropped without a reply.
// When a session ends, for any reason, the e-stop is tripped and the control cycle
// has stopped the motors before the next accept.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{LISTEN_BACKLOG, RECV_BACKOFF, RECV_BUFFER_SIZE};
use crate::control::ControlCycle;
use crate::error::{Error, Result};
use crate::messages::{decode_command, encode_telemetry};
use crate::state::SharedControlState;

/// Why a session loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Clean close from the peer
    PeerClosed,
    /// Non-recoverable receive error
    TransportError,
}

/// Bind the listening endpoint with a backlog of one pending connection
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address {}: {}", addr, e)))?;
    let setup = |source| Error::TransportSetup {
        addr: addr.to_string(),
        source,
    };

    let socket = match socket_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(setup)?;
    socket.set_reuseaddr(true).map_err(setup)?;
    socket.bind(socket_addr).map_err(setup)?;
    socket.listen(LISTEN_BACKLOG).map_err(setup)
}

/// Errors worth retrying without ending the session
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

pub struct SessionHandler {
    state: SharedControlState,
    /// Present in lockstep mode: one control tick per applied command
    inline_cycle: Option<ControlCycle>,
    recv_buf: [u8; RECV_BUFFER_SIZE],
    send_buf: Vec<u8>,
}

impl SessionHandler {
    /// Handler for use alongside an independently running control cycle
    pub fn new(state: SharedControlState) -> Self {
        Self {
            state,
            inline_cycle: None,
            recv_buf: [0; RECV_BUFFER_SIZE],
            send_buf: Vec::with_capacity(RECV_BUFFER_SIZE),
        }
    }

    /// Handler that runs the control cycle itself, once per command
    pub fn lockstep(state: SharedControlState, cycle: ControlCycle) -> Self {
        Self {
            inline_cycle: Some(cycle),
            ..Self::new(state)
        }
    }

    fn run_inline_cycle(&mut self) {
        if let Some(cycle) = self.inline_cycle.as_mut() {
            cycle.tick(&self.state, Instant::now());
        }
    }

    /// Serve one connection until the peer closes it or the transport fails
    pub async fn run<S>(&mut self, mut stream: S) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.begin_session();

        let end = loop {
            let n = match stream.read(&mut self.recv_buf).await {
                Ok(0) => {
                    info!("Client closed connection");
                    break SessionEnd::PeerClosed;
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => {
                    debug!("Transient receive error: {}", e);
                    sleep(RECV_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    break SessionEnd::TransportError;
                }
            };
            debug!("Received request of {} bytes", n);

            let command = match decode_command(&self.recv_buf[..n]) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Dropping frame: {}", e);
                    continue;
                }
            };

            self.state.apply_command(&command);
            self.run_inline_cycle();

            if let Err(e) = self.send_telemetry(&mut stream).await {
                warn!("Couldn't send telemetry: {}", e);
            }
        };

        // Fail-safe: no client, no motion
        self.state.request_trip();
        self.run_inline_cycle();
        end
    }

    async fn send_telemetry<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let telemetry = self.state.telemetry();
        encode_telemetry(&telemetry, &mut self.send_buf)?;
        debug!("Sending telemetry of {} bytes", self.send_buf.len());
        stream.write_all(&self.send_buf).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Accept and serve connections one after another, forever
pub async fn serve(listener: TcpListener, mut handler: SessionHandler) {
    loop {
        info!("Waiting for new connection...");
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                sleep(RECV_BACKOFF).await;
                continue;
            }
        };
        info!("Accepted client from {}", peer);

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let end = handler.run(stream).await;
        info!("Session with {} ended ({:?}), tripping estop", peer, end);

        // The next client must find the trip already enacted
        handler.state.trip_settled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimConfig, WheelGeometry};
    use crate::control::run_control_loop;
    use crate::messages::{Command, Telemetry, Tuning, WheelSpeeds, decode_telemetry, encode_command};
    use crate::pid::MotorCoefficients;
    use crate::platform::{MotorActuator, SimulatedBase};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf, duplex};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// Duplex stream that fails its first read and/or first write once
    struct FlakyStream {
        inner: DuplexStream,
        fail_read: Option<io::ErrorKind>,
        fail_write: Option<io::ErrorKind>,
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if let Some(kind) = this.fail_read.take() {
                return Poll::Ready(Err(kind.into()));
            }
            Pin::new(&mut this.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if let Some(kind) = this.fail_write.take() {
                return Poll::Ready(Err(kind.into()));
            }
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    /// Concurrent-mode server on a loopback port, with its control loop running
    fn spawn_server() -> (SocketAddr, SharedControlState, SimulatedBase, JoinHandle<()>, JoinHandle<()>) {
        let base = SimulatedBase::manual(SimConfig::default(), WheelGeometry::default());
        let cycle = ControlCycle::new(
            Box::new(base.clone()),
            Box::new(base.clone()),
            Box::new(base.clone()),
            WheelGeometry::default(),
        );
        let state = SharedControlState::new();
        let control = tokio::spawn(run_control_loop(
            cycle,
            state.clone(),
            Duration::from_millis(10),
        ));

        let listener = bind_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, SessionHandler::new(state.clone())));
        (addr, state, base, server, control)
    }

    fn tuning() -> Tuning {
        Tuning {
            left: MotorCoefficients::new(50.0, 0.0, 0.0, 10.0),
            right: MotorCoefficients::new(40.0, 0.0, 0.0, 12.0),
        }
    }

    async fn exchange<S>(client: &mut S, cmd: &Command) -> Telemetry
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        client.write_all(&encode_command(cmd)).await.unwrap();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let n = client.read(&mut buf).await.unwrap();
        decode_telemetry(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_command_is_applied_and_answered() {
        let state = SharedControlState::new();
        let mut handler = SessionHandler::new(state.clone());
        let (mut client, server): (DuplexStream, DuplexStream) = duplex(1024);

        let client_side = async move {
            let telemetry = exchange(
                &mut client,
                &Command {
                    tuning: Some(tuning()),
                    speeds: Some(WheelSpeeds::new(0.8, 0.6)),
                },
            )
            .await;
            assert_eq!(telemetry.tuning, tuning());
            assert!(telemetry.estop_armed);
            drop(client);
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(state.lock().tuning, tuning());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_silently() {
        let state = SharedControlState::new();
        state.apply_command(&Command {
            tuning: Some(tuning()),
            speeds: Some(WheelSpeeds::new(0.5, 0.5)),
        });
        let mut handler = SessionHandler::new(state.clone());
        let (mut client, server) = duplex(1024);

        let observer = state.clone();
        let client_side = async move {
            let before = observer.telemetry();
            let speeds_before = observer.lock().desired_speeds();

            client.write_all(&[0xFF, 0xFF, 0xFF]).await.unwrap();
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            let reply = timeout(Duration::from_millis(100), client.read(&mut buf)).await;
            assert!(reply.is_err(), "no reply expected for a bad frame");
            assert_eq!(observer.telemetry(), before);
            assert_eq!(observer.lock().desired_speeds(), speeds_before);

            // Session is still alive
            let telemetry = exchange(
                &mut client,
                &Command {
                    tuning: None,
                    speeds: Some(WheelSpeeds::new(1.0, 1.0)),
                },
            )
            .await;
            assert_eq!(telemetry.tuning, tuning());
            assert_eq!(observer.lock().desired_speeds(), WheelSpeeds::new(1.0, 1.0));
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_session_end_trips_estop() {
        let state = SharedControlState::new();
        let mut handler = SessionHandler::new(state.clone());
        let (mut client, server) = duplex(1024);

        let client_side = async move {
            exchange(
                &mut client,
                &Command {
                    tuning: None,
                    speeds: Some(WheelSpeeds::new(2.0, 2.0)),
                },
            )
            .await;
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);

        let s = state.lock();
        assert_eq!(s.desired_speeds(), WheelSpeeds::zero());
        assert!(s.estop.trip_pending());
    }

    #[tokio::test]
    async fn test_lockstep_runs_cycle_per_command() {
        let base = SimulatedBase::manual(SimConfig::default(), WheelGeometry::default());
        let cycle = ControlCycle::new(
            Box::new(base.clone()),
            Box::new(base.clone()),
            Box::new(base.clone()),
            WheelGeometry::default(),
        );
        let state = SharedControlState::new();
        let mut handler = SessionHandler::lockstep(state.clone(), cycle);
        let (mut client, server) = duplex(1024);

        let client_side = async move {
            let telemetry = exchange(
                &mut client,
                &Command {
                    tuning: Some(tuning()),
                    speeds: Some(WheelSpeeds::new(1.0, 1.0)),
                },
            )
            .await;
            // kp * error + kv * desired, wheels still at rest
            assert_eq!(telemetry.left_output, 60);
            assert_eq!(telemetry.right_output, 52);
            assert!(telemetry.dt_sec > 0.0);
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);

        // The closing inline tick enacted the trip
        assert_eq!(base.stop_count(), 1);
        assert_eq!(base.outputs(), (0, 0));
        assert!(!state.telemetry().estop_armed);
        assert!(base.safety_light());
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let (addr, _state, _base, server, control) = spawn_server();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let telemetry = exchange(
            &mut client,
            &Command {
                tuning: Some(tuning()),
                speeds: None,
            },
        )
        .await;
        assert_eq!(telemetry.tuning, tuning());
        drop(client);

        // A second client is served after the first one leaves
        let mut client = TcpStream::connect(addr).await.unwrap();
        let telemetry = exchange(
            &mut client,
            &Command {
                tuning: None,
                speeds: Some(WheelSpeeds::new(0.3, 0.3)),
            },
        )
        .await;
        assert_eq!(telemetry.tuning, tuning());
        assert!(telemetry.estop_armed);

        server.abort();
        control.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_back_to_back_sessions_start_armed() {
        let (addr, state, base, server, control) = spawn_server();

        let mut first = TcpStream::connect(addr).await.unwrap();
        exchange(
            &mut first,
            &Command {
                tuning: Some(tuning()),
                speeds: Some(WheelSpeeds::new(2.0, 2.0)),
            },
        )
        .await;

        // Next client is already queued when the first hangs up
        let mut second = TcpStream::connect(addr).await.unwrap();
        drop(first);

        let telemetry = exchange(
            &mut second,
            &Command {
                tuning: None,
                speeds: Some(WheelSpeeds::new(1.0, 1.0)),
            },
        )
        .await;
        assert!(telemetry.estop_armed);
        // The first session's trip landed before the second was accepted
        assert!(base.stop_count() >= 1);

        // Several control ticks later the new setpoint is still standing
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(state.lock().desired_speeds(), WheelSpeeds::new(1.0, 1.0));
        let telemetry = exchange(
            &mut second,
            &Command {
                tuning: None,
                speeds: None,
            },
        )
        .await;
        assert!(telemetry.estop_armed);
        assert_ne!(telemetry.left_output, 0);
        assert!(!base.safety_light());

        server.abort();
        control.abort();
    }

    #[tokio::test]
    async fn test_transient_receive_error_keeps_session() {
        let state = SharedControlState::new();
        let mut handler = SessionHandler::new(state.clone());
        let (mut client, server) = duplex(1024);
        let server = FlakyStream {
            inner: server,
            fail_read: Some(io::ErrorKind::Interrupted),
            fail_write: None,
        };

        let client_side = async move {
            let telemetry = exchange(
                &mut client,
                &Command {
                    tuning: Some(tuning()),
                    speeds: Some(WheelSpeeds::new(0.4, 0.6)),
                },
            )
            .await;
            assert_eq!(telemetry.tuning, tuning());
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(state.lock().tuning, tuning());
    }

    #[tokio::test]
    async fn test_hard_receive_error_ends_session() {
        let state = SharedControlState::new();
        let mut handler = SessionHandler::new(state.clone());
        let (_client, server) = duplex(1024);
        let server = FlakyStream {
            inner: server,
            fail_read: Some(io::ErrorKind::ConnectionReset),
            fail_write: None,
        };

        let end = handler.run(server).await;
        assert_eq!(end, SessionEnd::TransportError);
        assert!(state.lock().estop.trip_pending());
    }

    #[tokio::test]
    async fn test_send_failure_keeps_session() {
        let state = SharedControlState::new();
        let mut handler = SessionHandler::new(state.clone());
        let (mut client, server) = duplex(1024);
        let server = FlakyStream {
            inner: server,
            fail_read: None,
            fail_write: Some(io::ErrorKind::BrokenPipe),
        };

        let observer = state.clone();
        let client_side = async move {
            client
                .write_all(&encode_command(&Command {
                    tuning: None,
                    speeds: Some(WheelSpeeds::new(0.5, 0.5)),
                }))
                .await
                .unwrap();
            // The reply to this one is lost
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            let reply = timeout(Duration::from_millis(100), client.read(&mut buf)).await;
            assert!(reply.is_err(), "reply should have been lost");
            assert_eq!(observer.lock().desired_speeds(), WheelSpeeds::new(0.5, 0.5));

            let telemetry = exchange(
                &mut client,
                &Command {
                    tuning: Some(tuning()),
                    speeds: Some(WheelSpeeds::new(1.0, 1.0)),
                },
            )
            .await;
            assert_eq!(telemetry.tuning, tuning());
            assert_eq!(observer.lock().desired_speeds(), WheelSpeeds::new(1.0, 1.0));
        };

        let (end, ()) = tokio::join!(handler.run(server), client_side);
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_bind_errors() {
        let err = bind_listener("not-an-address").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);

        // TEST-NET-3 is never assigned to a local interface
        let err = bind_listener("203.0.113.7:5333").unwrap_err();
        assert!(matches!(err, Error::TransportSetup { .. }), "got {:?}", err);
    }
}
