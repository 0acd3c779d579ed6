//! Network sessions
//!
//! One session per accepted socket. The session is a self-re-posting
//! reactor job: each pump polls the socket briefly, consumes complete
//! newline-terminated frames, answers them and re-posts itself. A
//! session that stays idle past [`IDLE_TIMEOUT`] closes itself; so does
//! any read, write or parse failure. Session faults never escape to the
//! VM.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::FabricResult;
use crate::message::{Reply, ReplyKind, Request, RequestKind};
use crate::reactor::Reactor;
use crate::wire;

/// Idle sessions are killed after this long without traffic
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one pump waits on the socket before yielding the reactor
const POLL_INTERVAL_MS: libc::c_int = 100;

const READ_CHUNK: usize = 4096;

struct SessionState {
    stream: TcpStream,
    inbuf: Vec<u8>,
    last_active: Instant,
}

/// One client connection being multiplexed on a reactor
pub struct Session {
    state: Mutex<SessionState>,
    reactor: Reactor,
    stop: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl Session {
    /// Take ownership of an accepted socket and start pumping it
    pub fn spawn(stream: TcpStream, reactor: Reactor, stop: Arc<AtomicBool>) {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(%peer, error = %e, "session setup failed");
            return;
        }

        tracing::debug!(%peer, "session started");
        let session = Arc::new(Session {
            state: Mutex::new(SessionState {
                stream,
                inbuf: Vec::new(),
                last_active: Instant::now(),
            }),
            reactor: reactor.clone(),
            stop,
            peer,
        });
        session.repost();
    }

    fn repost(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.reactor.post(Box::new(move || me.pump()));
    }

    fn pump(self: Arc<Self>) {
        if self.stop.load(Ordering::Acquire) {
            tracing::debug!(peer = %self.peer, "session closed on shutdown");
            return;
        }

        let mut state = self.state.lock().unwrap();

        let mut pollfd = libc::pollfd {
            fd: state.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
        if ready < 0 {
            tracing::warn!(peer = %self.peer, "poll failed, closing session");
            return;
        }

        if ready > 0 && pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            match self.read_available(&mut state) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(peer = %self.peer, "session closed by peer");
                    return;
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "session read failed");
                    return;
                }
            }

            while let Some(pos) = state.inbuf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.inbuf.drain(..=pos).collect();
                if let Err(e) = self.handle_frame(&mut state, &line) {
                    tracing::warn!(peer = %self.peer, error = %e, "session ended on error");
                    return;
                }
            }
        }

        if state.last_active.elapsed() > IDLE_TIMEOUT {
            tracing::info!(peer = %self.peer, "session idle, closing");
            return;
        }

        drop(state);
        self.repost();
    }

    /// Drain readable bytes; `Ok(false)` on end-of-stream
    fn read_available(&self, state: &mut SessionState) -> std::io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match state.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    state.inbuf.extend_from_slice(&chunk[..n]);
                    state.last_active = Instant::now();
                    if n < READ_CHUNK {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_frame(&self, state: &mut SessionState, line: &[u8]) -> FabricResult<()> {
        let text = std::str::from_utf8(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let request: Request = wire::decode_frame(text)?;

        match request.kind {
            RequestKind::Ping => {
                self.write_reply(state, &Reply::new(ReplyKind::Pong, "pong"))?;
            }
            RequestKind::InputData => {
                self.write_reply(state, &Reply::new(ReplyKind::OutputData, request.data))?;
            }
            // Debug toggles are accepted and ignored
            RequestKind::DebugStart | RequestKind::DebugStop => {}
        }
        Ok(())
    }

    fn write_reply(&self, state: &mut SessionState, reply: &Reply) -> FabricResult<()> {
        let bytes = wire::encode_frame(reply)?;
        let mut written = 0;
        while written < bytes.len() {
            match state.stream.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let mut pollfd = libc::pollfd {
                        fd: state.stream.as_raw_fd(),
                        events: libc::POLLOUT,
                        revents: 0,
                    };
                    let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
                    if ready <= 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "reply write stalled",
                        )
                        .into());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
