//! TCP sockets: connect with endpoint fallback, listen, stream sends.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{SockAddr, Socket};
use sockbridge_core::endpoint::{self, Candidates, Family};
use sockbridge_core::error::{EngineError, ErrorKind, Result};
use sockbridge_core::event::CallbackEvent;
use tracing::{debug, warn};

use super::stream;
use super::{
    connect_on_reactor, resolve_off_reactor, Established, IoMode, Lifecycle, SocketCore, SocketOps,
};
use crate::acceptor;

pub(crate) struct TcpSocket {
    core: Arc<SocketCore>,
}

impl TcpSocket {
    pub(crate) fn new(core: Arc<SocketCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core_handle(&self) -> &Arc<SocketCore> {
        &self.core
    }
}

/// Descriptor for one connect attempt.
///
/// A bound socket connects from a duplicate of its own descriptor so the
/// local endpoint survives; otherwise each attempt opens a fresh descriptor
/// of the candidate's family with the queued options applied.
fn attempt_socket(core: &SocketCore, addr: SocketAddr) -> io::Result<(Socket, bool)> {
    let state = core.state();
    state.check_alive()?;
    if let Some(bound) = state.descriptor.as_ref() {
        return Ok((bound.try_clone()?, true));
    }
    let queued = state.pending_options.clone();
    drop(state);
    Ok((core.open(Family::of(&addr), &queued)?, false))
}

fn exhausted(last: Option<io::Error>) -> io::Error {
    last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no endpoint to connect to"))
}

/// Walk the candidates on the calling thread until one connects.
pub(crate) fn establish_blocking(
    core: &SocketCore,
    candidates: &Candidates,
) -> io::Result<Established> {
    let mut last = None;
    for addr in candidates.attempts() {
        let attempt = attempt_socket(core, addr).and_then(|(socket, reused)| {
            socket.connect(&SockAddr::from(addr))?;
            Ok(Established { socket, remote: addr, reused })
        });
        match attempt {
            Ok(est) => return Ok(est),
            Err(e) => {
                debug!(socket = %core.id(), peer = %addr, error = %e, "connect attempt failed");
                last = Some(e);
            }
        }
    }
    Err(exhausted(last))
}

/// Walk the candidates through the reactor until one connects.
pub(crate) async fn establish(
    core: &SocketCore,
    candidates: &Candidates,
) -> io::Result<Established> {
    let mut last = None;
    for addr in candidates.attempts() {
        let (socket, reused) = match attempt_socket(core, addr) {
            Ok(attempt) => attempt,
            Err(e) => {
                last = Some(e);
                continue;
            }
        };
        match connect_on_reactor(&socket, addr).await {
            Ok(()) => return Ok(Established { socket, remote: addr, reused }),
            Err(e) => {
                debug!(socket = %core.id(), peer = %addr, error = %e, "connect attempt failed");
                last = Some(e);
            }
        }
    }
    Err(exhausted(last))
}

/// Drop an existing connection before a reconnect.
pub(crate) fn reset_for_connect(core: &SocketCore) {
    let connected = core.state().remote.is_some();
    if connected && core.close() {
        core.emit(CallbackEvent::Disconnected);
    }
    core.set_lifecycle(Lifecycle::Connecting);
}

/// A failed connect leaves the socket closed.
pub(crate) fn connect_failed(core: &SocketCore, err: io::Error) -> EngineError {
    core.close();
    core.set_lifecycle(Lifecycle::Idle);
    core.fail(ErrorKind::ConnectError, err)
}

/// Install the connection, start its tasks and report it.
fn start_plain(core: &Arc<SocketCore>, est: Established) -> io::Result<()> {
    let (generation, copy) = core.connected(est, Lifecycle::Connected)?;
    let outgoing = core.open_writer();
    core.emit_current(generation, CallbackEvent::Connected);

    let task_core = Arc::clone(core);
    core.ctx()
        .reactor
        .submit(move || stream::run_plain(task_core, copy, outgoing, generation))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl SocketOps for TcpSocket {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn bind(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        super::bind(&self.core, host, port, mode)
    }

    fn connect(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        let core = &self.core;
        core.check_host(host)?;
        reset_for_connect(core);
        let scope = core.resolve_scope();

        match mode {
            IoMode::Blocking => {
                let candidates = core.select(endpoint::resolve(host, port, scope)).map_err(|e| {
                    core.set_lifecycle(Lifecycle::Idle);
                    e
                })?;
                let est =
                    establish_blocking(core, &candidates).map_err(|e| connect_failed(core, e))?;
                start_plain(core, est).map_err(|e| connect_failed(core, e))
            }
            IoMode::Async => {
                let core = Arc::clone(core);
                let host = host.to_owned();
                self.core.ctx().reactor.submit(move || async move {
                    let resolved = resolve_off_reactor(host, port, scope).await;
                    let Ok(candidates) = core.select(resolved) else {
                        core.set_lifecycle(Lifecycle::Idle);
                        return;
                    };
                    let est = match establish(&core, &candidates).await {
                        Ok(est) => est,
                        Err(e) => {
                            connect_failed(&core, e);
                            return;
                        }
                    };
                    let (generation, copy) = match core.connected(est, Lifecycle::Connected) {
                        Ok(armed) => armed,
                        Err(e) => {
                            connect_failed(&core, e);
                            return;
                        }
                    };
                    let outgoing = core.open_writer();
                    core.emit_current(generation, CallbackEvent::Connected);
                    // Already on the reactor: run the connection in this task
                    stream::run_plain(core, copy, outgoing, generation).await;
                })
            }
        }
    }

    fn listen(self: Arc<Self>) -> Result<()> {
        let core = &self.core;
        let mut state = core.state();
        let descriptor = match (state.lifecycle, state.descriptor.as_ref()) {
            (Lifecycle::Bound, Some(socket)) => socket,
            _ => {
                drop(state);
                warn!(socket = %core.id(), "listen before bind");
                core.emit(CallbackEvent::error(ErrorKind::ListenError, 0));
                return Err(EngineError::NotBound);
            }
        };

        let backlog = core.ctx().config.listen_backlog;
        let copy = match descriptor.listen(backlog).and_then(|()| descriptor.try_clone()) {
            Ok(copy) => copy,
            Err(e) => {
                drop(state);
                return Err(core.fail(ErrorKind::ListenError, e));
            }
        };
        state.lifecycle = Lifecycle::Listening;
        let local = state.local;
        drop(state);

        let generation = core.generation();
        debug!(socket = %core.id(), ?local, backlog, "listening");
        let task_core = Arc::clone(core);
        core.ctx()
            .reactor
            .submit(move || acceptor::run(task_core, copy, generation))
    }

    fn send(self: Arc<Self>, data: &[u8], mode: IoMode) -> Result<()> {
        stream::send(&self.core, data, mode, true)
    }
}
