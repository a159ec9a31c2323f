//! UDP sockets.
//!
//! "Connect" only fixes the default peer; it picks the preferred endpoint
//! and does not fall back to other candidates. There is no receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use compio::buf::BufResult;
use socket2::{SockAddr, Socket};
use sockbridge_core::endpoint::{self, Family};
use sockbridge_core::error::{EngineError, ErrorKind, Result};
use sockbridge_core::event::CallbackEvent;
use sockbridge_core::fd;
use tracing::{debug, trace};

use super::{resolve_off_reactor, IoMode, Lifecycle, SocketCore, SocketOps};

pub(crate) struct UdpSocket {
    core: Arc<SocketCore>,
}

impl UdpSocket {
    pub(crate) fn new(core: Arc<SocketCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core_handle(&self) -> &Arc<SocketCore> {
        &self.core
    }
}

/// Fix the default peer from a resolution result.
fn connect_resolved(core: &SocketCore, resolved: io::Result<Vec<SocketAddr>>) -> Result<()> {
    let addr = core.select(resolved)?.selected();

    let mut state = core.state();
    let connected = core
        .ensure_descriptor(&mut state, Family::of(&addr))
        .and_then(|socket| {
            socket.connect(&SockAddr::from(addr))?;
            socket.local_addr()
        });
    match connected {
        Ok(local) => {
            state.local = local.as_socket();
            state.remote = Some(addr);
            state.lifecycle = Lifecycle::Connected;
            drop(state);
            debug!(socket = %core.id(), peer = %addr, "default peer set");
            core.emit(CallbackEvent::Connected);
            Ok(())
        }
        Err(e) => {
            drop(state);
            core.close();
            Err(core.fail(ErrorKind::ConnectError, e))
        }
    }
}

/// Duplicate of the descriptor for a send, opening one of `family` if needed.
fn send_descriptor(core: &SocketCore, family: Family) -> io::Result<(Socket, u64)> {
    let mut state = core.state();
    let socket = core.ensure_descriptor(&mut state, family)?.try_clone()?;
    Ok((socket, core.generation()))
}

async fn send_on_reactor(
    core: Arc<SocketCore>,
    socket: Socket,
    data: Bytes,
    to: Option<SocketAddr>,
    generation: u64,
) {
    let udp: compio::net::UdpSocket = fd::adopt(socket);
    let len = data.len();
    let BufResult(result, _) = match to {
        Some(addr) => udp.send_to(data, addr).await,
        None => udp.send(data).await,
    };
    trace!(socket = %core.id(), bytes = len, ?to, ok = result.is_ok(), "datagram sent");

    core.finish_send(Some(generation));
    if let Err(e) = result {
        core.report_current(generation, ErrorKind::SendError, &e);
    }
}

impl SocketOps for UdpSocket {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn bind(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        super::bind(&self.core, host, port, mode)
    }

    fn connect(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        let core = &self.core;
        core.check_host(host)?;
        let scope = core.resolve_scope();
        match mode {
            IoMode::Blocking => connect_resolved(core, endpoint::resolve(host, port, scope)),
            IoMode::Async => {
                let core = Arc::clone(core);
                let host = host.to_owned();
                self.core.ctx().reactor.submit(move || async move {
                    let resolved = resolve_off_reactor(host, port, scope).await;
                    let _ = connect_resolved(&core, resolved);
                })
            }
        }
    }

    fn send(self: Arc<Self>, data: &[u8], mode: IoMode) -> Result<()> {
        let core = &self.core;
        let target = {
            let state = core.state();
            match (state.remote, state.descriptor.as_ref()) {
                (Some(_), Some(socket)) => socket.try_clone().map(|s| (s, core.generation())),
                _ => Err(io::Error::new(io::ErrorKind::NotConnected, "no default peer")),
            }
        };
        let (socket, generation) = match target {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                core.report(ErrorKind::SendError, &e);
                return Err(EngineError::NotConnected);
            }
            Err(e) => return Err(core.fail(ErrorKind::SendError, e)),
        };

        core.begin_send();
        match mode {
            IoMode::Blocking => {
                let sent = socket.send(data);
                core.finish_send(None);
                sent.map(|_| ()).map_err(|e| core.fail(ErrorKind::SendError, e))
            }
            IoMode::Async => {
                let task_core = Arc::clone(core);
                let data = Bytes::copy_from_slice(data);
                core.ctx()
                    .reactor
                    .submit(move || send_on_reactor(task_core, socket, data, None, generation))
                    .map_err(|e| {
                        core.abandon_send();
                        e
                    })
            }
        }
    }

    fn send_to(self: Arc<Self>, data: &[u8], host: &str, port: u16, mode: IoMode) -> Result<()> {
        let core = &self.core;
        core.check_host(host)?;
        let scope = core.resolve_scope();

        match mode {
            IoMode::Blocking => {
                let addr = core.select(endpoint::resolve(host, port, scope))?.selected();
                let (socket, _) = send_descriptor(core, Family::of(&addr))
                    .map_err(|e| core.fail(ErrorKind::SendError, e))?;
                core.begin_send();
                let sent = socket.send_to(data, &SockAddr::from(addr));
                core.finish_send(None);
                sent.map(|_| ()).map_err(|e| core.fail(ErrorKind::SendError, e))
            }
            IoMode::Async => {
                core.begin_send();
                let task_core = Arc::clone(core);
                let host = host.to_owned();
                let data = Bytes::copy_from_slice(data);
                core.ctx()
                    .reactor
                    .submit(move || async move {
                        let core = task_core;
                        let resolved = resolve_off_reactor(host, port, scope).await;
                        let target = core
                            .select(resolved)
                            .ok()
                            .map(|c| c.selected())
                            .map(|addr| {
                                send_descriptor(&core, Family::of(&addr)).map(|t| (t, addr))
                            });
                        match target {
                            Some(Ok(((socket, generation), addr))) => {
                                send_on_reactor(core, socket, data, Some(addr), generation).await;
                            }
                            Some(Err(e)) => {
                                core.finish_send(None);
                                core.report(ErrorKind::SendError, &e);
                            }
                            // NoHost already reported
                            None => core.finish_send(None),
                        }
                    })
                    .map_err(|e| {
                        core.abandon_send();
                        e
                    })
            }
        }
    }
}
