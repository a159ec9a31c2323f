//! Per-socket state shared by every protocol variant.
//!
//! A [`SocketCore`] owns the canonical OS descriptor, the endpoints, the
//! option queue and the event pipeline of one socket. The protocol variants
//! ([`tcp::TcpSocket`], [`udp::UdpSocket`] and the TLS session) wrap a core
//! and implement [`SocketOps`] on top of it.
//!
//! ## Locking
//!
//! - `state` guards the descriptor and everything recorded about it. It is
//!   never held across I/O that can block, nor while events are pushed.
//! - `pipeline` is the "events may still be delivered" flag. Producers hold
//!   it shared while pushing; destroy takes it exclusive once to kill the
//!   pipeline, so no event can slip in after destroy returns.
//!
//! Every installed or closed descriptor bumps `generation`. Reactor tasks
//! remember the generation they were armed with and drop their completions
//! silently once it is stale.

pub(crate) mod stream;
pub(crate) mod tcp;
pub(crate) mod udp;

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use compio::buf::BufResult;
use compio::driver::op::Connect;
use parking_lot::{Mutex, MutexGuard, RwLock};
use socket2::{SockAddr, Socket, Type};
use sockbridge_core::config::EngineConfig;
use sockbridge_core::endpoint::{self, Candidates, Family, ResolveScope};
use sockbridge_core::error::{platform_code, EngineError, ErrorKind, Result};
use sockbridge_core::event::{CallbackEvent, EventKind, SocketId};
use sockbridge_core::options::{
    self, DualStack, OptionQueue, OptionScope, SocketOption, TlsPathOption,
};
use sockbridge_core::protocol::Protocol;
use sockbridge_core::queue::CallbackQueue;
use tracing::{debug, trace, warn};

use crate::handlers::HandlerTable;
use crate::reactor::Reactor;
use crate::registry::Registry;
use stream::Outgoing;

/// A freshly connected descriptor.
#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) socket: Socket,
    pub(crate) remote: SocketAddr,
    /// `socket` duplicates the already installed canonical descriptor
    pub(crate) reused: bool,
}

/// Whether an entry point completes on the reactor or on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Return at once; the outcome arrives as an event
    #[default]
    Async,
    /// Run the OS call on the calling thread and return its outcome
    Blocking,
}

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Bound,
    Connecting,
    Handshaking,
    Connected,
    Listening,
}

/// Engine services every socket reaches back into.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) queue: Arc<CallbackQueue>,
    pub(crate) reactor: Arc<Reactor>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) registry: Weak<Registry>,
}

pub(crate) struct SocketState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) descriptor: Option<Socket>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) pending_options: OptionQueue,
    pub(crate) dual_stack: DualStack,
    pub(crate) writer: Option<flume::Sender<Outgoing>>,
    /// Set by destroy; no descriptor is installed afterwards
    pub(crate) destroyed: bool,
}

impl SocketState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Idle,
            descriptor: None,
            local: None,
            remote: None,
            pending_options: OptionQueue::new(),
            dual_stack: DualStack::default(),
            writer: None,
            destroyed: false,
        }
    }

    /// Refuse to hand out descriptors for a destroyed socket.
    pub(crate) fn check_alive(&self) -> io::Result<()> {
        if self.destroyed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket destroyed"));
        }
        Ok(())
    }
}

pub(crate) struct SocketCore {
    id: SocketId,
    protocol: Protocol,
    ctx: Context,
    state: Mutex<SocketState>,
    pipeline: RwLock<bool>,
    generation: AtomicU64,
    pending_sends: AtomicUsize,
    handlers: HandlerTable,
}

impl SocketCore {
    pub(crate) fn new(id: SocketId, protocol: Protocol, ctx: Context) -> Self {
        Self {
            id,
            protocol,
            ctx,
            state: Mutex::new(SocketState::new()),
            pipeline: RwLock::new(true),
            generation: AtomicU64::new(0),
            pending_sends: AtomicUsize::new(0),
            handlers: HandlerTable::default(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline]
    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock()
    }

    // ---- event pipeline -------------------------------------------------

    /// Queue an event unless the socket has been destroyed.
    pub(crate) fn emit(&self, event: CallbackEvent) -> bool {
        let alive = self.pipeline.read();
        if !*alive {
            return false;
        }
        trace!(socket = %self.id, %event, "queued");
        self.ctx.queue.push(self.id, event);
        true
    }

    /// Queue an event produced by a task armed at `generation`.
    ///
    /// Returns false (and drops the event) when the descriptor the task was
    /// working on has since been closed or replaced.
    pub(crate) fn emit_current(&self, generation: u64, event: CallbackEvent) -> bool {
        let alive = self.pipeline.read();
        if !*alive || !self.is_current(generation) {
            return false;
        }
        trace!(socket = %self.id, %event, "queued");
        self.ctx.queue.push(self.id, event);
        true
    }

    /// Queue an `Error` event for a failed operation.
    pub(crate) fn report(&self, kind: ErrorKind, err: &io::Error) {
        warn!(socket = %self.id, %kind, error = %err, "operation failed");
        self.emit(CallbackEvent::error(kind, platform_code(err)));
    }

    pub(crate) fn report_current(&self, generation: u64, kind: ErrorKind, err: &io::Error) {
        if self.is_current(generation) {
            warn!(socket = %self.id, %kind, error = %err, "operation failed");
            self.emit_current(generation, CallbackEvent::error(kind, platform_code(err)));
        }
    }

    /// Report a failure and build the error returned to the caller.
    pub(crate) fn fail(&self, kind: ErrorKind, err: io::Error) -> EngineError {
        self.report(kind, &err);
        EngineError::operation(kind, err)
    }

    /// Kill the pipeline. Nothing is queued for this socket afterwards, and
    /// operations still in flight can no longer install a descriptor.
    pub(crate) fn shut_pipeline(&self) {
        *self.pipeline.write() = false;
        self.state().destroyed = true;
    }

    // ---- descriptor lifecycle -------------------------------------------

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Open a descriptor of this socket's protocol, with the queued options
    /// applied.
    pub(crate) fn open(&self, family: Family, queued: &OptionQueue) -> io::Result<Socket> {
        let (ty, proto) = if self.protocol.is_stream() {
            (Type::STREAM, socket2::Protocol::TCP)
        } else {
            (Type::DGRAM, socket2::Protocol::UDP)
        };
        let socket = Socket::new(family.domain(), ty, Some(proto))?;
        for (option, err) in queued.clone().replay(&socket) {
            warn!(socket = %self.id, %option, error = %err, "queued option rejected");
        }
        Ok(socket)
    }

    /// Make sure the socket owns a descriptor, creating one of `family`.
    pub(crate) fn ensure_descriptor<'a>(
        &self,
        state: &'a mut SocketState,
        family: Family,
    ) -> io::Result<&'a Socket> {
        state.check_alive()?;
        if state.descriptor.is_none() {
            let socket = self.open(family, &state.pending_options)?;
            self.install(state, socket);
        }
        state
            .descriptor
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Make `socket` the canonical descriptor. Returns its generation.
    pub(crate) fn install(&self, state: &mut SocketState, socket: Socket) -> u64 {
        state.pending_options = OptionQueue::new();
        state.local = socket.local_addr().ok().and_then(|a| a.as_socket());
        state.descriptor = Some(socket);
        let generation = self.bump();
        debug!(socket = %self.id, generation, "descriptor installed");
        generation
    }

    /// Record an established connection.
    ///
    /// The connected descriptor replaces the canonical one unless it is a
    /// duplicate of the one already installed (a connect from a bound
    /// socket). Returns the new generation and a duplicate for the reactor.
    ///
    /// A socket destroyed while its connect was in flight drops the new
    /// connection instead.
    pub(crate) fn connected(
        &self,
        est: Established,
        lifecycle: Lifecycle,
    ) -> io::Result<(u64, Socket)> {
        let Established { socket, remote, reused } = est;
        let mut state = self.state();
        if let Err(e) = state.check_alive() {
            drop(state);
            let _ = socket.shutdown(Shutdown::Both);
            debug!(socket = %self.id, peer = %remote, "connected after destroy; dropped");
            return Err(e);
        }
        let (generation, copy) = if reused {
            state.local = socket.local_addr().ok().and_then(|a| a.as_socket());
            (self.bump(), socket)
        } else {
            let copy = socket.try_clone()?;
            (self.install(&mut state, socket), copy)
        };
        state.remote = Some(remote);
        state.lifecycle = lifecycle;
        debug!(socket = %self.id, peer = %remote, generation, "connected");
        Ok((generation, copy))
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.state().lifecycle = lifecycle;
    }

    /// Close the descriptor. Returns false if none was open.
    pub(crate) fn close(&self) -> bool {
        self.close_matching(None)
    }

    /// Close the descriptor if it is still the one armed at `generation`.
    pub(crate) fn close_if_current(&self, generation: u64) -> bool {
        self.close_matching(Some(generation))
    }

    fn close_matching(&self, generation: Option<u64>) -> bool {
        let (socket, writer) = {
            let mut state = self.state();
            if generation.is_some_and(|g| !self.is_current(g)) || state.descriptor.is_none() {
                return false;
            }
            self.bump();
            state.lifecycle = Lifecycle::Idle;
            state.local = None;
            state.remote = None;
            (state.descriptor.take(), state.writer.take())
        };
        // Closing the channel lets the writer task finish
        drop(writer);
        if let Some(socket) = socket {
            // Wakes every reactor operation pending on a duplicate
            let _ = socket.shutdown(Shutdown::Both);
            debug!(socket = %self.id, "descriptor closed");
        }
        true
    }

    // ---- sends ----------------------------------------------------------

    pub(crate) fn begin_send(&self) {
        self.pending_sends.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a completed send; the last one out reports the drained queue.
    pub(crate) fn finish_send(&self, generation: Option<u64>) {
        if self.pending_sends.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if !self.handlers.contains(EventKind::SendQueueDrained) {
            return;
        }
        match generation {
            Some(generation) => self.emit_current(generation, CallbackEvent::SendQueueDrained),
            None => self.emit(CallbackEvent::SendQueueDrained),
        };
    }

    /// Undo a [`begin_send`](Self::begin_send) whose send never started.
    pub(crate) fn abandon_send(&self) {
        self.pending_sends.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sender into the connection's writer task, if connected.
    pub(crate) fn writer(&self) -> Option<flume::Sender<Outgoing>> {
        self.state().writer.clone()
    }

    // ---- resolution -----------------------------------------------------

    /// Reject empty hostnames before any resolution.
    pub(crate) fn check_host(&self, host: &str) -> Result<()> {
        if endpoint::is_valid_host(host) {
            return Ok(());
        }
        warn!(socket = %self.id, "empty hostname");
        self.emit(CallbackEvent::error(ErrorKind::EmptyHost, 0));
        Err(EngineError::EmptyHost)
    }

    /// Which families a resolution for this socket keeps.
    ///
    /// Streams resolve both families at once. Datagram sockets stick to the
    /// family of their descriptor, or the one their preference asks for.
    pub(crate) fn resolve_scope(&self) -> ResolveScope {
        if self.protocol.is_stream() {
            return ResolveScope::AllFamilies;
        }
        let state = self.state();
        let family = state
            .descriptor
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
            .map_or_else(|| Family::preferred(state.dual_stack), |a| Family::of(&a));
        ResolveScope::Only(family)
    }

    /// Apply the dual-stack preference to a resolution result.
    pub(crate) fn select(&self, resolved: io::Result<Vec<SocketAddr>>) -> Result<Candidates> {
        self.select_reporting(ErrorKind::NoHost, resolved)
    }

    /// As [`select`](Self::select), reporting an empty result as `kind`.
    fn select_reporting(
        &self,
        kind: ErrorKind,
        resolved: io::Result<Vec<SocketAddr>>,
    ) -> Result<Candidates> {
        let addrs = resolved.map_err(|e| self.fail(kind, e))?;
        let prefs = self.state().dual_stack;
        Candidates::new(addrs, prefs).ok_or_else(|| {
            self.fail(
                kind,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "no endpoint matches the dual-stack preference",
                ),
            )
        })
    }

    // ---- options --------------------------------------------------------

    /// Apply an OS or dual-stack option.
    pub(crate) fn set_option(&self, option: SocketOption, value: i32) -> Result<()> {
        let mut state = self.state();
        match option.scope() {
            OptionScope::DualStack => {
                state.dual_stack.set(option, value != 0);
                Ok(())
            }
            OptionScope::Tls => Err(EngineError::unsupported(option.as_str(), self.protocol)),
            OptionScope::Os => {
                let listening = state.lifecycle == Lifecycle::Listening;
                match state.descriptor.as_ref() {
                    // Only reuse-address still matters once listening
                    Some(_) if listening && option != SocketOption::ReuseAddr => Ok(()),
                    Some(socket) => Ok(options::apply(socket, option, value)?),
                    None => {
                        trace!(socket = %self.id, %option, value, "option queued");
                        state.pending_options.push(option, value);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Read an OS or dual-stack option back.
    ///
    /// OS options come from the descriptor, or from the queue while no
    /// descriptor exists.
    pub(crate) fn get_option(&self, option: SocketOption) -> Result<i32> {
        let state = self.state();
        match option.scope() {
            OptionScope::DualStack => Ok(i32::from(state.dual_stack.get(option))),
            OptionScope::Tls => Err(EngineError::unsupported(option.as_str(), self.protocol)),
            OptionScope::Os => match state.descriptor.as_ref() {
                Some(socket) => Ok(options::read(socket, option)?),
                None => state.pending_options.latest(option).ok_or_else(|| {
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::NotConnected,
                        format!("{option} has no descriptor to read from"),
                    ))
                }),
            },
        }
    }

    // ---- bind -----------------------------------------------------------

    /// Bind to the preferred endpoint of a resolution result.
    ///
    /// Every failure, resolution included, is a `BindError`.
    pub(crate) fn bind_resolved(&self, resolved: io::Result<Vec<SocketAddr>>) -> Result<()> {
        let candidates = self.select_reporting(ErrorKind::BindError, resolved)?;
        let addr = candidates.selected();

        let mut state = self.state();
        let bound = self
            .ensure_descriptor(&mut state, Family::of(&addr))
            .and_then(|socket| {
                socket.bind(&SockAddr::from(addr))?;
                socket.local_addr()
            });
        match bound {
            Ok(local) => {
                state.local = local.as_socket();
                state.lifecycle = Lifecycle::Bound;
                drop(state);
                debug!(socket = %self.id, local = %addr, "bound");
                Ok(())
            }
            Err(e) => {
                drop(state);
                Err(self.fail(ErrorKind::BindError, e))
            }
        }
    }
}

#[cfg(test)]
impl SocketCore {
    /// A core wired to a private queue and a reactor that never starts.
    pub(crate) fn detached(protocol: Protocol) -> (Arc<Self>, Arc<CallbackQueue>) {
        let queue = Arc::new(CallbackQueue::new());
        let ctx = Context {
            queue: Arc::clone(&queue),
            reactor: Arc::new(Reactor::new("detached")),
            config: Arc::new(EngineConfig::default()),
            registry: Weak::new(),
        };
        (Arc::new(Self::new(SocketId::from_raw(1), protocol, ctx)), queue)
    }
}

/// Resolve on the blocking pool so the reactor keeps turning.
pub(crate) async fn resolve_off_reactor(
    host: String,
    port: u16,
    scope: ResolveScope,
) -> io::Result<Vec<SocketAddr>> {
    compio::runtime::spawn_blocking(move || endpoint::resolve(&host, port, scope)).await
}

/// Connect an existing descriptor through the reactor.
pub(crate) async fn connect_on_reactor(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    let op = Connect::new(socket.as_raw_fd(), SockAddr::from(addr));
    let BufResult(result, _) = compio::runtime::Runtime::current().submit(op).await;
    result.map(|_| ())
}

/// Bind, shared by every protocol.
pub(crate) fn bind(core: &Arc<SocketCore>, host: &str, port: u16, mode: IoMode) -> Result<()> {
    core.check_host(host)?;
    let scope = core.resolve_scope();
    match mode {
        IoMode::Blocking => core.bind_resolved(endpoint::resolve(host, port, scope)),
        IoMode::Async => {
            let task_core = Arc::clone(core);
            let host = host.to_owned();
            core.ctx().reactor.submit(move || async move {
                let resolved = resolve_off_reactor(host, port, scope).await;
                // Failures were reported as events
                let _ = task_core.bind_resolved(resolved);
            })
        }
    }
}

/// Operations every protocol variant provides.
///
/// The engine reaches every variant through this one interface; variants
/// reject what their protocol cannot do with `Unsupported`.
pub(crate) trait SocketOps: Send + Sync {
    fn core(&self) -> &SocketCore;

    /// Whether this variant can ever produce events of `kind`.
    fn emits(&self, kind: EventKind) -> bool {
        kind != EventKind::Accepted || self.core().protocol().can_listen()
    }

    fn bind(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()>;

    fn connect(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()>;

    fn listen(self: Arc<Self>) -> Result<()> {
        Err(EngineError::unsupported("listen", self.core().protocol()))
    }

    fn send(self: Arc<Self>, data: &[u8], mode: IoMode) -> Result<()>;

    fn send_to(
        self: Arc<Self>,
        _data: &[u8],
        _host: &str,
        _port: u16,
        _mode: IoMode,
    ) -> Result<()> {
        Err(EngineError::unsupported("send_to", self.core().protocol()))
    }

    /// Close the connection; emits `Disconnected` if one was open.
    fn disconnect(&self) -> Result<()> {
        if self.core().close() {
            self.core().emit(CallbackEvent::Disconnected);
        }
        Ok(())
    }

    fn set_option(&self, option: SocketOption, value: i32) -> Result<()> {
        self.core().set_option(option, value)
    }

    fn get_option(&self, option: SocketOption) -> Result<i32> {
        self.core().get_option(option)
    }

    fn set_tls_option_path(&self, _option: TlsPathOption, _path: &Path) -> Result<()> {
        Err(EngineError::unsupported("set_tls_option_path", self.core().protocol()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn next_event(queue: &CallbackQueue) -> Option<CallbackEvent> {
        queue.pop().map(|(_, event)| event)
    }

    #[test]
    fn test_unresolvable_bind_is_bind_error() {
        let (core, queue) = SocketCore::detached(Protocol::Udp);
        let err = core
            .bind_resolved(Err(io::Error::new(io::ErrorKind::NotFound, "no such host")))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BindError));
        assert_eq!(
            next_event(&queue),
            Some(CallbackEvent::error(ErrorKind::BindError, 0))
        );
        assert!(core.state().descriptor.is_none());
    }

    #[test]
    fn test_filtered_bind_is_bind_error() {
        let (core, queue) = SocketCore::detached(Protocol::Tcp);
        core.set_option(SocketOption::Ipv6Only, 1).unwrap();
        let err = core
            .bind_resolved(Ok(vec!["127.0.0.1:0".parse().unwrap()]))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BindError));
        assert!(matches!(
            next_event(&queue),
            Some(CallbackEvent::Error { kind: ErrorKind::BindError, .. })
        ));
    }

    #[test]
    fn test_connect_resolution_stays_no_host() {
        let (core, queue) = SocketCore::detached(Protocol::Tcp);
        let err = core
            .select(Err(io::Error::new(io::ErrorKind::NotFound, "no such host")))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NoHost));
        assert_eq!(next_event(&queue), Some(CallbackEvent::error(ErrorKind::NoHost, 0)));
    }

    #[test]
    fn test_destroyed_socket_drops_late_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = listener.local_addr().unwrap();
        let (core, queue) = SocketCore::detached(Protocol::Tcp);

        let socket = core.open(Family::of(&remote), &OptionQueue::new()).unwrap();
        socket.connect(&SockAddr::from(remote)).unwrap();
        core.shut_pipeline();

        let est = Established { socket, remote, reused: false };
        assert!(core.connected(est, Lifecycle::Connected).is_err());
        assert!(core.state().descriptor.is_none());
        assert!(queue.pop().is_none());

        // The peer sees the connection end
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(peer.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_destroyed_socket_opens_nothing() {
        let (core, _queue) = SocketCore::detached(Protocol::Udp);
        core.shut_pipeline();
        let mut state = core.state();
        assert!(core.ensure_descriptor(&mut state, Family::V4).is_err());
        assert!(state.descriptor.is_none());
    }
}
