//! The engine context and its public surface.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sockbridge_core::config::EngineConfig;
use sockbridge_core::error::{EngineError, Result};
use sockbridge_core::event::{CallbackEvent, EventKind, SocketId};
use sockbridge_core::options::{SocketOption, TlsPathOption};
use sockbridge_core::protocol::Protocol;
use sockbridge_core::queue::CallbackQueue;
use tracing::{debug, trace};

use crate::handlers::Handler;
use crate::reactor::Reactor;
use crate::registry::{Registry, SocketEntry};
use crate::socket::{Context, IoMode};

/// A socket engine: one reactor thread, one registry, one callback queue.
///
/// Every entry point may be called from any thread. Completions are queued
/// and only reach handlers when the consumer calls [`drain`](Self::drain).
///
/// Several engines can live in one process; they share nothing.
///
/// # Example
///
/// ```no_run
/// use sockbridge::{Engine, EventKind, IoMode, Protocol};
///
/// # fn main() -> sockbridge::Result<()> {
/// let engine = Engine::new()?;
/// let id = engine.create(Protocol::Tcp);
/// engine.register_handler(id, EventKind::DataReceived, |_, id, event| {
///     println!("{id}: {event}");
/// })?;
/// engine.connect(id, "example.com", 80, IoMode::Async)?;
///
/// loop {
///     engine.wait_for_events(std::time::Duration::from_millis(100));
///     engine.drain();
/// }
/// # }
/// ```
pub struct Engine {
    registry: Arc<Registry>,
    queue: Arc<CallbackQueue>,
    reactor: Arc<Reactor>,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Create an engine with the default configuration and start its reactor.
    ///
    /// # Errors
    ///
    /// Fails if the reactor thread or its runtime cannot be started.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with `config` and start its reactor.
    ///
    /// # Errors
    ///
    /// Fails if the reactor thread or its runtime cannot be started.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let engine = Self {
            registry: Arc::new(Registry::new()),
            queue: Arc::new(CallbackQueue::new()),
            reactor: Arc::new(Reactor::new(config.reactor_thread_name.clone())),
            config: Arc::new(config),
        };
        engine.start()?;
        Ok(engine)
    }

    /// Start the reactor. No-op if it is already running.
    ///
    /// # Errors
    ///
    /// Fails if the reactor thread or its runtime cannot be started.
    pub fn start(&self) -> Result<()> {
        self.reactor.start()
    }

    /// Stop the reactor, destroy every socket and drop all pending events.
    ///
    /// The engine can be restarted with [`start`](Self::start); sockets
    /// must be created again.
    pub fn shutdown(&self) {
        self.reactor.stop();
        let destroyed = self.registry.destroy_all();
        self.queue.clear();
        debug!(destroyed, "engine shut down");
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn context(&self) -> Context {
        Context {
            queue: Arc::clone(&self.queue),
            reactor: Arc::clone(&self.reactor),
            config: Arc::clone(&self.config),
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn lookup(&self, id: SocketId) -> Result<SocketEntry> {
        self.registry.get(id).ok_or(EngineError::UnknownSocket(id))
    }

    // ---- lifecycle ------------------------------------------------------

    /// Register a new socket.
    pub fn create(&self, protocol: Protocol) -> SocketId {
        self.registry.create(protocol, self.context()).id()
    }

    /// Destroy a socket.
    ///
    /// No handler runs for `id` after this returns, even for operations
    /// still completing on the reactor.
    ///
    /// # Errors
    ///
    /// `UnknownSocket` if `id` is not registered.
    pub fn destroy(&self, id: SocketId) -> Result<()> {
        if self.registry.destroy(id) {
            Ok(())
        } else {
            Err(EngineError::UnknownSocket(id))
        }
    }

    /// Number of registered sockets, accepted children included.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.registry.len()
    }

    // ---- operations -----------------------------------------------------

    /// Bind to `host:port`.
    ///
    /// # Errors
    ///
    /// Every failure after the socket lookup is also reported as an
    /// `Error` event. In async mode only validation failures are returned.
    pub fn bind(&self, id: SocketId, host: &str, port: u16, mode: IoMode) -> Result<()> {
        self.lookup(id)?.ops().bind(host, port, mode)
    }

    /// Connect to `host:port`; TLS sockets also run the handshake.
    ///
    /// # Errors
    ///
    /// As for [`bind`](Self::bind).
    pub fn connect(&self, id: SocketId, host: &str, port: u16, mode: IoMode) -> Result<()> {
        self.lookup(id)?.ops().connect(host, port, mode)
    }

    /// Start accepting on a bound TCP socket.
    ///
    /// # Errors
    ///
    /// `NotBound` without a prior successful bind, `Unsupported` on UDP and
    /// TLS sockets, or the failed `listen()` call.
    pub fn listen(&self, id: SocketId) -> Result<()> {
        self.lookup(id)?.ops().listen()
    }

    /// Close the connection. Idempotent.
    ///
    /// # Errors
    ///
    /// `UnknownSocket` if `id` is not registered.
    pub fn disconnect(&self, id: SocketId) -> Result<()> {
        self.lookup(id)?.ops().disconnect()
    }

    /// Send `data` on the connection.
    ///
    /// # Errors
    ///
    /// `NotConnected` without an open connection; in blocking mode, the
    /// failed write.
    pub fn send(&self, id: SocketId, data: &[u8], mode: IoMode) -> Result<()> {
        self.lookup(id)?.ops().send(data, mode)
    }

    /// Send one datagram to `host:port`. UDP only.
    ///
    /// # Errors
    ///
    /// `Unsupported` on stream sockets; otherwise as for [`send`](Self::send).
    pub fn send_to(
        &self,
        id: SocketId,
        data: &[u8],
        host: &str,
        port: u16,
        mode: IoMode,
    ) -> Result<()> {
        self.lookup(id)?.ops().send_to(data, host, port, mode)
    }

    /// Set a socket option.
    ///
    /// OS options set before the descriptor exists are queued and applied
    /// when it is created.
    ///
    /// # Errors
    ///
    /// The OS rejected the option, the option does not apply to this
    /// protocol, or a TLS version value is out of range.
    pub fn set_option(&self, id: SocketId, option: SocketOption, value: i32) -> Result<()> {
        self.lookup(id)?.ops().set_option(option, value)
    }

    /// Read a socket option back.
    ///
    /// # Errors
    ///
    /// The OS refused the read, or the option does not apply.
    pub fn get_option(&self, id: SocketId, option: SocketOption) -> Result<i32> {
        self.lookup(id)?.ops().get_option(option)
    }

    /// Load TLS material for a TLS socket.
    ///
    /// # Errors
    ///
    /// `Unsupported` on plain sockets, or `Tls` if the file cannot be read
    /// or holds no usable PEM data.
    pub fn set_tls_option_path(
        &self,
        id: SocketId,
        option: TlsPathOption,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        self.lookup(id)?.ops().set_tls_option_path(option, path.as_ref())
    }

    // ---- inspection -----------------------------------------------------

    /// Whether the socket owns an open descriptor.
    #[must_use]
    pub fn is_connected(&self, id: SocketId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|entry| entry.core().state().descriptor.is_some())
    }

    /// Local endpoint, once bound or connected.
    #[must_use]
    pub fn local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.registry.get(id).and_then(|entry| entry.core().state().local)
    }

    /// Remote endpoint, once connected.
    #[must_use]
    pub fn peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.registry.get(id).and_then(|entry| entry.core().state().remote)
    }

    /// Protocol the socket was created with.
    #[must_use]
    pub fn protocol(&self, id: SocketId) -> Option<Protocol> {
        self.registry.get(id).map(|entry| entry.core().protocol())
    }

    // ---- events ---------------------------------------------------------

    /// Install the handler for one event kind, replacing any previous one.
    ///
    /// # Errors
    ///
    /// `Unsupported` if the socket's protocol never produces `kind`.
    pub fn register_handler<F>(&self, id: SocketId, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(&Engine, SocketId, &CallbackEvent) + Send + Sync + 'static,
    {
        let entry = self.lookup(id)?;
        if !entry.ops().emits(kind) {
            return Err(EngineError::unsupported(kind.as_str(), entry.core().protocol()));
        }
        let handler: Handler = Arc::new(handler);
        entry.core().handlers().set(kind, handler);
        Ok(())
    }

    /// Remove the handler for one event kind. Returns whether one was set.
    ///
    /// # Errors
    ///
    /// `UnknownSocket` if `id` is not registered.
    pub fn unregister_handler(&self, id: SocketId, kind: EventKind) -> Result<bool> {
        Ok(self.lookup(id)?.core().handlers().clear(kind))
    }

    /// Deliver queued events to their handlers on the calling thread.
    ///
    /// Events are popped one at a time and each handler runs with no engine
    /// lock held, so handlers may call back into the engine. Events whose
    /// socket is gone or has no handler for the kind are dropped. Returns
    /// the number of handlers run, at most the configured drain limit.
    pub fn drain(&self) -> usize {
        let limit = self.config.drain_limit.unwrap_or(usize::MAX);
        let mut invoked = 0;
        while invoked < limit {
            let Some((id, event)) = self.queue.pop() else {
                break;
            };
            let handler = self
                .registry
                .get(id)
                .and_then(|entry| entry.core().handlers().get(event.kind()));
            match handler {
                Some(handler) => {
                    handler(self, id, &event);
                    invoked += 1;
                }
                None => trace!(socket = %id, %event, "no handler; dropped"),
            }
        }
        invoked
    }

    /// Events waiting to be drained.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Block until an event is queued or `timeout` passes.
    ///
    /// Returns `true` if events are pending.
    pub fn wait_for_events(&self, timeout: Duration) -> bool {
        self.queue.wait(timeout)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
