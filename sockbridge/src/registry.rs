//! Socket registry.
//!
//! The registry is the only owner of live sockets. Everything else holds
//! either an identity or a clone of the per-socket core, which keeps the
//! state alive but not the registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use sockbridge_core::event::SocketId;
use sockbridge_core::protocol::Protocol;
use tracing::debug;

use crate::socket::tcp::TcpSocket;
use crate::socket::udp::UdpSocket;
use crate::socket::{Context, SocketCore, SocketOps};
use crate::tls::TlsSocket;

/// A registered socket, by protocol.
#[derive(Clone)]
pub(crate) enum SocketEntry {
    Tcp(Arc<TcpSocket>),
    Udp(Arc<UdpSocket>),
    Tls(Arc<TlsSocket>),
}

impl SocketEntry {
    pub(crate) fn id(&self) -> SocketId {
        self.core().id()
    }

    pub(crate) fn core(&self) -> &Arc<SocketCore> {
        match self {
            Self::Tcp(socket) => socket.core_handle(),
            Self::Udp(socket) => socket.core_handle(),
            Self::Tls(socket) => socket.core_handle(),
        }
    }

    /// The socket behind the shared operations interface.
    pub(crate) fn ops(&self) -> Arc<dyn SocketOps> {
        match self {
            Self::Tcp(socket) => Arc::clone(socket) as Arc<dyn SocketOps>,
            Self::Udp(socket) => Arc::clone(socket) as Arc<dyn SocketOps>,
            Self::Tls(socket) => Arc::clone(socket) as Arc<dyn SocketOps>,
        }
    }
}

pub(crate) struct Registry {
    sockets: Mutex<HashMap<SocketId, SocketEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an identity and register a new socket under it.
    pub(crate) fn create(&self, protocol: Protocol, ctx: Context) -> SocketEntry {
        let id = SocketId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(SocketCore::new(id, protocol, ctx));
        let entry = match protocol {
            Protocol::Tcp => SocketEntry::Tcp(Arc::new(TcpSocket::new(core))),
            Protocol::Udp => SocketEntry::Udp(Arc::new(UdpSocket::new(core))),
            Protocol::Tls => SocketEntry::Tls(Arc::new(TlsSocket::new(core))),
        };
        self.sockets.lock().insert(id, entry.clone());
        debug!(socket = %id, %protocol, "created");
        entry
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<SocketEntry> {
        self.sockets.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Tear a socket down. Returns false if `id` was not registered.
    ///
    /// The pipeline dies first, so no event can be queued for `id` once the
    /// entry is gone; pending events are purged before the descriptor is
    /// closed, which cancels the socket's reactor operations.
    pub(crate) fn destroy(&self, id: SocketId) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let core = entry.core();
        core.shut_pipeline();
        self.sockets.lock().remove(&id);
        core.ctx().queue.purge(id);
        core.close();
        core.handlers().clear_all();
        debug!(socket = %id, "destroyed");
        true
    }

    /// Destroy every registered socket.
    pub(crate) fn destroy_all(&self) -> usize {
        let ids: Vec<SocketId> = self.sockets.lock().keys().copied().collect();
        ids.into_iter().filter(|id| self.destroy(*id)).count()
    }
}
