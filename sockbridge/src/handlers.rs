//! Per-socket event handler tables.

use std::sync::Arc;

use parking_lot::Mutex;
use sockbridge_core::event::{CallbackEvent, EventKind, SocketId};

use crate::engine::Engine;

/// Callback invoked on the consumer thread for one event kind.
///
/// Handlers get the engine back so they can re-enter it, e.g. to send from
/// an `Accepted` handler or disconnect from an `Error` handler.
pub type Handler = Arc<dyn Fn(&Engine, SocketId, &CallbackEvent) + Send + Sync + 'static>;

/// One optional handler per [`EventKind`].
#[derive(Default)]
pub(crate) struct HandlerTable {
    slots: Mutex<[Option<Handler>; EventKind::COUNT]>,
}

impl HandlerTable {
    pub(crate) fn set(&self, kind: EventKind, handler: Handler) {
        self.slots.lock()[kind.index()] = Some(handler);
    }

    pub(crate) fn clear(&self, kind: EventKind) -> bool {
        self.slots.lock()[kind.index()].take().is_some()
    }

    /// Clone the handler out so it can run without the table locked.
    pub(crate) fn get(&self, kind: EventKind) -> Option<Handler> {
        self.slots.lock()[kind.index()].clone()
    }

    pub(crate) fn contains(&self, kind: EventKind) -> bool {
        self.slots.lock()[kind.index()].is_some()
    }

    pub(crate) fn clear_all(&self) {
        *self.slots.lock() = Default::default();
    }
}
