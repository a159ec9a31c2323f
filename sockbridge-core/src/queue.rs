//! Callback queue between the reactor and the consumer thread.
//!
//! Producers push from any thread; a single consumer pops one event at a
//! time. The lock is only held for the push or pop itself, so handlers
//! invoked after a pop may freely re-enter the engine.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

use crate::event::{CallbackEvent, SocketId};

/// FIFO of `(socket, event)` pairs.
///
/// Insertion order is delivery order. Events are only ever removed by
/// [`pop`](Self::pop) or by [`purge`](Self::purge) when their socket is
/// destroyed.
#[derive(Debug, Default)]
pub struct CallbackQueue {
    events: Mutex<VecDeque<(SocketId, CallbackEvent)>>,
    ready: Condvar,
}

impl CallbackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake a waiting consumer.
    pub fn push(&self, id: SocketId, event: CallbackEvent) {
        self.events.lock().push_back((id, event));
        self.ready.notify_one();
    }

    /// Remove the oldest event.
    pub fn pop(&self) -> Option<(SocketId, CallbackEvent)> {
        self.events.lock().pop_front()
    }

    /// Drop every pending event of `id`. Returns how many were removed.
    pub fn purge(&self, id: SocketId) -> usize {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|(owner, _)| *owner != id);
        let purged = before - events.len();
        if purged > 0 {
            trace!(socket = %id, purged, "purged pending events");
        }
        purged
    }

    /// Drop every pending event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Block until the queue is non-empty or `timeout` passes.
    ///
    /// Returns `true` if events are pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut events = self.events.lock();
        if events.is_empty() {
            // Spurious wakeups are fine; the caller drains and waits again.
            let _ = self.ready.wait_for(&mut events, timeout);
        }
        !events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn id(n: u64) -> SocketId {
        SocketId::from_raw(n)
    }

    #[test]
    fn test_fifo_order() {
        let queue = CallbackQueue::new();
        queue.push(id(1), CallbackEvent::Connected);
        queue.push(id(2), CallbackEvent::DataReceived(Bytes::from_static(b"a")));
        queue.push(id(1), CallbackEvent::Disconnected);

        assert_eq!(queue.pop(), Some((id(1), CallbackEvent::Connected)));
        assert_eq!(queue.pop().unwrap().0, id(2));
        assert_eq!(queue.pop(), Some((id(1), CallbackEvent::Disconnected)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_purge_only_touches_one_socket() {
        let queue = CallbackQueue::new();
        queue.push(id(1), CallbackEvent::Connected);
        queue.push(id(2), CallbackEvent::Connected);
        queue.push(id(1), CallbackEvent::SendQueueDrained);

        assert_eq!(queue.purge(id(1)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some((id(2), CallbackEvent::Connected)));
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let queue = CallbackQueue::new();
        assert!(!queue.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let queue = Arc::new(CallbackQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(id(9), CallbackEvent::Connected);
            })
        };
        assert!(queue.wait(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(queue.len(), 1);
    }
}
