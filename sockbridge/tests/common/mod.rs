//! Helpers shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sockbridge::{CallbackEvent, Engine, EventKind, SocketId};

pub const DEADLINE: Duration = Duration::from_secs(5);

/// Events seen by a recorder, in delivery order.
pub type Log = Arc<Mutex<Vec<CallbackEvent>>>;

/// Record every event of `kinds` delivered for `id`.
pub fn record(engine: &Engine, id: SocketId, kinds: &[EventKind]) -> Log {
    let log: Log = Arc::default();
    for &kind in kinds {
        let sink = Arc::clone(&log);
        engine
            .register_handler(id, kind, move |_, _, event| sink.lock().push(event.clone()))
            .unwrap();
    }
    log
}

/// Drain until `done` holds or the deadline passes. Returns the final check.
pub fn pump_until(engine: &Engine, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        engine.wait_for_events(Duration::from_millis(20));
        engine.drain();
    }
    done()
}

/// Keep draining for `period`, for tests asserting that nothing arrives.
pub fn pump_for(engine: &Engine, period: Duration) {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        engine.wait_for_events(Duration::from_millis(20));
        engine.drain();
    }
}

pub fn count(log: &Log, kind: EventKind) -> usize {
    log.lock().iter().filter(|e| e.kind() == kind).count()
}

/// Concatenated payloads of every `DataReceived` in the log.
pub fn received(log: &Log) -> Vec<u8> {
    log.lock()
        .iter()
        .filter_map(|e| match e {
            CallbackEvent::DataReceived(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Error kinds in the log, in order.
pub fn errors(log: &Log) -> Vec<sockbridge::ErrorKind> {
    log.lock()
        .iter()
        .filter_map(|e| match e {
            CallbackEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

pub fn init() {
    sockbridge::dev_tracing::init_tracing();
}
