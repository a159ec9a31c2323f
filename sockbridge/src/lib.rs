//! # Sockbridge
//!
//! A TCP/UDP/TLS socket engine that runs all I/O on one reactor thread and
//! hands every completion to a single consumer thread as an event.
//!
//! ## Architecture
//!
//! - **`sockbridge-core`**: protocol tags, endpoint selection, the option
//!   catalogue, owned callback events and the callback queue
//! - **`sockbridge`**: the reactor thread, socket registry, per-protocol
//!   state machines, the TLS session and the [`Engine`] facade (this crate)
//!
//! Entry points can be called from any thread. Async operations return at
//! once and report their outcome as an event; blocking ones run the OS call
//! on the calling thread. Nothing reaches a handler until the consumer calls
//! [`Engine::drain`], and handlers run with no engine lock held, so they may
//! call back into the engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sockbridge::{CallbackEvent, Engine, EventKind, IoMode, Protocol};
//! use std::time::Duration;
//!
//! # fn main() -> sockbridge::Result<()> {
//! let engine = Engine::new()?;
//!
//! let server = engine.create(Protocol::Tcp);
//! engine.bind(server, "127.0.0.1", 7000, IoMode::Blocking)?;
//! engine.register_handler(server, EventKind::Accepted, |engine, _, event| {
//!     if let CallbackEvent::Accepted { child, .. } = event {
//!         let _ = engine.send(*child, b"hello\0world", IoMode::Async);
//!     }
//! })?;
//! engine.listen(server)?;
//!
//! let client = engine.create(Protocol::Tcp);
//! engine.register_handler(client, EventKind::DataReceived, |_, _, event| {
//!     if let CallbackEvent::DataReceived(data) = event {
//!         println!("received {data:?}");
//!     }
//! })?;
//! engine.connect(client, "127.0.0.1", 7000, IoMode::Async)?;
//!
//! loop {
//!     engine.wait_for_events(Duration::from_millis(50));
//!     engine.drain();
//! }
//! # }
//! ```
//!
//! ## Platform
//!
//! Unix only. On Linux the reactor uses `io_uring` through `compio`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod acceptor;
pub mod dev_tracing;
mod engine;
mod handlers;
mod reactor;
mod registry;
mod socket;
mod tls;

pub use bytes::Bytes;
pub use engine::Engine;
pub use handlers::Handler;
pub use socket::IoMode;

pub use sockbridge_core::config::{EngineConfig, TlsDefaults};
pub use sockbridge_core::error::{EngineError, ErrorKind, Result};
pub use sockbridge_core::event::{CallbackEvent, EventKind, SocketId};
pub use sockbridge_core::options::{SocketOption, TlsPathOption, TlsVersion};
pub use sockbridge_core::protocol::Protocol;
