//! Accept loop of a listening TCP socket.
//!
//! One accept is always pending while the listener is open. Each accepted
//! connection becomes a new registered TCP socket whose identity is reported
//! to the listener as `Accepted`; the child's connection tasks start right
//! after. An accept error is fatal for the listener.

use std::sync::Arc;

use compio::net::TcpListener;
use socket2::Socket;
use sockbridge_core::error::ErrorKind;
use sockbridge_core::event::CallbackEvent;
use sockbridge_core::fd;
use sockbridge_core::protocol::Protocol;
use tracing::{debug, trace, warn};

use crate::socket::stream::run_plain;
use crate::socket::{Established, Lifecycle, SocketCore};

/// Accept connections on `socket` until it is closed or accept fails.
///
/// `generation` is the listener's generation when listen was called; once
/// it goes stale the loop exits without reporting anything.
pub(crate) async fn run(listener_core: Arc<SocketCore>, socket: Socket, generation: u64) {
    let listener: TcpListener = fd::adopt(socket);
    let id = listener_core.id();

    loop {
        let accepted = listener.accept().await;
        if !listener_core.is_current(generation) {
            trace!(socket = %id, "listener closed; accept loop done");
            return;
        }

        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                listener_core.report_current(generation, ErrorKind::ListenError, &e);
                listener_core.close_if_current(generation);
                return;
            }
        };

        let Some(registry) = listener_core.ctx().registry.upgrade() else {
            return;
        };
        let child = registry.create(Protocol::Tcp, listener_core.ctx().clone());
        let child_id = child.id();
        let child_core = Arc::clone(child.core());

        let est = Established {
            socket: fd::release(stream),
            remote,
            reused: false,
        };
        let (child_generation, copy) = match child_core.connected(est, Lifecycle::Connected) {
            Ok(armed) => armed,
            Err(e) => {
                warn!(socket = %id, peer = %remote, error = %e, "dropping accepted connection");
                registry.destroy(child_id);
                continue;
            }
        };
        let outgoing = child_core.open_writer();

        let event = CallbackEvent::Accepted { child: child_id, remote };
        if !listener_core.emit_current(generation, event) {
            // Listener destroyed or closed while this accept completed
            registry.destroy(child_id);
            return;
        }
        debug!(socket = %id, child = %child_id, peer = %remote, "accepted");

        let armed = listener_core
            .ctx()
            .reactor
            .submit(move || run_plain(child_core, copy, outgoing, child_generation));
        if armed.is_err() {
            registry.destroy(child_id);
            return;
        }
    }
}
