//! Connection tasks for plain TCP streams, and the send path shared with TLS.
//!
//! Every connection runs one reader and one writer on the reactor. The
//! writer drains a per-connection channel, so sends leave the socket in the
//! order they were issued no matter which thread issued them.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use socket2::Socket;
use sockbridge_core::error::{EngineError, ErrorKind, Result};
use sockbridge_core::event::CallbackEvent;
use sockbridge_core::fd;
use tracing::{debug, trace};

use super::{IoMode, SocketCore};

/// Work item for a connection's writer task.
pub(crate) enum Outgoing {
    /// Application bytes
    Data {
        data: Bytes,
        /// Completion for blocking sends; async failures become events
        done: Option<flume::Sender<io::Result<()>>>,
        /// Whether the send takes part in the outstanding-send counter
        counted: bool,
    },
    /// Write out whatever the TLS layer has pending
    Flush,
    /// Send a TLS close-notify, then acknowledge
    Close { done: flume::Sender<()> },
}

impl SocketCore {
    /// Open the writer channel of a fresh connection.
    pub(crate) fn open_writer(&self) -> flume::Receiver<Outgoing> {
        let (tx, rx) = flume::unbounded();
        self.state().writer = Some(tx);
        rx
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed before the send completed")
}

/// Hand `data` to the connection's writer.
///
/// Async sends are always counted. Blocking sends are counted when
/// `count_blocking` is set and wait for the write to complete.
pub(crate) fn send(
    core: &SocketCore,
    data: &[u8],
    mode: IoMode,
    count_blocking: bool,
) -> Result<()> {
    let Some(writer) = core.writer() else {
        core.report(
            ErrorKind::SendError,
            &io::Error::new(io::ErrorKind::NotConnected, "socket is not connected"),
        );
        return Err(EngineError::NotConnected);
    };
    let data = Bytes::copy_from_slice(data);

    let counted = mode == IoMode::Async || count_blocking;
    if counted {
        core.begin_send();
    }

    let (done, completion) = match mode {
        IoMode::Async => (None, None),
        IoMode::Blocking => {
            let (tx, rx) = flume::bounded(1);
            (Some(tx), Some(rx))
        }
    };

    if writer.send(Outgoing::Data { data, done, counted }).is_err() {
        if counted {
            core.abandon_send();
        }
        return Err(core.fail(ErrorKind::SendError, broken_pipe()));
    }
    drop(writer);

    match completion {
        None => Ok(()),
        Some(completion) => match completion.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(core.fail(ErrorKind::SendError, e)),
            Err(_) => Err(core.fail(ErrorKind::SendError, broken_pipe())),
        },
    }
}

/// Whether a read error means the peer went away.
pub(crate) fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// The peer closed the connection armed at `generation`.
pub(crate) fn peer_closed(core: &SocketCore, generation: u64) {
    if core.close_if_current(generation) {
        debug!(socket = %core.id(), "peer closed connection");
        core.emit(CallbackEvent::Disconnected);
    }
}

/// Drive a plain TCP connection until both directions are done.
///
/// `socket` is the reactor's duplicate of the canonical descriptor.
pub(crate) async fn run_plain(
    core: Arc<SocketCore>,
    socket: Socket,
    outgoing: flume::Receiver<Outgoing>,
    generation: u64,
) {
    let stream: TcpStream = fd::adopt(socket);
    futures::future::join(
        read_loop(&core, &stream, generation),
        write_loop(&core, &stream, outgoing, generation),
    )
    .await;
    trace!(socket = %core.id(), generation, "connection tasks finished");
}

async fn read_loop(core: &SocketCore, stream: &TcpStream, generation: u64) {
    let size = core.ctx().config.recv_buffer_size;
    loop {
        let mut reader = stream;
        let BufResult(result, buf) = reader.read(Vec::with_capacity(size)).await;
        match result {
            Ok(0) => return peer_closed(core, generation),
            Ok(n) => {
                trace!(socket = %core.id(), bytes = n, "received");
                if !core.emit_current(generation, CallbackEvent::DataReceived(Bytes::from(buf))) {
                    return;
                }
            }
            Err(e) if is_peer_close(&e) => return peer_closed(core, generation),
            Err(e) => return core.report_current(generation, ErrorKind::RecvError, &e),
        }
    }
}

async fn write_loop(
    core: &SocketCore,
    stream: &TcpStream,
    outgoing: flume::Receiver<Outgoing>,
    generation: u64,
) {
    while let Ok(item) = outgoing.recv_async().await {
        let Outgoing::Data { data, done, counted } = item else {
            continue;
        };

        let len = data.len();
        let mut writer = stream;
        let BufResult(result, _) = writer.write_all(data).await;
        trace!(socket = %core.id(), bytes = len, ok = result.is_ok(), "sent");

        if counted {
            core.finish_send(Some(generation));
        }
        match done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => {
                if let Err(e) = result {
                    core.report_current(generation, ErrorKind::SendError, &e);
                }
            }
        }
    }
}
