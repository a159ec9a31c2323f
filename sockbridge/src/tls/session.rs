//! TLS record layer over a reactor-driven TCP stream.
//!
//! The handshake runs first, alone on the stream. Once it completes the
//! session splits like a plain connection: the reader feeds ciphertext into
//! `rustls` and reports plaintext, the writer encrypts queued sends. Only
//! the writer puts bytes on the wire after the handshake; when the reader
//! needs something written (alerts, key updates) it queues a flush.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use rustls::ClientConnection;
use socket2::Socket;
use sockbridge_core::config::TLS_RECORD_BUFFER_SIZE;
use sockbridge_core::error::ErrorKind;
use sockbridge_core::event::CallbackEvent;
use sockbridge_core::fd;
use tracing::{debug, trace};

use super::config::TlsFailure;
use crate::socket::stream::{is_peer_close, peer_closed, Outgoing};
use crate::socket::{Lifecycle, SocketCore};

/// What one batch of ciphertext produced.
#[derive(Debug, Default)]
struct Absorbed {
    plaintext: Vec<u8>,
    peer_closed: bool,
    wants_write: bool,
}

/// Feed `ciphertext` to the connection and collect the plaintext it yields.
///
/// An empty batch still processes whatever `rustls` already buffered.
fn absorb(conn: &mut ClientConnection, mut ciphertext: &[u8]) -> io::Result<Absorbed> {
    let mut out = Absorbed::default();
    loop {
        if !ciphertext.is_empty() {
            conn.read_tls(&mut ciphertext)?;
        }
        let state = conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.peer_closed |= state.peer_has_closed();

        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let start = out.plaintext.len();
            out.plaintext.resize(start + available, 0);
            conn.reader().read_exact(&mut out.plaintext[start..])?;
        }
        if ciphertext.is_empty() {
            break;
        }
    }
    out.wants_write = conn.wants_write();
    Ok(out)
}

/// Run the handshake on the calling thread over a blocking descriptor.
pub(crate) fn handshake_blocking(conn: &mut ClientConnection, socket: &Socket) -> io::Result<()> {
    let mut io = socket;
    while conn.is_handshaking() {
        conn.complete_io(&mut io)?;
    }
    while conn.wants_write() {
        conn.write_tls(&mut io)?;
    }
    Ok(())
}

/// One TLS connection on the reactor.
pub(crate) struct Session {
    conn: RefCell<ClientConnection>,
    stream: TcpStream,
}

impl Session {
    pub(crate) fn new(conn: ClientConnection, socket: Socket) -> Self {
        Self {
            conn: RefCell::new(conn),
            stream: fd::adopt(socket),
        }
    }

    /// Write out every record `rustls` has queued.
    async fn flush(&self) -> io::Result<()> {
        loop {
            let mut records = Vec::new();
            {
                let mut conn = self.conn.borrow_mut();
                while conn.wants_write() {
                    conn.write_tls(&mut records)?;
                }
            }
            if records.is_empty() {
                return Ok(());
            }
            let mut writer = &self.stream;
            let BufResult(result, _) = writer.write_all(records).await;
            result?;
        }
    }

    /// Drive the client handshake to completion.
    pub(crate) async fn handshake(&self) -> io::Result<()> {
        loop {
            self.flush().await?;
            if !self.conn.borrow().is_handshaking() {
                return Ok(());
            }

            let mut reader = &self.stream;
            let BufResult(result, buf) =
                reader.read(Vec::with_capacity(TLS_RECORD_BUFFER_SIZE)).await;
            if result? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during TLS handshake",
                ));
            }
            let mut conn = self.conn.borrow_mut();
            let mut ciphertext = buf.as_slice();
            while !ciphertext.is_empty() {
                conn.read_tls(&mut ciphertext)?;
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
    }

    fn version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.borrow().protocol_version()
    }
}

/// Handshake a connection established on the reactor, then run it.
pub(crate) async fn connect(core: Arc<SocketCore>, session: Session, generation: u64) {
    if let Err(e) = session.handshake().await {
        if core.close_if_current(generation) {
            core.set_lifecycle(Lifecycle::Idle);
            let failure = TlsFailure::from_io(e);
            core.report(failure.kind, &failure.source);
        }
        return;
    }
    if !core.is_current(generation) {
        return;
    }
    established(&core, &session, generation);
    let outgoing = core.open_writer();
    core.emit_current(generation, CallbackEvent::Connected);
    run(core, session, outgoing, generation).await;
}

pub(crate) fn established(core: &SocketCore, session: &Session, generation: u64) {
    core.set_lifecycle(Lifecycle::Connected);
    let version = session.version();
    debug!(socket = %core.id(), generation, ?version, "TLS session established");
}

/// Run an established session until both directions are done.
pub(crate) async fn run(
    core: Arc<SocketCore>,
    session: Session,
    outgoing: flume::Receiver<Outgoing>,
    generation: u64,
) {
    let Some(flusher) = core.writer() else {
        return;
    };
    futures::future::join(
        read_loop(&core, &session, flusher, generation),
        write_loop(&core, &session, outgoing, generation),
    )
    .await;
    trace!(socket = %core.id(), generation, "session tasks finished");
}

/// A failed secure read reports the error, then the lost connection.
fn receive_failed(core: &SocketCore, generation: u64, err: &io::Error) {
    core.report_current(generation, ErrorKind::RecvError, err);
    peer_closed(core, generation);
}

async fn read_loop(
    core: &SocketCore,
    session: &Session,
    flusher: flume::Sender<Outgoing>,
    generation: u64,
) {
    let chunk = core.ctx().config.recv_buffer_size;
    // Plaintext can arrive together with the final handshake flight
    let mut batch = Vec::new();
    loop {
        let absorbed = absorb(&mut session.conn.borrow_mut(), &batch);
        let absorbed = match absorbed {
            Ok(absorbed) => absorbed,
            Err(e) => return receive_failed(core, generation, &e),
        };

        for piece in absorbed.plaintext.chunks(chunk) {
            trace!(socket = %core.id(), bytes = piece.len(), "decrypted");
            let event = CallbackEvent::DataReceived(Bytes::copy_from_slice(piece));
            if !core.emit_current(generation, event) {
                return;
            }
        }
        if absorbed.wants_write {
            let _ = flusher.send(Outgoing::Flush);
        }
        if absorbed.peer_closed {
            return peer_closed(core, generation);
        }

        let mut reader = &session.stream;
        let BufResult(result, buf) = reader.read(Vec::with_capacity(TLS_RECORD_BUFFER_SIZE)).await;
        match result {
            Ok(0) => return peer_closed(core, generation),
            Ok(_) => batch = buf,
            Err(e) if is_peer_close(&e) => return peer_closed(core, generation),
            Err(e) => return receive_failed(core, generation, &e),
        }
    }
}

async fn write_loop(
    core: &SocketCore,
    session: &Session,
    outgoing: flume::Receiver<Outgoing>,
    generation: u64,
) {
    while let Ok(item) = outgoing.recv_async().await {
        match item {
            Outgoing::Data { data, done, counted } => {
                let staged = session.conn.borrow_mut().writer().write_all(&data);
                let result = match staged {
                    Ok(()) => session.flush().await,
                    Err(e) => Err(e),
                };
                trace!(socket = %core.id(), bytes = data.len(), ok = result.is_ok(), "encrypted");

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
            Outgoing::Flush => {
                if let Err(e) = session.flush().await {
                    core.report_current(generation, ErrorKind::SendError, &e);
                }
            }
            Outgoing::Close { done } => {
                session.conn.borrow_mut().send_close_notify();
                if let Err(e) = session.flush().await {
                    trace!(socket = %core.id(), error = %e, "close-notify not delivered");
                }
                let _ = done.send(());
            }
        }
    }
}
