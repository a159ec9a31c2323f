//! TLS client sessions.
//!
//! A TLS socket is a TCP socket with a handshake between connect and
//! `Connected`, and the record layer between the application and the
//! stream. Connection setup (resolution, fallback across endpoints) is
//! shared with plain TCP. TLS sockets never listen.

pub(crate) mod config;
pub(crate) mod session;

use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::ClientConnection;
use sockbridge_core::config::CLOSE_NOTIFY_WAIT;
use sockbridge_core::endpoint;
use sockbridge_core::error::{EngineError, ErrorKind, Result};
use sockbridge_core::event::CallbackEvent;
use sockbridge_core::options::{OptionScope, SocketOption, TlsPathOption};
use tracing::{debug, trace};

use crate::socket::stream::{self, Outgoing};
use crate::socket::tcp::{connect_failed, establish, establish_blocking, reset_for_connect};
use crate::socket::{resolve_off_reactor, IoMode, Lifecycle, SocketCore, SocketOps};
use config::{TlsFailure, TlsSettings};
use session::Session;

pub(crate) struct TlsSocket {
    core: Arc<SocketCore>,
    settings: Mutex<TlsSettings>,
}

impl TlsSocket {
    pub(crate) fn new(core: Arc<SocketCore>) -> Self {
        let settings = TlsSettings::new(core.ctx().config.tls_defaults);
        Self {
            core,
            settings: Mutex::new(settings),
        }
    }

    pub(crate) fn core_handle(&self) -> &Arc<SocketCore> {
        &self.core
    }

    /// Set up the client side of a session for `host`.
    fn client(&self, host: &str) -> std::result::Result<ClientConnection, TlsFailure> {
        let config = self.settings.lock().client_config()?;
        let name = ServerName::try_from(host.to_owned()).map_err(|e| TlsFailure {
            kind: ErrorKind::TlsHandshakeError,
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        let mut conn = ClientConnection::new(config, name).map_err(TlsFailure::from_rustls)?;
        // Plaintext is handed out as soon as it is decrypted
        conn.set_buffer_limit(None);
        Ok(conn)
    }

    fn handshake_failed(&self, failure: TlsFailure) -> EngineError {
        self.core.close();
        self.core.set_lifecycle(Lifecycle::Idle);
        self.core.fail(failure.kind, failure.source)
    }

    fn connect_blocking(&self, mut conn: ClientConnection, host: &str, port: u16) -> Result<()> {
        let core = &self.core;
        let candidates = core
            .select(endpoint::resolve(host, port, core.resolve_scope()))
            .map_err(|e| {
                core.set_lifecycle(Lifecycle::Idle);
                e
            })?;
        let est = establish_blocking(core, &candidates).map_err(|e| connect_failed(core, e))?;
        let (generation, copy) = core
            .connected(est, Lifecycle::Handshaking)
            .map_err(|e| connect_failed(core, e))?;

        if let Err(e) = session::handshake_blocking(&mut conn, &copy) {
            return Err(self.handshake_failed(TlsFailure::from_io(e)));
        }

        let outgoing = core.open_writer();
        let task_core = Arc::clone(core);
        core.ctx().reactor.submit(move || async move {
            let session = Session::new(conn, copy);
            session::established(&task_core, &session, generation);
            task_core.emit_current(generation, CallbackEvent::Connected);
            session::run(task_core, session, outgoing, generation).await;
        })
    }
}

impl SocketOps for TlsSocket {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn bind(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        crate::socket::bind(&self.core, host, port, mode)
    }

    fn connect(self: Arc<Self>, host: &str, port: u16, mode: IoMode) -> Result<()> {
        let core = &self.core;
        core.check_host(host)?;
        // Configuration errors surface before any network activity
        let conn = self.client(host).map_err(|f| core.fail(f.kind, f.source))?;
        reset_for_connect(core);

        match mode {
            IoMode::Blocking => self.connect_blocking(conn, host, port),
            IoMode::Async => {
                let core = Arc::clone(core);
                let host = host.to_owned();
                let scope = core.resolve_scope();
                self.core.ctx().reactor.submit(move || async move {
                    let resolved = resolve_off_reactor(host, port, scope).await;
                    let Ok(candidates) = core.select(resolved) else {
                        core.set_lifecycle(Lifecycle::Idle);
                        return;
                    };
                    let armed = match establish(&core, &candidates).await {
                        Ok(est) => core.connected(est, Lifecycle::Handshaking),
                        Err(e) => Err(e),
                    };
                    let (generation, copy) = match armed {
                        Ok(armed) => armed,
                        Err(e) => {
                            connect_failed(&core, e);
                            return;
                        }
                    };
                    debug!(socket = %core.id(), generation, "TLS handshake started");
                    session::connect(core, Session::new(conn, copy), generation).await;
                })
            }
        }
    }

    fn send(self: Arc<Self>, data: &[u8], mode: IoMode) -> Result<()> {
        stream::send(&self.core, data, mode, false)
    }

    /// Send close-notify, then close the transport.
    fn disconnect(&self) -> Result<()> {
        let core = &self.core;
        if let Some(writer) = core.writer() {
            // The writer runs on the reactor; waiting there would deadlock
            if !core.ctx().reactor.on_reactor_thread() {
                let (done, acked) = flume::bounded(1);
                let sent = writer.send(Outgoing::Close { done }).is_ok();
                if sent && acked.recv_timeout(CLOSE_NOTIFY_WAIT).is_err() {
                    trace!(socket = %core.id(), "close-notify not acknowledged");
                }
            }
        }
        if core.close() {
            core.emit(CallbackEvent::Disconnected);
        }
        Ok(())
    }

    fn set_option(&self, option: SocketOption, value: i32) -> Result<()> {
        if option.scope() != OptionScope::Tls {
            return self.core.set_option(option, value);
        }
        self.settings
            .lock()
            .set(option, value)
            .map_err(|e| self.core.fail(ErrorKind::TlsVersionError, e))
    }

    fn get_option(&self, option: SocketOption) -> Result<i32> {
        match self.settings.lock().get(option) {
            Some(value) => Ok(value),
            None => self.core.get_option(option),
        }
    }

    fn set_tls_option_path(&self, option: TlsPathOption, path: &Path) -> Result<()> {
        self.settings.lock().load(option, path)
    }
}
