//! Engine configuration and buffer sizing
//!
//! Defaults reproduce the behavior hosts expect out of the box; the
//! `with_*` builders adjust single values.

use std::time::Duration;

use crate::options::TlsVersion;

/// Bytes requested per socket read (4KB)
///
/// Each `DataReceived` event carries at most this many bytes.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Pending-connection backlog passed to `listen()`
pub const LISTEN_BACKLOG: i32 = 128;

/// Ciphertext staging buffer for the TLS record layer (16KB)
///
/// Large enough for one maximum-size TLS record.
pub const TLS_RECORD_BUFFER_SIZE: usize = 16 * 1024;

/// How long a TLS disconnect waits for its close-notify to be written
pub const CLOSE_NOTIFY_WAIT: Duration = Duration::from_millis(500);

/// Lowest TLS version new sessions accept
pub const DEFAULT_TLS_MIN_VERSION: TlsVersion = TlsVersion::Tls12;

/// Highest TLS version new sessions accept
pub const DEFAULT_TLS_MAX_VERSION: TlsVersion = TlsVersion::Tls13;

/// Name of the reactor thread
pub const REACTOR_THREAD_NAME: &str = "sockbridge-reactor";

/// Settings every TLS socket starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsDefaults {
    /// Reject chains that fail chain-of-trust validation
    pub verify_peer: bool,
    /// Check the certificate identity against the connect hostname
    pub verify_host: bool,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
}

impl Default for TlsDefaults {
    fn default() -> Self {
        Self {
            verify_peer: true,
            verify_host: true,
            min_version: DEFAULT_TLS_MIN_VERSION,
            max_version: DEFAULT_TLS_MAX_VERSION,
        }
    }
}

impl TlsDefaults {
    /// Accept any certificate chain.
    ///
    /// Only meant for tests against self-signed peers.
    #[must_use]
    pub const fn insecure() -> Self {
        Self {
            verify_peer: false,
            verify_host: false,
            min_version: DEFAULT_TLS_MIN_VERSION,
            max_version: DEFAULT_TLS_MAX_VERSION,
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes requested per socket read
    pub recv_buffer_size: usize,
    /// Backlog passed to `listen()`
    pub listen_backlog: i32,
    /// Name given to the reactor thread
    pub reactor_thread_name: String,
    /// Maximum handler invocations per `drain()`; `None` drains everything
    pub drain_limit: Option<usize>,
    /// Starting settings of every TLS socket
    pub tls_defaults: TlsDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: RECV_BUFFER_SIZE,
            listen_backlog: LISTEN_BACKLOG,
            reactor_thread_name: REACTOR_THREAD_NAME.to_string(),
            drain_limit: None,
            tls_defaults: TlsDefaults::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-read buffer size. Zero is raised to one byte.
    #[must_use]
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub const fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    #[must_use]
    pub fn with_reactor_thread_name(mut self, name: impl Into<String>) -> Self {
        self.reactor_thread_name = name.into();
        self
    }

    /// Cap how many handlers one `drain()` call runs.
    #[must_use]
    pub const fn with_drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_tls_defaults(mut self, defaults: TlsDefaults) -> Self {
        self.tls_defaults = defaults;
        self
    }
}
