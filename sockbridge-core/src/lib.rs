//! Sockbridge Core
//!
//! This crate contains the reactor-agnostic building blocks of the engine:
//! - Protocol tags (`protocol`)
//! - Endpoint resolution and dual-stack selection (`endpoint`)
//! - Socket option catalogue and pre-descriptor option queue (`options`)
//! - Socket identities and owned callback events (`event`)
//! - Cross-thread callback queue (`queue`)
//! - Error taxonomy and the engine error type (`error`)
//! - Tunables and engine configuration (`config`)
//! - Descriptor hand-off between `socket2` and `compio` (`fd`)

// The fd module needs raw descriptor access for ownership transfer and sockopts
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fd;
pub mod options;
pub mod protocol;
pub mod queue;

// A small prelude so the engine crate and tests can pull the common types in one line.
pub mod prelude {
    pub use crate::config::{EngineConfig, TlsDefaults};
    pub use crate::endpoint::{Candidates, Family, ResolveScope};
    pub use crate::error::{EngineError, ErrorKind, Result};
    pub use crate::event::{CallbackEvent, EventKind, SocketId};
    pub use crate::options::{DualStack, OptionScope, SocketOption, TlsPathOption, TlsVersion};
    pub use crate::protocol::Protocol;
    pub use crate::queue::CallbackQueue;
}
