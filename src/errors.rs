//! Host-level error taxonomy.
//!
//! Recoverable errors are translated at the router boundary into ordinary
//! failed-operation results; only a reentrancy violation is fatal and that one
//! never surfaces here (see `guard`).

use perch_plugin_api::ModuleError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    /// A module declared a contract version below the host minimum.
    /// The load is refused; compatibility is never guessed.
    #[error("module '{name}' was built against contract v{found}, host requires at least v{min}")]
    VersionMismatch { name: String, found: u32, min: u32 },

    /// A module failed to load. Remembered by the registry so the user is not
    /// re-prompted on every refresh.
    #[error("module '{name}' failed to load: {reason}")]
    LoadFailure { name: String, reason: String },

    /// The router declined an optional call the session does not support.
    #[error("operation not supported by this namespace")]
    NotSupported,

    /// An Opening session failed its backend handshake. The session is
    /// discarded and the caller sees an ordinary navigation failure.
    #[error("could not open '{path}': {reason}")]
    Handshake { path: String, reason: String },

    /// No registered namespace matches the path's name part.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// The path does not parse as `<namespace>:<remainder>`.
    #[error("malformed path: {0}")]
    BadPath(String),

    /// A backend call failed mid-operation. The session stays open; its
    /// capability cache may have shrunk.
    #[error("{0}")]
    Backend(#[from] ModuleError),

    /// Unload refused while the module still has open sessions.
    #[error("module '{0}' still has open sessions")]
    SessionsOpen(String),

    /// The addressed session no longer exists (closed or never opened).
    #[error("no such session")]
    NoSuchSession,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type HostResult<T> = Result<T, HostError>;
