//! Error surface of the peer runtime.

use std::time::Duration;

/// Errors surfaced to callers of the client engine. Raw transport and
/// decode failures never leak; they are folded into these kinds.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The target is not running and, for `wake`, could not be launched.
    #[error("peer '{0}' is offline")]
    PeerOffline(String),

    /// No reply arrived within the caller's deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The remote handler failed; the message is its error text.
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// The peer spoke something that is not valid protocol for the
    /// current phase. The connection is closed before this is returned.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Errors that can abort the boot sequence.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Another process already owns this peer name. Not a failure at the
    /// process level: binaries exit with code 0 (see
    /// `PeerNode::bind_or_exit`).
    #[error("peer '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid peer name '{0}'")]
    InvalidName(String),

    #[error("could not determine own launch descriptor: {0}")]
    Descriptor(std::io::Error),

    #[error("failed to bind endpoint for '{name}': {source}")]
    Bind {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
