//! neverliie-node — the NeverLiie peer runtime.
//!
//! One [`PeerNode`] per process. It enforces the singleton contract for
//! its peer name, registers itself in the shared launch registry, serves
//! its exposed operations to the rest of the suite, and is the client
//! engine for invoking operations on other peers — including waking
//! peers that are not running.

pub mod client;
pub mod error;
pub mod node;
pub mod server;
pub mod spawn;
pub mod transport;

pub use client::{IpcStream, Proxy, DEFAULT_CALL_TIMEOUT};
pub use error::{BootError, IpcError};
pub use node::PeerNode;
pub use server::{CallArgs, Operation, Producer, Response};
