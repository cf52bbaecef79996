//! Client engine — dialing peers, unary calls, streams, wake.
//!
//! Every call rides its own connection. Unary calls wait for one reply
//! under a wall-clock deadline; streaming calls hand back an
//! [`IpcStream`] whose cancellation travels out-of-band on a fresh,
//! short-lived connection.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::net::UnixStream;
use tokio::time::timeout;

use neverliie_core::registry::Registry;
use neverliie_core::wire::{self, Envelope};

use crate::error::IpcError;
use crate::{spawn, transport};

/// Default deadline for unary replies and stream headers.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed budget for liveness probes and cancel round trips.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll cadence while waiting for a woken peer to come up.
const WAKE_POLL: Duration = Duration::from_millis(100);

/// True if `name` answers a liveness probe within one second. Any
/// failure — offline, slow, or talking garbage — is `false`.
pub async fn ping(name: &str) -> bool {
    let probe = async {
        let mut conn = transport::dial(name).await.ok()?;
        let request = request_envelope("__ping__", Vec::new(), Map::new());
        wire::write_envelope(&mut conn, &request).await.ok()?;
        match wire::read_envelope(&mut conn).await {
            Ok(Some(Envelope::Pong)) => Some(()),
            _ => None,
        }
    };
    timeout(PROBE_TIMEOUT, probe).await.ok().flatten().is_some()
}

/// One unary invocation of `method` on `target`.
///
/// The deadline is wall-clock, measured from the moment the request has
/// left; the server may still run the handler to completion after a
/// timeout — there is no unary abort.
pub async fn call(
    target: &str,
    method: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    deadline: Duration,
) -> Result<Value, IpcError> {
    let mut conn = dial_checked(target).await?;
    let request = request_envelope(method, args, kwargs);
    wire::write_envelope(&mut conn, &request)
        .await
        .map_err(|e| IpcError::Protocol(e.to_string()))?;

    let reply = match timeout(deadline, wire::read_envelope(&mut conn)).await {
        Err(_) => return Err(IpcError::Timeout(deadline)),
        Ok(read) => read.map_err(|e| IpcError::Protocol(e.to_string()))?,
    };

    match reply {
        Some(Envelope::Ok { data }) => Ok(data),
        Some(Envelope::Error { msg }) => Err(IpcError::Remote(msg)),
        Some(other) => Err(IpcError::Protocol(format!(
            "unexpected {} reply to unary call",
            other.kind()
        ))),
        None => Err(IpcError::Protocol("connection closed before reply".into())),
    }
}

/// Begin a streaming invocation and return the live stream.
pub async fn stream(
    target: &str,
    method: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) -> Result<IpcStream, IpcError> {
    let mut conn = dial_checked(target).await?;
    let request = request_envelope(method, args, kwargs);
    wire::write_envelope(&mut conn, &request)
        .await
        .map_err(|e| IpcError::Protocol(e.to_string()))?;

    let header = match timeout(DEFAULT_CALL_TIMEOUT, wire::read_envelope(&mut conn)).await {
        Err(_) => return Err(IpcError::Timeout(DEFAULT_CALL_TIMEOUT)),
        Ok(read) => read.map_err(|e| IpcError::Protocol(e.to_string()))?,
    };

    match header {
        Some(Envelope::StreamStart { task_id }) => Ok(IpcStream {
            target: target.to_string(),
            task_id,
            conn: Some(conn),
        }),
        Some(Envelope::Error { msg }) => Err(IpcError::Remote(msg)),
        Some(other) => Err(IpcError::Protocol(format!(
            "unexpected {} instead of stream header",
            other.kind()
        ))),
        None => Err(IpcError::Protocol("connection closed before stream header".into())),
    }
}

/// Launch `name` from its registry entry and wait for it to answer.
///
/// Never called implicitly: the runtime's contract is explicit
/// lifecycle management (`ping`, then `wake`, then call).
pub async fn wake(registry: &Registry, name: &str, deadline: Duration) -> Result<(), IpcError> {
    let Some(descriptor) = registry.get(name) else {
        return Err(IpcError::PeerOffline(name.to_string()));
    };

    // Read the launch target out of the descriptor before any use; an
    // entry whose file is gone is pruned, and nothing is spawned.
    let launchable = descriptor
        .launch_target()
        .map(|t| Path::new(t).exists())
        .unwrap_or(false);
    if !launchable {
        tracing::info!(peer = name, "pruning stale registry entry");
        registry.prune(name);
        return Err(IpcError::PeerOffline(name.to_string()));
    }

    spawn::spawn_detached(&descriptor).map_err(|e| {
        tracing::warn!(peer = name, error = %e, "detached spawn failed");
        IpcError::PeerOffline(name.to_string())
    })?;

    let started = Instant::now();
    while started.elapsed() < deadline {
        if ping(name).await {
            return Ok(());
        }
        tokio::time::sleep(WAKE_POLL).await;
    }
    Err(IpcError::PeerOffline(name.to_string()))
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

/// Typed handle on a remote peer — the runtime's rendition of an
/// attribute-magic proxy: one entry point per call shape, with the
/// client-side switches as explicit parameters.
#[derive(Debug, Clone)]
pub struct Proxy {
    target: String,
}

impl Proxy {
    /// Pure factory; no I/O happens until a call.
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, IpcError> {
        call(&self.target, method, args, kwargs, DEFAULT_CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        deadline: Duration,
    ) -> Result<Value, IpcError> {
        call(&self.target, method, args, kwargs, deadline).await
    }

    pub async fn stream(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<IpcStream, IpcError> {
        stream(&self.target, method, args, kwargs).await
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// A live stream of results from a remote operation.
///
/// Items arrive in producer order. Dropping the stream closes its
/// connection, which the server notices within one yield; [`cancel`]
/// additionally tells the server so the task is torn down promptly.
///
/// [`cancel`]: IpcStream::cancel
pub struct IpcStream {
    target: String,
    task_id: String,
    conn: Option<UnixStream>,
}

impl IpcStream {
    /// Server-side task id, as announced in the stream header.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next item, or `Ok(None)` once the stream is over. Both a
    /// `stream_end` frame and transport EOF end iteration cleanly.
    pub async fn next(&mut self) -> Result<Option<Value>, IpcError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        match wire::read_envelope(conn).await {
            Ok(Some(Envelope::Progress { data })) => Ok(Some(data)),
            Ok(Some(Envelope::StreamEnd)) | Ok(None) => {
                self.conn = None;
                Ok(None)
            }
            Ok(Some(Envelope::Error { msg })) => {
                self.conn = None;
                Err(IpcError::Remote(msg))
            }
            Ok(Some(other)) => {
                self.conn = None;
                Err(IpcError::Protocol(format!(
                    "unexpected {} frame in stream",
                    other.kind()
                )))
            }
            Err(e) => {
                self.conn = None;
                Err(IpcError::Protocol(e.to_string()))
            }
        }
    }

    /// Drain every remaining item.
    pub async fn collect(mut self) -> Result<Vec<Value>, IpcError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Stop the stream and tell the server to cancel the task.
    /// Idempotent; the cancel rides its own connection with a fixed
    /// one-second budget, independent of any call deadline.
    pub async fn cancel(&mut self) {
        if self.conn.take().is_none() {
            return;
        }

        let mut kwargs = Map::new();
        kwargs.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        let request = request_envelope("__cancel_task__", Vec::new(), kwargs);

        let target = self.target.clone();
        let round_trip = async {
            let mut conn = transport::dial(&target).await.ok()?;
            wire::write_envelope(&mut conn, &request).await.ok()?;
            // Reply is discarded; the server acknowledges unknown ids too.
            let _ = wire::read_envelope(&mut conn).await;
            Some(())
        };
        if timeout(PROBE_TIMEOUT, round_trip).await.ok().flatten().is_none() {
            tracing::debug!(target = %self.target, task_id = %self.task_id, "cancel round trip failed");
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn dial_checked(target: &str) -> Result<UnixStream, IpcError> {
    transport::dial(target).await.map_err(|e| {
        tracing::debug!(target, error = %e, "dial failed");
        IpcError::PeerOffline(target.to_string())
    })
}

fn request_envelope(method: &str, args: Vec<Value>, mut kwargs: Map<String, Value>) -> Envelope {
    // Client-side switches never become part of the remote contract.
    kwargs.remove("_timeout");
    kwargs.remove("_stream");
    Envelope::Request { method: method.to_string(), args, kwargs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_strips_client_switches() {
        let mut kwargs = Map::new();
        kwargs.insert("_timeout".to_string(), Value::from(1.0));
        kwargs.insert("_stream".to_string(), Value::Bool(true));
        kwargs.insert("depth".to_string(), Value::from(3));

        match request_envelope("scan", Vec::new(), kwargs) {
            Envelope::Request { kwargs, .. } => {
                assert_eq!(kwargs.len(), 1);
                assert!(kwargs.contains_key("depth"));
            }
            other => panic!("expected request, got {}", other.kind()),
        }
    }
}
