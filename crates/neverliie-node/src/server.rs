//! Server engine — accepts inbound connections and drives operations.
//!
//! One accept loop per node; every accepted connection gets its own
//! worker task. A connection carries exactly one request. Unary
//! operations answer with a single `ok` or `error` frame; streaming
//! operations register a task, answer `stream_start`, and pump
//! `progress` frames until the producer ends, fails, or is cancelled.
//!
//! Producers are synchronous and may block between yields, so they run
//! on blocking threads; their items reach the connection task over an
//! mpsc channel. Cancellation is cooperative: the producer loop checks a
//! fire-once signal between yields.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use neverliie_core::wire::{self, Envelope, WireError};

use crate::transport;

/// Pause before re-binding after a fatal accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// In-flight progress items buffered between the producer thread and the
/// connection task.
const STREAM_BUFFER: usize = 32;

// ── Operations ────────────────────────────────────────────────────────────────

/// Positional and keyword arguments of one invocation.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self { args, kwargs: Map::new() }
    }

    /// Nth positional argument, if present.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// A lazy sequence of values. `next` may block (sleep, wait on I/O); it
/// is always called from a blocking-capable thread, never from the async
/// runtime itself.
///
/// Cancellation is checked between yields only: a producer that blocks
/// forever inside one `next` call cannot be cancelled.
pub trait Producer: Send {
    /// `Ok(Some(v))` yields an item, `Ok(None)` ends the stream, `Err`
    /// aborts it with an error frame.
    fn next(&mut self) -> anyhow::Result<Option<Value>>;
}

impl<I> Producer for I
where
    I: Iterator<Item = Value> + Send,
{
    fn next(&mut self) -> anyhow::Result<Option<Value>> {
        Ok(Iterator::next(self))
    }
}

/// What an operation produced.
pub enum Response {
    /// A single value, sent as one `ok` frame.
    Value(Value),
    /// A lazy finite sequence, sent as a stream.
    Stream(Box<dyn Producer>),
}

impl Response {
    pub fn value(value: impl Into<Value>) -> Self {
        Response::Value(value.into())
    }

    /// Adapt an ordinary iterator into a stream response.
    pub fn stream<I>(items: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        Response::Stream(Box::new(items))
    }
}

/// A remotely callable operation.
pub trait Operation: Send + Sync {
    fn invoke(&self, call: CallArgs) -> anyhow::Result<Response>;
}

impl<F> Operation for F
where
    F: Fn(CallArgs) -> anyhow::Result<Response> + Send + Sync,
{
    fn invoke(&self, call: CallArgs) -> anyhow::Result<Response> {
        self(call)
    }
}

/// name → operation. Written during boot, read by connection workers.
pub(crate) type OperationTable = Arc<DashMap<String, Arc<dyn Operation>>>;

// ── Task table ────────────────────────────────────────────────────────────────

/// Fire-once cancellation signal shared between the task table and a
/// producer pump.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn fire(&self) {
        self.0.swap(true, Ordering::SeqCst);
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live streaming tasks. An entry exists exactly while its producer is
/// being pumped. The lock is held only around map access and signal
/// firing, never across I/O.
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: Mutex<HashMap<String, CancelSignal>>,
    next_id: AtomicU64,
}

impl TaskTable {
    /// Mint a fresh task id — unique for the server's lifetime — and
    /// register its signal.
    fn register(&self) -> (String, CancelSignal) {
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let signal = CancelSignal::default();
        self.lock().insert(id.clone(), signal.clone());
        (id, signal)
    }

    /// Fire a task's signal. Unknown ids — including already-finished
    /// tasks — are a no-op.
    pub fn cancel(&self, id: &str) {
        if let Some(signal) = self.lock().get(id) {
            signal.fire();
        }
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Fire everything still live. Used at teardown.
    pub fn cancel_all(&self) {
        for signal in self.lock().values() {
            signal.fire();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelSignal>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

enum StreamEvent {
    Item(Value),
    End,
    Failed(String),
}

pub(crate) struct ServerEngine {
    name: String,
    ops: OperationTable,
    tasks: Arc<TaskTable>,
    running: Arc<AtomicBool>,
}

impl ServerEngine {
    pub fn new(
        name: String,
        ops: OperationTable,
        tasks: Arc<TaskTable>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { name, ops, tasks, running }
    }

    /// Accept loop. A fatal accept error backs off and re-binds; the
    /// process stays live.
    pub async fn run(self: Arc<Self>, mut listener: UnixListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((conn, _)) => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.serve_connection(conn).await;
                    });
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!(peer = %self.name, error = %e, "accept failed, rebinding");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    match transport::listen(&self.name).await {
                        Ok(fresh) => listener = fresh,
                        Err(e) => {
                            tracing::warn!(peer = %self.name, error = %e, "rebind failed, keeping listener");
                        }
                    }
                }
            }
        }
    }

    /// One request per connection.
    async fn serve_connection(&self, mut conn: UnixStream) {
        let (method, args, kwargs) = match wire::read_envelope(&mut conn).await {
            Ok(Some(Envelope::Request { method, args, kwargs })) => (method, args, kwargs),
            Ok(Some(other)) => {
                tracing::debug!(peer = %self.name, kind = other.kind(), "dropping non-request frame");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(peer = %self.name, error = %e, "unreadable request");
                return;
            }
        };

        tracing::debug!(peer = %self.name, %method, "request");
        if let Err(e) = self.dispatch(&mut conn, &method, args, kwargs).await {
            tracing::debug!(peer = %self.name, %method, error = %e, "connection ended early");
        }
    }

    async fn dispatch(
        &self,
        conn: &mut UnixStream,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<(), WireError> {
        match method {
            "__ping__" => wire::write_envelope(conn, &Envelope::Pong).await,
            "__cancel_task__" => {
                if let Some(id) = kwargs.get("task_id").and_then(Value::as_str) {
                    self.tasks.cancel(id);
                }
                wire::write_envelope(conn, &Envelope::Ok { data: Value::Null }).await
            }
            _ => self.invoke_operation(conn, method, args, kwargs).await,
        }
    }

    async fn invoke_operation(
        &self,
        conn: &mut UnixStream,
        method: &str,
        args: Vec<Value>,
        mut kwargs: Map<String, Value>,
    ) -> Result<(), WireError> {
        let Some(operation) = self.ops.get(method).map(|entry| entry.value().clone()) else {
            let msg = format!("method not found: {method}");
            return wire::write_envelope(conn, &Envelope::Error { msg }).await;
        };

        // Underscore-prefixed keys are client-side switches; handlers
        // never see them.
        kwargs.retain(|key, _| !key.starts_with('_'));
        let call = CallArgs { args, kwargs };

        let outcome = tokio::task::spawn_blocking(move || operation.invoke(call)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let msg = format!("{e:#}");
                tracing::debug!(peer = %self.name, method, error = %msg, "operation failed");
                return wire::write_envelope(conn, &Envelope::Error { msg }).await;
            }
            Err(e) => {
                let msg = format!("operation aborted: {e}");
                return wire::write_envelope(conn, &Envelope::Error { msg }).await;
            }
        };

        match response {
            Response::Value(data) => {
                wire::write_envelope(conn, &Envelope::Ok { data }).await
            }
            Response::Stream(producer) => self.pump_stream(conn, producer).await,
        }
    }

    /// Drive one streaming task to its terminal frame.
    async fn pump_stream(
        &self,
        conn: &mut UnixStream,
        mut producer: Box<dyn Producer>,
    ) -> Result<(), WireError> {
        let (task_id, signal) = self.tasks.register();

        let start = Envelope::StreamStart { task_id: task_id.clone() };
        if let Err(e) = wire::write_envelope(conn, &start).await {
            self.tasks.remove(&task_id);
            return Err(e);
        }
        tracing::debug!(peer = %self.name, %task_id, "stream started");

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
        let pump_signal = signal.clone();
        tokio::task::spawn_blocking(move || {
            loop {
                if pump_signal.is_fired() {
                    break;
                }
                match producer.next() {
                    Ok(Some(item)) => {
                        if tx.blocking_send(StreamEvent::Item(item)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.blocking_send(StreamEvent::End);
                        break;
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(StreamEvent::Failed(format!("{e:#}")));
                        break;
                    }
                }
            }
        });

        let result = loop {
            match rx.recv().await {
                Some(StreamEvent::Item(item)) => {
                    // Stop forwarding buffered items once the task is
                    // cancelled; the client has already moved on.
                    if signal.is_fired() {
                        break wire::write_envelope(conn, &Envelope::StreamEnd).await;
                    }
                    let frame = Envelope::Progress { data: item };
                    if let Err(e) = wire::write_envelope(conn, &frame).await {
                        // Client went away; the producer stops within one
                        // yield via the signal.
                        signal.fire();
                        break Err(e);
                    }
                }
                Some(StreamEvent::End) => {
                    break wire::write_envelope(conn, &Envelope::StreamEnd).await;
                }
                Some(StreamEvent::Failed(msg)) => {
                    break wire::write_envelope(conn, &Envelope::Error { msg }).await;
                }
                // Producer stopped without a terminal event: cancelled
                // between yields.
                None => break wire::write_envelope(conn, &Envelope::StreamEnd).await,
            }
        };

        self.tasks.remove(&task_id);
        tracing::debug!(peer = %self.name, %task_id, "stream finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_ids_never_repeat() {
        let table = TaskTable::default();
        let (a, _) = table.register();
        let (b, _) = table.register();
        assert_ne!(a, b);
        table.remove(&a);
        let (c, _) = table.register();
        assert_ne!(a, c);
    }

    #[test]
    fn cancel_fires_once_and_tolerates_unknown_ids() {
        let table = TaskTable::default();
        let (id, signal) = table.register();
        assert!(!signal.is_fired());

        table.cancel(&id);
        table.cancel(&id);
        assert!(signal.is_fired());

        table.cancel("task-999");
        table.remove(&id);
        table.cancel(&id); // late cancel after removal is a no-op
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn iterator_producers_end_with_none() {
        let mut producer = vec![json!(1), json!(2)].into_iter();
        assert_eq!(Producer::next(&mut producer).unwrap(), Some(json!(1)));
        assert_eq!(Producer::next(&mut producer).unwrap(), Some(json!(2)));
        assert_eq!(Producer::next(&mut producer).unwrap(), None);
    }
}
