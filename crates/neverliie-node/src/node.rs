//! The Peer Node — one object whose lifetime is the process's.
//!
//! Construction runs the boot sequence: singleton check, listener bind,
//! registry self-registration, accept loop. Teardown unwinds it: stop
//! accepting, fire in-flight stream signals, release the endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};

use neverliie_core::config;
use neverliie_core::registry::{LaunchDescriptor, Registry};

use crate::client::{self, Proxy, DEFAULT_CALL_TIMEOUT};
use crate::error::{BootError, IpcError};
use crate::server::{Operation, OperationTable, ServerEngine, TaskTable};
use crate::{spawn, transport};

pub struct PeerNode {
    name: String,
    registry: Registry,
    ops: OperationTable,
    tasks: Arc<TaskTable>,
    running: Arc<AtomicBool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl PeerNode {
    /// Boot under `name`, registering this image's own launch descriptor.
    pub async fn bind(name: &str) -> Result<Self, BootError> {
        let descriptor = spawn::self_descriptor().map_err(BootError::Descriptor)?;
        Self::bind_with_descriptor(name, descriptor).await
    }

    /// Boot under `name`, registering `descriptor` as the relaunch
    /// recipe. Use this when the image needs arguments (or an
    /// interpreter) to come back as this peer.
    pub async fn bind_with_descriptor(
        name: &str,
        descriptor: LaunchDescriptor,
    ) -> Result<Self, BootError> {
        if !config::valid_peer_name(name) {
            return Err(BootError::InvalidName(name.to_string()));
        }

        // Singleton check: anyone answering on our endpoint makes us the
        // duplicate.
        if transport::dial(name).await.is_ok() {
            return Err(BootError::AlreadyRunning(name.to_string()));
        }
        let listener = match transport::listen(name).await {
            Ok(listener) => listener,
            // Lost the race between the dial probe and the bind.
            Err(transport::BindError::InUse) => {
                return Err(BootError::AlreadyRunning(name.to_string()));
            }
            Err(transport::BindError::Io(e)) => {
                return Err(BootError::Bind { name: name.to_string(), source: e });
            }
        };

        let registry = Registry::open_default();
        registry.put(name, &descriptor);

        let ops: OperationTable = Arc::new(DashMap::new());
        let tasks = Arc::new(TaskTable::default());
        let running = Arc::new(AtomicBool::new(true));
        let engine = Arc::new(ServerEngine::new(
            name.to_string(),
            ops.clone(),
            tasks.clone(),
            running.clone(),
        ));
        let accept_task = tokio::spawn(engine.run(listener));

        tracing::info!(peer = name, "peer node online");
        Ok(Self {
            name: name.to_string(),
            registry,
            ops,
            tasks,
            running,
            accept_task,
        })
    }

    /// Boot or leave — the singleton contract for binaries. A duplicate
    /// instance is not an error; it exits with code 0.
    pub async fn bind_or_exit(name: &str) -> Self {
        match Self::bind(name).await {
            Ok(node) => node,
            Err(BootError::AlreadyRunning(_)) => {
                eprintln!("[neverliie] {name} is already running. Exiting.");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("[neverliie] {name} failed to start: {e}");
                std::process::exit(1);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register an operation under `name`. Callable by any peer.
    pub fn expose(&self, name: impl Into<String>, operation: impl Operation + 'static) {
        let name = name.into();
        tracing::debug!(peer = %self.name, operation = %name, "operation exposed");
        self.ops.insert(name, Arc::new(operation));
    }

    /// Proxy for a remote peer. Pure factory — no I/O happens here.
    pub fn get_peer(&self, target: &str) -> Proxy {
        Proxy::new(target)
    }

    /// Liveness probe with a fixed one-second budget.
    pub async fn ping(&self, target: &str) -> bool {
        client::ping(target).await
    }

    /// Launch `target` from its registry entry and wait up to `deadline`
    /// for it to answer.
    pub async fn wake(&self, target: &str, deadline: Duration) -> Result<(), IpcError> {
        client::wake(&self.registry, target, deadline).await
    }

    /// Opt-in composition of the explicit lifecycle: ping, wake if
    /// offline, then call. Nothing else in the runtime wakes implicitly.
    pub async fn call_waking(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        wake_deadline: Duration,
    ) -> Result<Value, IpcError> {
        if !client::ping(target).await {
            self.wake(target, wake_deadline).await?;
        }
        client::call(target, method, args, kwargs, DEFAULT_CALL_TIMEOUT).await
    }

    /// Streaming tasks currently live on this node's server.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting, cancel in-flight streams, release the endpoint.
    /// Outstanding connections complete on their own.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.accept_task.abort();
        let _ = self.accept_task.await;
        self.tasks.cancel_all();
        transport::unbind(&self.name);
        tracing::info!(peer = %self.name, "peer node stopped");
    }
}
