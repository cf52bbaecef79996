//! On-disk peer registry — maps peer names to launch descriptors.
//!
//! The registry is one JSON object in the user's NeverLiie home
//! directory. Every peer upserts its own entry at boot; `wake` reads
//! entries to relaunch peers that are not running.
//!
//! Writers race: each mutation is a whole-file read-modify-write retried
//! a few times and then dropped. Last-writer-wins is acceptable because
//! every peer re-asserts its own entry on every boot. Readers treat a
//! missing or malformed file as an empty registry, so they may observe
//! any legal historical state while a writer is mid-flight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config;

// ── Launch descriptors ────────────────────────────────────────────────────────

/// How a peer's process image is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    Script,
    Binary,
}

/// Everything needed to relaunch a peer, as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    #[serde(rename = "type")]
    pub mode: LaunchMode,

    /// Detached-spawn argv. For `binary`, `cmd[0]` is the image; for
    /// `script`, `cmd[0]` is the interpreter and `cmd[1]` the script.
    pub cmd: Vec<String>,

    /// Absolute working directory for the child.
    pub cwd: PathBuf,

    /// Fields written by other releases of the suite. Preserved on
    /// rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LaunchDescriptor {
    pub fn binary(image: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            mode: LaunchMode::Binary,
            cmd: vec![image.into()],
            cwd: cwd.into(),
            extra: Map::new(),
        }
    }

    pub fn script(
        interpreter: impl Into<String>,
        script: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mode: LaunchMode::Script,
            cmd: vec![interpreter.into(), script.into()],
            cwd: cwd.into(),
            extra: Map::new(),
        }
    }

    /// The filesystem object this descriptor must point at to be
    /// launchable: the image for a binary, the script for a script.
    pub fn launch_target(&self) -> Option<&str> {
        let target = match self.mode {
            LaunchMode::Binary => self.cmd.first(),
            LaunchMode::Script => self.cmd.get(1),
        };
        target.map(String::as_str)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Registry I/O failures. Mutations log these and fail soft; nothing in
/// the runtime depends on a registry write having landed.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to encode registry: {0}")]
    Encode(serde_json::Error),
}

// ── Store ─────────────────────────────────────────────────────────────────────

const WRITE_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Handle on the registry file. Cheap to construct; every operation
/// re-reads the file, so concurrent writers in other processes are
/// tolerated.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// The host-user-scoped registry shared by the whole suite.
    pub fn open_default() -> Self {
        Self { path: config::registry_path() }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one entry. Absent, unreadable, and undecodable all come
    /// back as `None`.
    pub fn get(&self, name: &str) -> Option<LaunchDescriptor> {
        let map = self.load();
        let value = map.get(name)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Upsert one entry. Retries on write failure, then gives up with a
    /// warning (the peer re-asserts on its next boot).
    pub fn put(&self, name: &str, descriptor: &LaunchDescriptor) {
        let value = match serde_json::to_value(descriptor) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(peer = name, error = %e, "unencodable launch descriptor");
                return;
            }
        };
        self.mutate(|map| {
            map.insert(name.to_string(), value.clone());
        });
    }

    /// Remove one entry, under the same retry discipline as `put`.
    pub fn prune(&self, name: &str) {
        self.mutate(|map| {
            map.remove(name);
        });
    }

    /// Every entry that decodes as a launch descriptor.
    pub fn entries(&self) -> Vec<(String, LaunchDescriptor)> {
        self.load()
            .into_iter()
            .filter_map(|(name, value)| {
                serde_json::from_value(value).ok().map(|d| (name, d))
            })
            .collect()
    }

    /// Decode the file as a raw JSON map. Mutations work on this map, not
    /// on typed descriptors, so entries this release cannot decode still
    /// survive a rewrite.
    fn load(&self) -> Map<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Map::new(),
        }
    }

    fn mutate(&self, apply: impl Fn(&mut Map<String, Value>)) {
        for attempt in 0..WRITE_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(WRITE_BACKOFF);
            }
            let mut map = self.load();
            apply(&mut map);
            match self.store(&map) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "registry write failed"
                    );
                }
            }
        }
        tracing::warn!(
            path = %self.path.display(),
            "registry write dropped after {WRITE_ATTEMPTS} attempts"
        );
    }

    fn store(&self, map: &Map<String, Value>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Write(self.path.clone(), e))?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(map.clone()))
            .map_err(RegistryError::Encode)?;
        std::fs::write(&self.path, text)
            .map_err(|e| RegistryError::Write(self.path.clone(), e))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
