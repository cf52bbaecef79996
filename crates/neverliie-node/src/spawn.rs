//! Detached process launch.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use neverliie_core::registry::LaunchDescriptor;

/// Spawn the descriptor's command detached from this process: null
/// stdio, its own process group, the descriptor's working directory.
/// The child is never waited on and outlives the caller.
pub fn spawn_detached(descriptor: &LaunchDescriptor) -> io::Result<()> {
    let Some((program, rest)) = descriptor.cmd.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty launch command",
        ));
    };

    let child = Command::new(program)
        .args(rest)
        .current_dir(&descriptor.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    tracing::debug!(pid = child.id(), program = %program, "detached child spawned");
    Ok(())
}

/// Launch descriptor for the currently running image.
///
/// A Rust peer is always a compiled binary, so this is binary mode with
/// the image path and its directory. Interpreter-hosted peers in the
/// suite register themselves with [`LaunchDescriptor::script`] instead.
pub fn self_descriptor() -> io::Result<LaunchDescriptor> {
    let image = std::env::current_exe()?;
    let cwd = image
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    Ok(LaunchDescriptor::binary(image.to_string_lossy(), cwd))
}
