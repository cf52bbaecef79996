//! Host-local duplex transport — UNIX domain sockets keyed by peer name.
//!
//! The endpoint for peer `name` is `<runtime-dir>/NeverLiie_<name>`. Bind
//! is exclusive: a second listener for the same name fails immediately. A
//! socket file left behind by a crashed peer is told apart from a live
//! listener by dialing it — nobody answers a stale file — and recovered
//! by unlinking.

use std::io;

use tokio::net::{UnixListener, UnixStream};

use neverliie_core::config;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// Someone is listening on this name right now.
    #[error("endpoint already has a live listener")]
    InUse,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connect to `name`'s endpoint. Fails fast when no listener is bound.
pub async fn dial(name: &str) -> io::Result<UnixStream> {
    UnixStream::connect(config::endpoint_path(name)).await
}

/// Bind `name`'s endpoint exclusively.
pub async fn listen(name: &str) -> Result<UnixListener, BindError> {
    let path = config::endpoint_path(name);
    match UnixListener::bind(&path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(BindError::InUse);
            }
            // Leftover from a crash: reclaim the path and try once more.
            tracing::debug!(path = %path.display(), "removing stale endpoint");
            std::fs::remove_file(&path)?;
            match UnixListener::bind(&path) {
                Ok(listener) => Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(BindError::InUse),
                Err(e) => Err(BindError::Io(e)),
            }
        }
        Err(e) => Err(BindError::Io(e)),
    }
}

/// Remove `name`'s endpoint file. Idempotent; used on shutdown.
pub fn unbind(name: &str) {
    let _ = std::fs::remove_file(config::endpoint_path(name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unique_name(tag: &str) -> String {
        format!("transport-{tag}-{}", std::process::id())
    }

    #[tokio::test]
    async fn listen_then_dial_round_trips_bytes() {
        let name = unique_name("echo");
        let listener = listen(&name).await.unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = dial(&name).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
        unbind(&name);
    }

    #[tokio::test]
    async fn second_listener_fails_immediately() {
        let name = unique_name("exclusive");
        let _listener = listen(&name).await.unwrap();

        match listen(&name).await {
            Err(BindError::InUse) => {}
            other => panic!("expected InUse, got {other:?}"),
        }
        unbind(&name);
    }

    #[tokio::test]
    async fn dial_without_listener_fails_fast() {
        let name = unique_name("nobody");
        unbind(&name);
        assert!(dial(&name).await.is_err());
    }

    #[tokio::test]
    async fn stale_endpoint_is_reclaimed() {
        let name = unique_name("stale");
        let listener = listen(&name).await.unwrap();
        // Dropping the listener leaves the socket file behind, exactly
        // like a crashed peer.
        drop(listener);
        assert!(config::endpoint_path(&name).exists());

        let _listener = listen(&name).await.unwrap();
        unbind(&name);
    }
}
