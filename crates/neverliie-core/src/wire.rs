//! NeverLiie wire format — envelopes exchanged between peers.
//!
//! Every message on a connection is one self-delimited frame: a u32
//! big-endian body length, then a one-byte wire version, then a JSON
//! document describing the envelope. The JSON layout is private to the
//! runtime, but field names are stable because peers from different
//! releases of the suite talk to each other.
//!
//! The framing carries no channel or sequence numbers. A connection is
//! one call; ordering within it comes from the transport.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current wire version. A receiver seeing any other version rejects the
/// frame with `WireError::UnknownVersion`.
pub const WIRE_VERSION: u8 = 0x01;

/// Ceiling on one frame's body, version byte included. Anything larger is
/// a protocol violation, not a big message.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// client → server: invoke `method` with positional and keyword
    /// arguments.
    Request {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    /// server → client: unary success.
    Ok { data: Value },
    /// server → client: the handler failed; `msg` is its error text.
    Error { msg: String },
    /// server → client: liveness reply.
    Pong,
    /// server → client: a streaming handler started. `task_id` names the
    /// server-side task for out-of-band cancellation.
    StreamStart { task_id: String },
    /// server → client: one streamed item.
    Progress { data: Value },
    /// server → client: the stream completed normally.
    StreamEnd,
}

impl Envelope {
    /// Discriminator name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "request",
            Envelope::Ok { .. } => "ok",
            Envelope::Error { .. } => "error",
            Envelope::Pong => "pong",
            Envelope::StreamStart { .. } => "stream_start",
            Envelope::Progress { .. } => "progress",
            Envelope::StreamEnd => "stream_end",
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("frame of {0} bytes exceeds maximum {MAX_FRAME}")]
    FrameTooLarge(usize),

    #[error("frame too short to carry a version byte")]
    EmptyFrame,

    #[error("peer closed mid-frame")]
    Truncated,

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Write one envelope as a single frame and flush it.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope)?;
    let len = body.len() + 1;
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut frame = BytesMut::with_capacity(4 + len);
    frame.put_u32(len as u32);
    frame.put_u8(WIRE_VERSION);
    frame.put_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope. `Ok(None)` means the peer closed cleanly at a frame
/// boundary; EOF inside a frame is `WireError::Truncated`.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    if !fill_or_eof(reader, &mut prefix).await? {
        return Ok(None);
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;

    let version = body[0];
    if version != WIRE_VERSION {
        return Err(WireError::UnknownVersion(version));
    }

    Ok(Some(serde_json::from_slice(&body[1..])?))
}

/// Fill `buf` completely. `Ok(false)` if EOF arrived before the first
/// byte; EOF after a partial read is `Truncated`.
async fn fill_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(WireError::Truncated);
        }
        filled += n;
    }
    Ok(true)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
