//! Driver connection handshake.
//!
//! # Responsibilities
//! - Read the version marker, auth key and wire format (all little-endian)
//! - Enforce size limits on length-prefixed fields
//! - Validate the auth key against the current credential snapshot
//! - Reply `SUCCESS\0` or `ERROR: <reason>\n\0`
//!
//! # Design Decisions
//! - Every read races the interruptor; cancellation aborts mid-read
//! - Oversized, truncated and malformed fields are distinct errors
//! - A failed handshake never yields a variant; the caller closes the socket

use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthKey, CredentialStore};
use crate::protocol::version::{ProtocolVariant, ProtocolVersion, WireFormat};

pub const SUCCESS_REPLY: &[u8] = b"SUCCESS\0";

/// Why a handshake did not complete.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    Closed,

    #[error("{what} too large: {len} bytes exceeds maximum of {max}")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("unsupported protocol version 0x{0:08x}")]
    UnknownVersion(u32),

    #[error("unsupported wire format 0x{0:08x}")]
    UnknownWireFormat(u32),

    #[error("incorrect authorization key")]
    BadCredential,

    #[error("handshake interrupted")]
    Interrupted,

    #[error("I/O error during handshake: {0}")]
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
            _ => HandshakeError::Io(e),
        }
    }
}

impl HandshakeError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::Closed => "closed",
            HandshakeError::TooLarge { .. } => "too_large",
            HandshakeError::Malformed { .. } => "malformed",
            HandshakeError::UnknownVersion(_) => "unknown_version",
            HandshakeError::UnknownWireFormat(_) => "unknown_wire_format",
            HandshakeError::BadCredential => "bad_credential",
            HandshakeError::Interrupted => "interrupted",
            HandshakeError::Io(_) => "io",
        }
    }

    /// Text sent to the client before closing, if the peer can still hear us.
    fn client_message(&self) -> Option<String> {
        match self {
            HandshakeError::Closed | HandshakeError::Interrupted | HandshakeError::Io(_) => None,
            HandshakeError::TooLarge { what, max, .. } => Some(format!(
                "Client provided an {} that is too long (maximum {} bytes).",
                what, max
            )),
            HandshakeError::Malformed { what, .. } => {
                Some(format!("Client provided a malformed {}.", what))
            }
            HandshakeError::UnknownVersion(_) => Some(
                "Received an unsupported protocol version. This port is for driver connections, \
                 not for HTTP or administrative access."
                    .to_string(),
            ),
            HandshakeError::UnknownWireFormat(_) => {
                Some("Unrecognized wire format specified.".to_string())
            }
            HandshakeError::BadCredential => Some("Incorrect authorization key.".to_string()),
        }
    }
}

/// Limits enforced while reading handshake fields.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    pub max_auth_key_size: usize,
}

impl Default for HandshakeLimits {
    fn default() -> Self {
        Self {
            max_auth_key_size: 2048,
        }
    }
}

async fn interruptible<T, F>(fut: F, interruptor: &CancellationToken) -> Result<T, HandshakeError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = interruptor.cancelled() => Err(HandshakeError::Interrupted),
        res = fut => res.map_err(HandshakeError::from),
    }
}

async fn read_u32_le<S>(stream: &mut S, interruptor: &CancellationToken) -> Result<u32, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    interruptible(stream.read_u32_le(), interruptor).await
}

/// Read a `u32` length followed by that many bytes of UTF-8.
///
/// A length above `max_size` fails before any payload is read.
pub async fn read_sized_string<S>(
    stream: &mut S,
    max_size: usize,
    what: &'static str,
    interruptor: &CancellationToken,
) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let len = read_u32_le(stream, interruptor).await? as usize;
    if len > max_size {
        return Err(HandshakeError::TooLarge {
            what,
            len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    interruptible(stream.read_exact(&mut buf), interruptor).await?;

    String::from_utf8(buf).map_err(|e| HandshakeError::Malformed {
        what,
        reason: e.to_string(),
    })
}

async fn read_handshake<S>(
    stream: &mut S,
    credentials: &dyn CredentialStore,
    limits: HandshakeLimits,
    interruptor: &CancellationToken,
) -> Result<ProtocolVariant, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let magic = read_u32_le(stream, interruptor).await?;
    let version = ProtocolVersion::from_magic(magic).ok_or(HandshakeError::UnknownVersion(magic))?;

    let presented = if version.carries_auth_key() {
        let key =
            read_sized_string(stream, limits.max_auth_key_size, "authorization key", interruptor)
                .await?;
        AuthKey::new(key)
    } else {
        AuthKey::default()
    };

    let format = if version.negotiates_wire_format() {
        let magic = read_u32_le(stream, interruptor).await?;
        WireFormat::from_magic(magic).ok_or(HandshakeError::UnknownWireFormat(magic))?
    } else {
        WireFormat::Packed
    };

    if !credentials.validate(&presented) {
        return Err(HandshakeError::BadCredential);
    }

    Ok(ProtocolVariant::new(version, format))
}

/// Run the handshake on a freshly accepted stream.
///
/// On success the `SUCCESS` reply has been flushed and the stream is
/// positioned at the first request frame.
pub async fn negotiate<S>(
    stream: &mut S,
    credentials: &dyn CredentialStore,
    limits: HandshakeLimits,
    interruptor: &CancellationToken,
) -> Result<ProtocolVariant, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_handshake(stream, credentials, limits, interruptor).await {
        Ok(variant) => {
            interruptible(stream.write_all(SUCCESS_REPLY), interruptor).await?;
            interruptible(stream.flush(), interruptor).await?;
            Ok(variant)
        }
        Err(e) => {
            if let Some(message) = e.client_message() {
                let reply = format!("ERROR: {}\n\0", message);
                // Best effort: the connection is closed either way.
                let _ = interruptible(stream.write_all(reply.as_bytes()), interruptor).await;
                let _ = interruptible(stream.flush(), interruptor).await;
            }
            Err(e)
        }
    }
}
