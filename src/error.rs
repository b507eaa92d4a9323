//! Typed error taxonomy for the protocol core.
//!
//! Collaborators below the core (certificate loading, ASN.1/PEM parsing, file I/O)
//! keep using `anyhow::Result` as the teacher codebase does; this enum exists
//! specifically so that handshake and interaction-client callers can match on
//! *kind* instead of parsing message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatterError {
    #[error("transport error: {0}")]
    TransportError(String),

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("protocol mismatch: expected opcode {expected:#x}, got {got:#x}")]
    ProtocolMismatch { expected: u8, got: u8 },

    #[error("peer returned status {0:#x}")]
    StatusResponseError(u32),

    #[error("key confirmation failed (pake2 verifier mismatch)")]
    KeyConfirmationFailure,

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("invoke failed with result code {0:#x}")]
    InvokeError(u32),

    #[error("write to {path:?} failed with status {code:#x}")]
    WriteFailed {
        path: crate::messages::AttributePath,
        code: u32,
    },

    #[error("unknown or missing subscription id")]
    InvalidSubscription,

    #[error("unexpected report shape: {0}")]
    UnexpectedReport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("tlv error: {0}")]
    Tlv(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MatterError>;

impl From<anyhow::Error> for MatterError {
    fn from(e: anyhow::Error) -> Self {
        MatterError::Crypto(e.to_string())
    }
}
