//! Error kinds for the core. Each variant is local to a single flow except
//! `Io::Shared`, which signals the reader thread itself died.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed header/record/extension. Caller drops the packet/record
    /// and, for TLS, resets the receive buffer and closes the connection.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unexpected message for the current state machine state, or a
    /// length mismatch. Always fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// ECDH point validation, signature, AEAD auth, or Finished
    /// verification failure. Always fatal.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Endpoint read/write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection table is at capacity; the SYN is rejected.
    #[error("resource exhausted: {0}")]
    Resource(String),
}

impl CoreError {
    pub fn parse(msg: impl fmt::Display) -> Self {
        CoreError::Parse(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        CoreError::Protocol(msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        CoreError::Crypto(msg.to_string())
    }

    pub fn resource(msg: impl fmt::Display) -> Self {
        CoreError::Resource(msg.to_string())
    }

    /// Whether this error should tear down just the one flow (always true
    /// today; kept as a method since a future shared-endpoint error kind
    /// would flip it).
    pub fn is_flow_local(&self) -> bool {
        true
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
