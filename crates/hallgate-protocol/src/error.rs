//! Error types for the protocol layer.
//!
//! Each crate in Hallgate defines its own error enum. A `ProtocolError`
//! always means the bytes or the payload shape were wrong, never that the
//! network or the account store misbehaved.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields,
    /// wrong data types, or truncated messages.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is invalid at the protocol level.
    ///
    /// For shapes that parse but break framing rules, e.g. a frame whose
    /// `data` is a JSON array instead of an object.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
