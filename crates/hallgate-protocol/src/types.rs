//! Core protocol types for Hallgate's wire format.
//!
//! Every message on the wire is a [`Frame`]: a message id plus a JSON
//! object. The two control ids the session layer intercepts (`login` and
//! `heartbeat`) get typed request/response shapes here; everything else is
//! handed to game code as a raw [`Payload`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A hall account id.
///
/// Newtype over the numeric id the hall assigns, serialized as the bare
/// number (`42`, not `{"0": 42}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// The untyped body of a frame: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One message on the wire.
///
/// ```text
/// {"msgid": "login", "data": {"Token": "abc"}}
/// ```
///
/// A missing `data` field decodes as an empty object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Routing key. `login` and `heartbeat` are reserved.
    #[serde(rename = "msgid")]
    pub msg_id: String,

    #[serde(default)]
    pub data: Payload,
}

impl Frame {
    /// Builds a frame from an already-untyped payload.
    pub fn new(msg_id: impl Into<String>, data: Payload) -> Self {
        Self {
            msg_id: msg_id.into(),
            data,
        }
    }

    /// Builds a frame from a typed body.
    ///
    /// # Errors
    /// - [`ProtocolError::Encode`] if `body` can't be serialized.
    /// - [`ProtocolError::InvalidMessage`] if it serializes to something
    ///   other than a JSON object.
    pub fn with<T: Serialize>(msg_id: impl Into<String>, body: &T) -> Result<Self, ProtocolError> {
        match serde_json::to_value(body).map_err(ProtocolError::Encode)? {
            serde_json::Value::Object(data) => Ok(Self::new(msg_id, data)),
            other => Err(ProtocolError::InvalidMessage(format!(
                "frame body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Decodes the payload into a typed body.
    ///
    /// # Errors
    /// [`ProtocolError::Decode`] if the payload doesn't match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone()))
            .map_err(ProtocolError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Client → server: authenticate this connection with a hall token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "Token")]
    pub token: String,
}

impl LoginRequest {
    pub const MSG_ID: &'static str = "login";
}

/// Server → client: outcome of a [`LoginRequest`].
///
/// Untagged on the wire, so a rejection is just `{"errmsg": "..."}` and an
/// acceptance carries the user id and a fresh reconnect token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoginReply {
    Accepted {
        #[serde(rename = "UserId")]
        user_id: UserId,
        #[serde(rename = "ReconnectToken")]
        reconnect_token: String,
    },
    Rejected {
        errmsg: String,
    },
}

impl LoginReply {
    pub const MSG_ID: &'static str = "login";

    pub fn rejected(errmsg: impl Into<String>) -> Self {
        Self::Rejected {
            errmsg: errmsg.into(),
        }
    }
}

/// Server → client liveness probe. `index` is the number of sweeps since
/// the client last answered.
///
/// The client answers with an empty `heartbeat` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatProbe {
    #[serde(rename = "Index")]
    pub index: u32,
}

impl HeartbeatProbe {
    pub const MSG_ID: &'static str = "heartbeat";
}
