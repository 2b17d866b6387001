//! Wire protocol for Hallgate.
//!
//! - **Types** ([`Frame`], [`LoginRequest`], [`LoginReply`],
//!   [`HeartbeatProbe`], [`UserId`]): what travels on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how frames become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Session (user context)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{Frame, HeartbeatProbe, LoginReply, LoginRequest, Payload, UserId};
