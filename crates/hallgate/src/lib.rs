//! # Hallgate
//!
//! WebSocket front end for hall game servers.
//!
//! A player arrives with a token issued by the hall. Hallgate checks it
//! against the hall store, keeps one session per user, probes idle clients
//! with heartbeats, and hands game code an ordered stream of join/leave
//! events plus any custom messages it registered for.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hallgate::prelude::*;
//!
//! # async fn run() -> Result<(), HallError> {
//! let server = HallServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .identity(ServerIdentity { game_id: 1, room_level: 1, server_id: 1 })
//!     .build(MemoryStore::new())
//!     .await?;
//!
//! server.sessions().register_user_joined(|user| tracing::info!(%user, "joined"));
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod server;

pub use error::HallError;
pub use server::{HallServer, HallServerBuilder, HallSessions};

/// Everything a hall server binary usually needs.
pub mod prelude {
    pub use crate::{HallError, HallServer, HallServerBuilder, HallSessions};
    pub use hallgate_protocol::{Codec, Frame, JsonCodec, Payload, UserId};
    pub use hallgate_session::{
        HallStore, MemoryStore, ServerIdentity, SessionConfig, SessionError, TokenDescriptor,
        UserProfile,
    };
    pub use hallgate_transport::ConnectionId;
}
