//! Session management for Hallgate.
//!
//! This crate owns the lifecycle of a user on a hall server:
//!
//! 1. **Authentication**: a `login` token is checked against the hall
//!    store ([`HallStore`], [`Authenticator`]).
//! 2. **Tracking**: one session per user and per connection
//!    ([`ConnectionRegistry`]).
//! 3. **Liveness**: silent clients are probed and evicted
//!    ([`HeartbeatMonitor`]).
//! 4. **Ordering**: join/leave notifications and deferred work run one at a
//!    time on a single executor ([`TaskQueue`], [`Executor`]).
//!
//! [`SessionManager`] ties these together and is what the server holds.
//!
//! # How it fits in the stack
//!
//! ```text
//! Game logic (above)  ← callbacks, send_to_user, invoke
//!     ↕
//! Session Layer (this crate)  ← who is logged in, and are they still there
//!     ↕
//! Protocol Layer (below)  ← Frame, LoginRequest, HeartbeatProbe
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod callbacks;
mod error;
mod manager;
mod monitor;
mod queue;
mod registry;
mod session;
mod store;

pub use auth::Authenticator;
pub use callbacks::{CallbackRegistry, MessageHandler, UserCallback};
pub use error::{SessionError, ERR_TOKEN_INVALID, ERR_WRONG_SERVER};
pub use manager::{HallContext, SessionManager};
pub use monitor::{HeartbeatMonitor, SweepReport};
pub use queue::{task_queue, Executor, Job, Task, TaskQueue};
pub use registry::ConnectionRegistry;
pub use session::{ServerIdentity, Session, SessionConfig, UserProfile};
pub use store::{token_key, user_data_key, HallStore, MemoryStore, TokenDescriptor};
