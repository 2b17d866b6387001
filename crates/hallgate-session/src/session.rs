//! Session types: configuration, routing identity, and the per-user record.
//!
//! A session is the server's record of an authenticated connection. It
//! tracks:
//! - WHO the user is (a [`UserProfile`] snapshot taken at login)
//! - WHERE they're connected (a transport [`ConnectionId`])
//! - HOW they can reconnect (a secret token)
//! - WHETHER they're still alive (the heartbeat counter)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use hallgate_protocol::UserId;
use hallgate_transport::ConnectionId;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session behavior.
///
/// Defaults give a 10 second liveness timeout (2 s sweeps, evict after 5
/// unanswered probes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Key prefix for every hall store lookup (`{project}:hall:...`).
    pub project: String,

    /// Time between heartbeat sweeps.
    pub heartbeat_interval: Duration,

    /// Unanswered probes after which a session is evicted.
    pub heartbeat_threshold: u32,

    /// Bound on queued tasks before `enqueue` starts waiting.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project: "hall".to_string(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_threshold: 5,
            queue_capacity: 100_000,
        }
    }
}

impl SessionConfig {
    /// Shortest sweep interval accepted; anything lower is clamped.
    pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

    /// Clamp any out-of-range values so the config is safe to use.
    ///
    /// - `heartbeat_interval` raised to [`Self::MIN_HEARTBEAT_INTERVAL`].
    /// - `heartbeat_threshold` and `queue_capacity` raised to 1.
    pub fn validated(mut self) -> Self {
        if self.heartbeat_interval < Self::MIN_HEARTBEAT_INTERVAL {
            tracing::warn!(
                interval_ms = self.heartbeat_interval.as_millis() as u64,
                "heartbeat_interval below minimum, clamping"
            );
            self.heartbeat_interval = Self::MIN_HEARTBEAT_INTERVAL;
        }
        if self.heartbeat_threshold == 0 {
            tracing::warn!("heartbeat_threshold of 0 would evict on first sweep, using 1");
            self.heartbeat_threshold = 1;
        }
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }

    /// How long a silent client survives before eviction.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_threshold
    }
}

// ---------------------------------------------------------------------------
// ServerIdentity
// ---------------------------------------------------------------------------

/// The routing identity of this server instance.
///
/// The hall stamps every login token with the identity of the server the
/// user was sent to; tokens stamped for another instance are rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub game_id: i64,
    pub room_level: i64,
    pub server_id: i64,
}

// ---------------------------------------------------------------------------
// UserProfile
// ---------------------------------------------------------------------------

/// Account data copied from the hall at login.
///
/// This is a snapshot: balance changes made by the hall afterwards are not
/// reflected until the user logs in again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserProfile {
    pub seller_id: i64,
    pub channel_id: i64,
    pub user_id: UserId,
    pub amount: f64,
    pub bank_amount: f64,
}

impl UserProfile {
    /// Builds a profile from the hall's `user:data` hash.
    ///
    /// Missing or unparsable fields read as zero, matching how the hall
    /// treats an account that has never been funded.
    pub fn from_fields(user_id: UserId, fields: &HashMap<String, String>) -> Self {
        fn int(fields: &HashMap<String, String>, key: &str) -> i64 {
            fields
                .get(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|v| v as i64)
                .unwrap_or_default()
        }
        fn float(fields: &HashMap<String, String>, key: &str) -> f64 {
            fields
                .get(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_default()
        }

        Self {
            seller_id: int(fields, "SellerId"),
            channel_id: int(fields, "ChannelId"),
            user_id,
            amount: float(fields, "Amount"),
            bank_amount: float(fields, "BankAmount"),
        }
    }

    /// The inverse of [`from_fields`](Self::from_fields), for seeding stores.
    pub fn to_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("SellerId".to_string(), self.seller_id.to_string()),
            ("ChannelId".to_string(), self.channel_id.to_string()),
            ("Amount".to_string(), self.amount.to_string()),
            ("BankAmount".to_string(), self.bank_amount.to_string()),
        ])
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One authenticated user on one connection.
///
/// Sessions are shared as `Arc<Session>` between the registry, the
/// heartbeat sweep and game code. Everything is immutable except the
/// heartbeat counter, which is atomic so a heartbeat reply and a sweep can
/// touch it concurrently without a lock.
#[derive(Debug)]
pub struct Session {
    profile: UserProfile,
    connection: ConnectionId,
    reconnect_token: String,
    heartbeat_count: AtomicU32,
}

impl Session {
    /// Creates a session with a fresh reconnect token and a zero counter.
    pub fn new(profile: UserProfile, connection: ConnectionId) -> Self {
        Self {
            profile,
            connection,
            reconnect_token: generate_token(),
            heartbeat_count: AtomicU32::new(0),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.profile.user_id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// The secret the client can present to resume this session.
    ///
    /// 32 hex characters (128 bits of randomness).
    pub fn reconnect_token(&self) -> &str {
        &self.reconnect_token
    }

    /// Sweeps since the client last answered a probe.
    pub fn heartbeat_count(&self) -> u32 {
        self.heartbeat_count.load(Ordering::Acquire)
    }

    /// Records a liveness reply from the client.
    pub fn reset_heartbeat(&self) {
        self.heartbeat_count.store(0, Ordering::Release);
    }

    /// Records one unanswered sweep and returns the new count, unless the
    /// count has already reached `threshold`, in which case it is left
    /// untouched and `None` is returned.
    ///
    /// Check and increment are one atomic step, so a concurrent
    /// [`reset_heartbeat`](Self::reset_heartbeat) lands either before
    /// (and is aged from 0) or after (and wins).
    pub(crate) fn try_age(&self, threshold: u32) -> Option<u32> {
        self.heartbeat_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < threshold).then(|| count + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
