//! Runs a hall server against an in-memory hall store.
//!
//! Tokens `demo-1` to `demo-3` log in as users 1001 to 1003. An `echo`
//! frame is sent back to its sender from the task executor.
//!
//! ```text
//! HALL_BIND=127.0.0.1:8080 HALL_PROJECT=hall HALL_GAME_ID=1 \
//! HALL_ROOM_LEVEL=1 HALL_SERVER_ID=1 RUST_LOG=debug cargo run -p hall-echo
//! ```

use std::str::FromStr;
use std::sync::Arc;

use hallgate::prelude::*;
use tracing_subscriber::EnvFilter;

const DEMO_USERS: [(&str, i64); 3] = [("demo-1", 1001), ("demo-2", 1002), ("demo-3", 1003)];

#[tokio::main]
async fn main() -> Result<(), HallError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env_or("HALL_BIND", "127.0.0.1:8080".to_string());
    let config = SessionConfig {
        project: env_or("HALL_PROJECT", "hall".to_string()),
        ..SessionConfig::default()
    };
    let identity = ServerIdentity {
        game_id: env_or("HALL_GAME_ID", 1),
        room_level: env_or("HALL_ROOM_LEVEL", 1),
        server_id: env_or("HALL_SERVER_ID", 1),
    };

    let store = Arc::new(MemoryStore::new());
    seed(&store, &config.project, identity);

    let server = HallServerBuilder::new()
        .bind(&bind)
        .identity(identity)
        .session_config(config)
        .build(Arc::clone(&store))
        .await?;

    let sessions = server.sessions().clone();
    sessions.register_user_joined(|user| tracing::info!(%user, "joined"));
    sessions.register_user_left(|user| tracing::info!(%user, "left"));

    let echo = sessions.clone();
    sessions.register_message_handler("echo", move |conn, payload| {
        let sessions = echo.clone();
        async move {
            let Some(user) = sessions.session_for(conn).map(|s| s.user_id()) else {
                tracing::debug!(%conn, "echo before login, ignored");
                return;
            };
            let reply = sessions.clone();
            let queued = sessions
                .invoke(move || {
                    reply.send_to_user(user, "echo", &payload);
                })
                .await;
            if let Err(e) = queued {
                tracing::warn!(%user, error = %e, "echo dropped");
            }
        }
    })?;

    tracing::info!(addr = ?server.local_addr().ok(), tokens = ?DEMO_USERS.map(|(t, _)| t), "ready");
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
}

/// Plays the hall's part: routes the demo users here and gives them a
/// starting balance.
fn seed(store: &MemoryStore, project: &str, identity: ServerIdentity) {
    for (token, user) in DEMO_USERS {
        store.issue_token(
            project,
            token,
            &TokenDescriptor {
                user_id: UserId(user),
                game_id: identity.game_id,
                room_level: identity.room_level,
                server_id: identity.server_id,
            },
        );
        store.put_profile(
            project,
            &UserProfile {
                seller_id: 1,
                channel_id: 1,
                user_id: UserId(user),
                amount: 1000.0,
                bank_amount: 0.0,
            },
        );
    }
}

/// Reads `key` from the environment, falling back to `default` when it is
/// unset or doesn't parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable, using default");
            default
        }),
        Err(_) => default,
    }
}
