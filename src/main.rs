use anyhow::{Context, Result};
use relay_session::config::env::apply_env_overrides;
use relay_session::{
    load_config, ConfigStore, RelayConfig, SessionClient, SessionEvent, SqliteConfigStore,
    WebSocketTransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_session=info".into()),
        )
        .init();

    info!("Relay client starting...");

    // Read configuration from file (optional) and environment
    let config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => {
            let mut config = load_config(&path)?;
            apply_env_overrides(&mut config);
            config
        }
        Err(_) => RelayConfig::from_env(),
    };

    let local_id = std::env::var("RELAY_LOCAL_ID").unwrap_or_else(|_| "relay-client".to_string());
    let session_type = std::env::var("RELAY_SESSION_TYPE").unwrap_or_else(|_| "duel".to_string());
    let num_members: usize = std::env::var("RELAY_NUM_MEMBERS")
        .unwrap_or_else(|_| "2".to_string())
        .parse()
        .context("RELAY_NUM_MEMBERS must be a non-negative integer")?;
    let session_db =
        std::env::var("RELAY_SESSION_DB").unwrap_or_else(|_| "relay_sessions.db".to_string());

    info!(
        http_url = %config.server.http_url,
        ws_url = %config.server.ws_url,
        local_id = %local_id,
        session_db = %session_db,
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteConfigStore::new(&session_db).context("Failed to initialize session store")?,
    );
    let transports = Arc::new(WebSocketTransportFactory::new(config.timeouts.send()));
    let client = SessionClient::new(config, store.clone(), transports);

    // Resume a previous membership if one was saved
    let resumable = match store.load(&local_id) {
        Ok(record) => record.map_or(false, |record| record.initialized),
        Err(e) => {
            warn!(local_id = %local_id, error = %format!("{:#}", e), "Discarding saved session");
            false
        }
    };
    let (handle, mut events) = if resumable {
        info!(local_id = %local_id, "Resuming saved session");
        client.rejoin(&local_id)?
    } else {
        client.join_random(&local_id, &session_type, num_members)?
    };

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => info!(
                    stage = ?state.stage,
                    status = ?state.status,
                    stable = state.stable,
                    ready = state.ready,
                    present = state.present_count(),
                    reason = ?state.disconnect_reason,
                    password = ?state.password,
                    "Session state"
                ),
                SessionEvent::Message(message) => info!(
                    member = message.member_index,
                    pinned = message.pinned,
                    sent_at = ?message.sent_at(),
                    "{}",
                    message.payload
                ),
                SessionEvent::IdentityReset { stale_member_id } => {
                    warn!(member_id = %stale_member_id, "Server identity reset, rejoined as a new member")
                }
            }
        }
    });

    // Forward stdin lines until EOF or Ctrl-C
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if !line.trim().is_empty() => handle.send(line.trim(), false)?,
                Some(_) => {}
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl_c signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.disconnect(false)?;
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Session did not close in time");
        handle.stop().ok();
    }

    client.shutdown();
    event_task.abort();
    info!("Relay client stopped");

    Ok(())
}
