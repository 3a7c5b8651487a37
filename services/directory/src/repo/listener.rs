//! Notification listener.
//!
//! One background task per process subscribes to the `entry_update`
//! channel and applies remote change records to the cache. Messages issued
//! by this node are skipped; the originating request already applied them
//! at commit time.
use super::{NotifyMessage, Repository};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::Duration;

const MIN_RECONNECT: Duration = Duration::from_secs(10);
const MAX_RECONNECT: Duration = Duration::from_secs(60);

pub(super) fn spawn(repo: Arc<Repository>) {
    tokio::spawn(async move {
        let mut backoff = MIN_RECONNECT;
        loop {
            match listen(&repo).await {
                Ok(()) => {
                    backoff = MIN_RECONNECT;
                }
                Err(err) => {
                    tracing::warn!(error = %err, reconnect_in = ?backoff,
                        "notification listener lost its connection");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RECONNECT);
        }
    });
}

async fn listen(repo: &Arc<Repository>) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(repo.pool()).await?;
    listener.listen("entry_update").await?;
    tracing::info!("listening for notifications on channel 'entry_update'");

    loop {
        let notification = listener.recv().await?;
        let payload = notification.payload();
        let m: NotifyMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(err) => {
                tracing::error!(payload, error = %err, "failed to parse notification");
                continue;
            }
        };
        tracing::debug!(?m, "received change notification");

        if m.issuer == repo.server_id() {
            tracing::debug!(id = m.id, "skipping own message");
            continue;
        }
        if let Err(err) = repo.on_update(&m).await {
            tracing::error!(id = m.id, error = %err, "failed to apply change notification");
        }
    }
}
