//! Lease backed by a session-level Postgres advisory lock
//!
//! The lock lives as long as the dedicated connection that took it. A
//! keepalive task pings that connection and reports the lease lost when
//! the ping fails, since the server drops the lock with the session.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Lease, LockService};
use crate::error::LockError;

pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const LOCK_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

struct Held {
    holder_id: String,
    conn: Arc<Mutex<PgConnection>>,
    keepalive: CancellationToken,
}

pub struct PgAdvisoryLock {
    database_url: String,
    retry_interval: Duration,
    keepalive_interval: Duration,
    held: Mutex<HashMap<String, Held>>,
}

impl PgAdvisoryLock {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            retry_interval: LOCK_RETRY_INTERVAL,
            keepalive_interval: LOCK_KEEPALIVE_INTERVAL,
            held: Mutex::new(HashMap::new()),
        }
    }

    async fn unlock(key: &str, held: Held) -> Result<(), LockError> {
        held.keepalive.cancel();
        let mut conn = held.conn.lock().await;
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !released {
            debug!(key, "Advisory lock was not held");
        }
        Ok(())
    }
}

#[async_trait]
impl LockService for PgAdvisoryLock {
    async fn acquire(&self, key: &str, holder_id: &str) -> Result<Lease, LockError> {
        // A session that ended without release (panic) still owns the lock
        let stale = self.held.lock().await.remove(key);
        if let Some(stale) = stale {
            warn!(key, holder_id = %stale.holder_id, "Dropping stale advisory lock session");
            if let Err(e) = Self::unlock(key, stale).await {
                warn!(key, "Failed to unlock stale session: {}", e);
            }
        }

        let mut conn = PgConnection::connect(&self.database_url).await?;
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
                .bind(key)
                .fetch_one(&mut conn)
                .await?;
            if acquired {
                break;
            }
            debug!(key, "Lease held by another instance, retrying");
            tokio::time::sleep(self.retry_interval).await;
        }

        info!(key, holder_id, "Advisory lock acquired");

        let (lease, lost) = Lease::new(key, holder_id);
        let conn = Arc::new(Mutex::new(conn));
        let keepalive = CancellationToken::new();

        tokio::spawn(keep_alive(
            key.to_string(),
            conn.clone(),
            self.keepalive_interval,
            keepalive.clone(),
            lost,
        ));

        self.held.lock().await.insert(
            key.to_string(),
            Held {
                holder_id: holder_id.to_string(),
                conn,
                keepalive,
            },
        );
        Ok(lease)
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let held = {
            let mut held = self.held.lock().await;
            match held.get(lease.key()) {
                Some(h) if h.holder_id == lease.holder_id() => held.remove(lease.key()),
                _ => None,
            }
        };

        match held {
            Some(held) => Self::unlock(lease.key(), held).await,
            None => Ok(()),
        }
    }
}

async fn keep_alive(
    key: String,
    conn: Arc<Mutex<PgConnection>>,
    interval: Duration,
    stop: CancellationToken,
    lost: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let ping = {
            let mut conn = conn.lock().await;
            conn.ping().await
        };

        if let Err(e) = ping {
            warn!(key = %key, "Lock session lost: {}", e);
            let _ = lost.send(());
            return;
        }
    }
}
