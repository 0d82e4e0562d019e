//! In-process lease for single-node setups and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, oneshot};

use super::{Lease, LockService};
use crate::error::LockError;

#[derive(Debug)]
struct Holder {
    holder_id: String,
    lost: oneshot::Sender<()>,
}

/// Lock shared by all clones of the service
#[derive(Debug, Clone, Default)]
pub struct MemoryLockService {
    held: Arc<Mutex<HashMap<String, Holder>>>,
    released: Arc<Notify>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease away from its holder, firing its lost signal
    #[cfg(test)]
    pub async fn revoke(&self, key: &str) {
        if let Some(holder) = self.held.lock().await.remove(key) {
            let _ = holder.lost.send(());
        }
        self.released.notify_waiters();
    }

    #[cfg(test)]
    pub async fn holder(&self, key: &str) -> Option<String> {
        self.held.lock().await.get(key).map(|h| h.holder_id.clone())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, holder_id: &str) -> Result<Lease, LockError> {
        loop {
            // Registered before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut held = self.held.lock().await;
                // The same holder taking the key again replaces a session
                // that ended without release
                let free = held.get(key).is_none_or(|h| h.holder_id == holder_id);
                if free {
                    let (lease, lost) = Lease::new(key, holder_id);
                    held.insert(
                        key.to_string(),
                        Holder {
                            holder_id: holder_id.to_string(),
                            lost,
                        },
                    );
                    return Ok(lease);
                }
            }

            notified.await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if held
            .get(lease.key())
            .is_some_and(|h| h.holder_id == lease.holder_id())
        {
            held.remove(lease.key());
            drop(held);
            self.released.notify_waiters();
        }
        Ok(())
    }
}
