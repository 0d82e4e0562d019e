//! Cluster-wide scheduler lease
//!
//! Exactly one scheduler instance may hold the lease. Its holder must drop
//! all in-memory state as soon as the lease is reported lost.

mod memory;
mod postgres;

pub use memory::MemoryLockService;
pub use postgres::PgAdvisoryLock;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::LockError;

#[async_trait]
pub trait LockService: Send + Sync {
    /// Blocks until `key` is held by `holder_id`
    ///
    /// Fails only on transport errors.
    async fn acquire(&self, key: &str, holder_id: &str) -> Result<Lease, LockError>;

    /// Gives the lease back, a lease that is no longer held is not an error
    async fn release(&self, lease: Lease) -> Result<(), LockError>;
}

/// A held lease
#[derive(Debug)]
pub struct Lease {
    key: String,
    holder_id: String,
    lost: oneshot::Receiver<()>,
    fired: bool,
}

impl Lease {
    /// Creates a lease together with the sender that reports its loss
    ///
    /// Dropping the sender counts as loss.
    pub fn new(key: impl Into<String>, holder_id: impl Into<String>) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let lease = Self {
            key: key.into(),
            holder_id: holder_id.into(),
            lost: rx,
            fired: false,
        };
        (lease, tx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Resolves once the lease is lost, immediately on every later call
    ///
    /// Cancel safe.
    pub async fn lost(&mut self) {
        if !self.fired {
            let _ = (&mut self.lost).await;
            self.fired = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lost_fires_once_and_stays_fired() {
        let (mut lease, tx) = Lease::new("k", "h1");
        assert!(
            tokio::time::timeout(Duration::from_millis(20), lease.lost())
                .await
                .is_err()
        );

        tx.send(()).unwrap();
        lease.lost().await;
        lease.lost().await;
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_lost() {
        let (mut lease, tx) = Lease::new("k", "h1");
        drop(tx);
        lease.lost().await;
        assert_eq!(lease.key(), "k");
        assert_eq!(lease.holder_id(), "h1");
    }
}
