//! Per-key command lanes.
//!
//! The pool does not guard against two commands running on one connection
//! at once. The gateway queues commands for the same key on an async lock
//! while commands for different keys run concurrently. A lane exists only
//! while someone holds or waits for it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use tgw_common::ConnectionKey;

#[derive(Debug, Default)]
struct Lane {
    lock: Arc<AsyncMutex<()>>,
    /// Holder plus waiters.
    users: usize,
}

/// Keyed async locks.
#[derive(Debug, Default)]
pub struct Lanes {
    lanes: Mutex<HashMap<ConnectionKey, Lane>>,
}

impl Lanes {
    pub fn new() -> Self {
        Lanes::default()
    }

    /// Waits until no other command holds `key`'s lane, then holds it.
    ///
    /// Dropping the returned future while it waits gives up the place in
    /// line.
    pub async fn enter(&self, key: &ConnectionKey) -> LaneGuard<'_> {
        let (ticket, lock) = {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(key.clone()).or_default();
            lane.users += 1;
            let ticket = Ticket {
                lanes: self,
                key: key.clone(),
            };
            (ticket, Arc::clone(&lane.lock))
        };
        let held = lock.lock_owned().await;
        LaneGuard {
            _held: held,
            _ticket: ticket,
        }
    }

    /// Number of lanes currently held or awaited.
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One user's claim on a lane; the last one out removes the lane.
#[derive(Debug)]
struct Ticket<'a> {
    lanes: &'a Lanes,
    key: ConnectionKey,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lanes.lock();
        let idle = match lanes.get_mut(&self.key) {
            Some(lane) => {
                lane.users -= 1;
                lane.users == 0
            }
            None => false,
        };
        if idle {
            lanes.remove(&self.key);
        }
    }
}

/// Holds a key's lane; dropping it lets the next command in.
#[derive(Debug)]
pub struct LaneGuard<'a> {
    // Field order: the lock is released before the ticket is returned.
    _held: OwnedMutexGuard<()>,
    _ticket: Ticket<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_key() {
        let lanes = Arc::new(Lanes::new());
        let key = ConnectionKey::new("127.0.0.1", 7000).unwrap();

        let first = lanes.enter(&key).await;
        let waiter = {
            let lanes = Arc::clone(&lanes);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = lanes.enter(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();
        assert!(lanes.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let lanes = Lanes::new();
        let a = ConnectionKey::new("127.0.0.1", 7000).unwrap();
        let b = ConnectionKey::new("127.0.0.1", 7001).unwrap();

        let _first = lanes.enter(&a).await;
        let second = tokio::time::timeout(Duration::from_millis(100), lanes.enter(&b)).await;
        assert!(second.is_ok());
        assert_eq!(lanes.len(), 2);
    }

    #[tokio::test]
    async fn waiter_cancelled_after_holder_leaves_removes_lane() {
        let lanes = Lanes::new();
        let key = ConnectionKey::new("127.0.0.1", 7000).unwrap();

        let first = lanes.enter(&key).await;
        let mut waiter = Box::pin(lanes.enter(&key));
        assert!(futures::poll!(&mut waiter).is_pending());

        // The lock passes to the waiter, which is then dropped unpolled.
        drop(first);
        assert_eq!(lanes.len(), 1);
        drop(waiter);
        assert!(lanes.is_empty());

        let again = tokio::time::timeout(Duration::from_millis(100), lanes.enter(&key)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn waiter_timing_out_keeps_holder_lane() {
        let lanes = Lanes::new();
        let key = ConnectionKey::new("127.0.0.1", 7000).unwrap();

        let first = lanes.enter(&key).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), lanes.enter(&key)).await;
        assert!(waited.is_err());
        assert_eq!(lanes.len(), 1);

        drop(first);
        assert!(lanes.is_empty());
    }
}
