//! Per-UPI-id mutual exclusion.
//!
//! Each id gets its own async mutex, created on first use and dropped once
//! nobody holds or waits on it. Unrelated ids never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use upi_types::UpiId;

type Slots = HashMap<UpiId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyLocks {
    slots: Arc<Mutex<Slots>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `upi_id`.
    ///
    /// Cancelling the returned future while it waits is safe; the slot is
    /// then reclaimed by the next release of the same id.
    pub async fn acquire(&self, upi_id: &UpiId) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(upi_id.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            slots: self.slots.clone(),
            upi_id: upi_id.clone(),
            guard: Some(guard),
        }
    }

    /// Lock several ids in sorted order. Duplicates are locked once.
    pub async fn acquire_many<'a, I>(&self, upi_ids: I) -> Vec<KeyGuard>
    where
        I: IntoIterator<Item = &'a UpiId>,
    {
        let mut ids: Vec<&UpiId> = upi_ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.acquire(id).await);
        }
        guards
    }

    /// Number of ids currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one UPI id, released on drop.
pub struct KeyGuard {
    slots: Arc<Mutex<Slots>>,
    upi_id: UpiId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn upi_id(&self) -> &UpiId {
        &self.upi_id
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        self.guard.take();
        let idle = slots
            .get(&self.upi_id)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&self.upi_id);
        }
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("upi_id", &self.upi_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn upi(raw: &str) -> UpiId {
        UpiId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = KeyLocks::new();
        let guard = locks.acquire(&upi("alice@bank")).await;
        assert!(timeout(Duration::from_millis(50), locks.acquire(&upi("alice@bank")))
            .await
            .is_err());
        drop(guard);
        let again = timeout(Duration::from_millis(50), locks.acquire(&upi("alice@bank")))
            .await
            .expect("released lock should be free");
        assert_eq!(again.upi_id(), &upi("alice@bank"));
    }

    #[tokio::test]
    async fn unrelated_ids_do_not_contend() {
        let locks = KeyLocks::new();
        let _alice = locks.acquire(&upi("alice@bank")).await;
        timeout(Duration::from_millis(50), locks.acquire(&upi("bob@bank")))
            .await
            .expect("different id must not block");
    }

    #[tokio::test]
    async fn slots_are_reclaimed() {
        let locks = KeyLocks::new();
        {
            let _guards = locks
                .acquire_many([&upi("bob@bank"), &upi("alice@bank"), &upi("bob@bank")])
                .await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_keeps_slot_alive() {
        let locks = KeyLocks::new();
        let first = locks.acquire(&upi("alice@bank")).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&upi("alice@bank")).await.upi_id().clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(contender.await.unwrap(), upi("alice@bank"));
        assert!(locks.is_empty());
    }
}
