//! In-flight registry: at most one producer per asset key.
//!
//! The first claimant of a key becomes its producer; later claimants receive
//! a waiter that resolves to whatever the producer publishes. The slot is
//! removed when the producer completes or is dropped, so a key can be claimed
//! again once its previous generation has finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::asset::AssetKey;

type Slots<T> = Arc<Mutex<HashMap<AssetKey, watch::Receiver<Option<T>>>>>;

pub struct InFlightRegistry<T> {
    slots: Slots<T>,
}

impl<T> Clone for InFlightRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<T>(slots: &Slots<T>) -> MutexGuard<'_, HashMap<AssetKey, watch::Receiver<Option<T>>>> {
    // Slot maps hold no invariants a panicking holder could break.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub enum Claim<T> {
    Producer(ProducerTicket<T>),
    Waiter(Waiter<T>),
}

impl<T: Clone> InFlightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &AssetKey) -> Claim<T> {
        let mut slots = lock(&self.slots);
        if let Some(rx) = slots.get(key) {
            return Claim::Waiter(Waiter { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), rx);
        Claim::Producer(ProducerTicket {
            key: key.clone(),
            tx: Some(tx),
            slots: Arc::clone(&self.slots),
        })
    }

    /// Keys currently being produced.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the single producer of a key.
pub struct ProducerTicket<T> {
    key: AssetKey,
    tx: Option<watch::Sender<Option<T>>>,
    slots: Slots<T>,
}

impl<T> ProducerTicket<T> {
    /// Publish the result to every waiter and release the key.
    pub fn complete(mut self, value: T) {
        let mut slots = lock(&self.slots);
        slots.remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(value));
        }
    }
}

impl<T> Drop for ProducerTicket<T> {
    fn drop(&mut self) {
        // Abandoned without completing: release the key; waiters observe a
        // closed channel.
        if self.tx.is_some() {
            lock(&self.slots).remove(&self.key);
        }
    }
}

pub struct Waiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Waiter<T> {
    /// `None` if the producer was dropped without publishing.
    pub async fn wait(mut self) -> Option<T> {
        let published = match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        published
    }
}
