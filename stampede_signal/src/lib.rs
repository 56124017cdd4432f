//! Stop-signal fan-out for stampede.
//!
//! The attack service must tell an unknown number of background tasks -- the
//! duration timer, the linear-ramp loop -- that an attack has been stopped.
//! This component is a one-writer, many-subscriber broadcast where the value
//! carries no payload beyond its arrival. Because a stop signal has no reason
//! attached, delivery to a subscriber whose buffer is full is intentionally
//! dropped rather than blocking the broadcaster.
//!
//! There is one `Broadcaster` per attack and potentially many `Subscription`
//! instances.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

/// Buffer size of each subscription channel. A subscriber that falls more
/// than this many signals behind starts losing them.
const SUBSCRIPTION_CAPACITY: usize = 10;

/// One-to-many fan-out of values to subscribers.
///
/// `broadcast` never blocks on a slow subscriber: a subscription whose buffer
/// is full misses that value. All operations are safe under concurrent
/// callers and `broadcast` may run alongside `subscribe`.
#[derive(Debug)]
pub struct Broadcaster<T> {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    /// Create a new, empty `Broadcaster`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber.
    ///
    /// The returned [`Subscription`] receives every value broadcast after
    /// this call, up to its buffer capacity.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, tx);

        Subscription { id, rx }
    }

    /// Remove a subscriber and close its channel.
    ///
    /// Idempotent with respect to the subscriber set: removing a subscription
    /// that is already gone is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn unsubscribe(&self, subscription: Subscription<T>) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .remove(&subscription.id);
        drop(subscription);
    }
}

impl<T> Broadcaster<T>
where
    T: Clone,
{
    /// Send `value` to every current subscriber.
    ///
    /// Non-blocking per subscriber: a full or closed subscription drops the
    /// value for that subscriber only.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn broadcast(&self, value: T) {
        let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
        for tx in subscribers.values() {
            // Full or closed buffers lose this value, on purpose.
            let _ = tx.try_send(value.clone());
        }
    }
}

/// Receiving half of a [`Broadcaster`] registration.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Receive the next broadcast value, or `None` once the subscription has
    /// been unsubscribed and its buffer drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn delivers_exactly_once() {
        let br: Broadcaster<u8> = Broadcaster::new();
        let mut sub = br.subscribe();

        br.broadcast(7);

        assert_eq!(sub.recv().await, Some(7));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_for_that_subscriber_only() {
        let br: Broadcaster<u64> = Broadcaster::new();
        let mut saturated = br.subscribe();
        let mut healthy = br.subscribe();

        // Saturate one subscriber past its buffer.
        for v in 0..(SUBSCRIPTION_CAPACITY as u64 + 3) {
            br.broadcast(v);
            assert_eq!(healthy.recv().await, Some(v));
        }

        // The saturated subscriber only ever sees the first
        // SUBSCRIPTION_CAPACITY values.
        for v in 0..SUBSCRIPTION_CAPACITY as u64 {
            assert_eq!(saturated.recv().await, Some(v));
        }
        assert!(saturated.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let br: Broadcaster<()> = Broadcaster::new();
        let sub = br.subscribe();
        let mut other = br.subscribe();

        br.unsubscribe(sub);
        br.broadcast(());

        // The remaining subscriber is unaffected.
        assert_eq!(other.recv().await, Some(()));
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let br: Broadcaster<u8> = Broadcaster::new();
        br.broadcast(1);
    }

    #[tokio::test]
    async fn broadcast_runs_alongside_subscribe() {
        let br: Arc<Broadcaster<u64>> = Arc::new(Broadcaster::new());

        let broadcaster = Arc::clone(&br);
        let sender = tokio::spawn(async move {
            for v in 0..100 {
                broadcaster.broadcast(v);
                tokio::task::yield_now().await;
            }
        });

        let mut subs = Vec::new();
        for _ in 0..10 {
            subs.push(br.subscribe());
            tokio::task::yield_now().await;
        }

        sender.await.expect("broadcast task panicked");

        // Every subscriber observes a monotone subsequence of the broadcast
        // values: nothing reordered, nothing duplicated.
        for sub in &mut subs {
            let mut last = None;
            while let Ok(v) = sub.rx.try_recv() {
                if let Some(prev) = last {
                    assert!(v > prev);
                }
                last = Some(v);
            }
        }
    }
}
