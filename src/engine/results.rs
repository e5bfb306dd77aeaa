//! Per-broker fill delivery.
//!
//! Every broker has at most one `FillQueue`, created lazily by the first fill
//! routed to it or by its first `Results` subscription. A newer subscription
//! replaces the queue: pending fills move to the new queue and the old one is
//! closed, which ends the older stream.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::{Backpressure, ResultsConfig};
use crate::models::{BrokerId, Fill};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("results queue for broker {0} is full")]
    Full(BrokerId),
    #[error("results queue for broker {0} is closed")]
    Closed(BrokerId),
}

#[derive(Debug, Default)]
struct QueueState {
    fills: VecDeque<Fill>,
    closed: bool,
    dropped: u64,
}

/// Bounded fill queue with a configurable overflow policy.
#[derive(Debug)]
pub struct FillQueue {
    broker_id: BrokerId,
    capacity: usize,
    policy: Backpressure,
    state: Mutex<QueueState>,
    items: Notify,
    space: Notify,
}

impl FillQueue {
    pub fn new(broker_id: BrokerId, capacity: usize, policy: Backpressure) -> Self {
        Self {
            broker_id,
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState::default()),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Queues `fill` per the overflow policy, handing it back on failure.
    async fn offer(&self, fill: Fill) -> Result<(), (RouteError, Fill)> {
        loop {
            let space = self.space.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err((RouteError::Closed(self.broker_id), fill));
                }
                if state.fills.len() < self.capacity {
                    state.fills.push_back(fill);
                    drop(state);
                    self.items.notify_one();
                    return Ok(());
                }
                match self.policy {
                    Backpressure::Block => {}
                    Backpressure::DropOldest => {
                        state.fills.pop_front();
                        state.fills.push_back(fill);
                        state.dropped += 1;
                        let dropped = state.dropped;
                        drop(state);
                        metrics::counter!(crate::metrics::FILLS_DROPPED).increment(1);
                        warn!(broker_id = self.broker_id, dropped, "results queue full, oldest fill dropped");
                        self.items.notify_one();
                        return Ok(());
                    }
                    Backpressure::Error => {
                        return Err((RouteError::Full(self.broker_id), fill));
                    }
                }
            }
            space.await;
        }
    }

    /// Next fill, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Fill> {
        loop {
            let items = self.items.notified();
            {
                let mut state = self.state.lock();
                if let Some(fill) = state.fills.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(fill);
                }
                if state.closed {
                    return None;
                }
            }
            items.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wake_all();
    }

    /// Closes the queue and returns whatever was still undelivered.
    fn close_and_take(&self) -> VecDeque<Fill> {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.fills)
        };
        self.wake_all();
        pending
    }

    fn extend(&self, fills: VecDeque<Fill>) {
        if fills.is_empty() {
            return;
        }
        self.state.lock().fills.extend(fills);
        self.items.notify_one();
    }

    fn wake_all(&self) {
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().fills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fills evicted by `DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

/// Maps broker ids to their fill queue. The map's shard locks guard only
/// map mutation; pushes happen on the queue after the lock is released.
#[derive(Debug)]
pub struct ResultRouter {
    queues: DashMap<BrokerId, Arc<FillQueue>>,
    capacity: usize,
    policy: Backpressure,
}

impl ResultRouter {
    pub fn new(config: &ResultsConfig) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: config.buffer_size,
            policy: config.backpressure,
        }
    }

    /// Existing queue for `broker_id`, or a fresh one.
    pub fn channel_for(&self, broker_id: BrokerId) -> Arc<FillQueue> {
        self.queues
            .entry(broker_id)
            .or_insert_with(|| Arc::new(self.new_queue(broker_id)))
            .value()
            .clone()
    }

    /// Queues `fill` for its broker according to the backpressure policy.
    ///
    /// A queue replaced or torn down while the push was in flight is retried
    /// against the broker's current queue.
    pub async fn route(&self, fill: Fill) -> Result<(), RouteError> {
        let mut fill = fill;
        loop {
            let queue = self.channel_for(fill.broker_id);
            match queue.offer(fill).await {
                Ok(()) => return Ok(()),
                Err((RouteError::Closed(broker_id), rejected)) if !self.is_current(broker_id, &queue) => {
                    fill = rejected;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    /// Drops the entry for `broker_id` without closing its queue.
    pub fn remove(&self, broker_id: BrokerId) -> Option<Arc<FillQueue>> {
        self.queues.remove(&broker_id).map(|(_, queue)| queue)
    }

    pub fn contains(&self, broker_id: BrokerId) -> bool {
        self.queues.contains_key(&broker_id)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Opens a `Results` subscription, replacing any earlier one for the
    /// same broker.
    pub fn subscribe(self: &Arc<Self>, broker_id: BrokerId) -> ResultSubscription {
        let fresh = Arc::new(self.new_queue(broker_id));
        match self.queues.entry(broker_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(Arc::clone(&fresh));
                fresh.extend(previous.close_and_take());
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fresh));
            }
        }
        metrics::gauge!(crate::metrics::RESULTS_SUBSCRIBERS).increment(1.0);
        info!(broker_id, "results subscription opened");
        ResultSubscription {
            router: Arc::clone(self),
            broker_id,
            queue: fresh,
        }
    }

    /// Closes every queue; open subscriptions end once drained.
    pub fn close_all(&self) {
        for entry in self.queues.iter() {
            entry.value().close();
        }
    }

    fn detach(&self, broker_id: BrokerId, queue: &Arc<FillQueue>) {
        self.queues.remove_if(&broker_id, |_, current| Arc::ptr_eq(current, queue));
        queue.close();
    }

    fn is_current(&self, broker_id: BrokerId, queue: &Arc<FillQueue>) -> bool {
        self.queues
            .get(&broker_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), queue))
    }

    fn new_queue(&self, broker_id: BrokerId) -> FillQueue {
        FillQueue::new(broker_id, self.capacity, self.policy)
    }
}

/// Live `Results` stream for one broker. Dropping it tears the
/// subscription down.
#[derive(Debug)]
pub struct ResultSubscription {
    router: Arc<ResultRouter>,
    broker_id: BrokerId,
    queue: Arc<FillQueue>,
}

impl ResultSubscription {
    /// `None` once a newer subscription replaced this one.
    pub async fn recv(&mut self) -> Option<Fill> {
        self.queue.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Fill> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let fill = subscription.recv().await?;
            Some((fill, subscription))
        })
    }
}

impl Drop for ResultSubscription {
    fn drop(&mut self) {
        self.router.detach(self.broker_id, &self.queue);
        metrics::gauge!(crate::metrics::RESULTS_SUBSCRIBERS).decrement(1.0);
        info!(broker_id = self.broker_id, "results subscription closed");
    }
}
