use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use slab::Slab;

use crate::models::{BrokerId, Instrument, Order, OrderId, Quantity};

/// Outcome of visiting one resting order during a matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visit {
    pub consumed: Quantity,
    pub remove: bool,
}

impl Visit {
    pub fn keep() -> Self {
        Self::default()
    }

    pub fn remove() -> Self {
        Self {
            consumed: 0,
            remove: true,
        }
    }

    pub fn consume(volume: Quantity) -> Self {
        Self {
            consumed: volume,
            remove: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BookError {
    #[error("order {order_id} overfilled: consumed {consumed} of {remaining} remaining")]
    Overfill {
        order_id: OrderId,
        consumed: Quantity,
        remaining: Quantity,
    },
}

#[derive(Debug, Default)]
struct BookState {
    orders: Slab<Order>,
    order_index: HashMap<OrderId, usize>,
    // slab keys per instrument, in arrival order
    queues: HashMap<Instrument, Vec<usize>>,
}

impl BookState {
    fn insert(&mut self, order: Order) {
        let order_id = order.id;
        let instrument = order.instrument.clone();
        let idx = self.orders.insert(order);
        self.order_index.insert(order_id, idx);
        self.queues.entry(instrument).or_default().push(idx);
    }

    fn remove_if<F>(&mut self, order_id: OrderId, allow: F) -> Option<Order>
    where
        F: FnOnce(&Order) -> bool,
    {
        let idx = *self.order_index.get(&order_id)?;
        if !allow(self.orders.get(idx)?) {
            return None;
        }
        let order = self.orders.try_remove(idx)?;
        self.order_index.remove(&order_id);
        self.detach(&order.instrument, |key| key == idx);
        Some(order)
    }

    fn remove_batch(&mut self, instrument: &str, keys: &[usize]) {
        if keys.is_empty() {
            return;
        }
        for &idx in keys {
            if let Some(order) = self.orders.try_remove(idx) {
                self.order_index.remove(&order.id);
            }
        }
        let doomed: HashSet<usize> = keys.iter().copied().collect();
        self.detach(instrument, |key| doomed.contains(&key));
    }

    fn detach<F>(&mut self, instrument: &str, doomed: F)
    where
        F: Fn(usize) -> bool,
    {
        if let Some(queue) = self.queues.get_mut(instrument) {
            queue.retain(|&key| !doomed(key));
            if queue.is_empty() {
                self.queues.remove(instrument);
            }
        }
    }

    fn publish_depth(&self) {
        metrics::gauge!(crate::metrics::BOOK_ORDERS).set(self.orders.len() as f64);
    }
}

/// Resting orders behind one exclusive lock.
///
/// Inserts, removals and whole matching passes all serialize on the same
/// lock, so a cancel racing a match either removes the order before the pass
/// sees it or finds it already gone.
#[derive(Debug, Default)]
pub struct OrderBook {
    state: Mutex<BookState>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the back of the instrument's queue. Ids are unique by
    /// construction.
    pub fn insert(&self, order: Order) {
        let mut state = self.state.lock();
        state.insert(order);
        state.publish_depth();
    }

    pub fn remove_by_id(&self, order_id: OrderId) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove_if(order_id, |_| true).is_some();
        state.publish_depth();
        removed
    }

    /// Removes the order only if `broker_id` owns it.
    pub fn remove_for_broker(&self, order_id: OrderId, broker_id: BrokerId) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove_if(order_id, |order| order.broker_id == broker_id).is_some();
        state.publish_depth();
        removed
    }

    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        let state = self.state.lock();
        let idx = *state.order_index.get(&order_id)?;
        state.orders.get(idx).cloned()
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.state.lock().order_index.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resting orders for `instrument` in book order.
    pub fn orders_for(&self, instrument: &str) -> Vec<Order> {
        let state = self.state.lock();
        state
            .queues
            .get(instrument)
            .map(|queue| queue.iter().filter_map(|&idx| state.orders.get(idx).cloned()).collect())
            .unwrap_or_default()
    }

    /// Visits every resting order for `instrument` in book order while
    /// holding the lock for the whole pass.
    ///
    /// The visit list is fixed before the first callback. Consumed volume is
    /// applied immediately; orders that reach zero or ask to be removed are
    /// dropped only after the pass. An overfill stops the pass: changes made
    /// before it are kept and the error is returned.
    pub fn for_each_matchable<F>(&self, instrument: &str, mut visit: F) -> Result<usize, BookError>
    where
        F: FnMut(&Order) -> Visit,
    {
        let mut state = self.state.lock();
        let Some(snapshot) = state.queues.get(instrument).cloned() else {
            return Ok(0);
        };

        let mut doomed = Vec::new();
        let mut outcome = Ok(());
        for idx in snapshot {
            let Some(order) = state.orders.get_mut(idx) else {
                continue;
            };
            let step = visit(order);
            if step.consumed > order.remaining {
                outcome = Err(BookError::Overfill {
                    order_id: order.id,
                    consumed: step.consumed,
                    remaining: order.remaining,
                });
                break;
            }
            order.remaining -= step.consumed;
            if step.remove || order.remaining == 0 {
                doomed.push(idx);
            }
        }

        state.remove_batch(instrument, &doomed);
        state.publish_depth();
        outcome.map(|()| doomed.len())
    }
}
