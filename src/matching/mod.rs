pub mod orderbook;

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::engine::results::ResultRouter;
use crate::feed::TickReceiver;
use crate::matching::orderbook::{BookError, OrderBook, Visit};
use crate::models::{Fill, Side, Tick};

#[derive(Debug)]
pub struct MatchResult {
    pub fills: Vec<Fill>,
    /// Tick volume left after the pass.
    pub available: u64,
    pub violation: Option<BookError>,
}

/// Single consumer of the tick feed that fills resting orders against each
/// tick in book order.
pub struct MatchingEngine {
    book: Arc<OrderBook>,
    router: Arc<ResultRouter>,
}

impl MatchingEngine {
    pub fn new(book: Arc<OrderBook>, router: Arc<ResultRouter>) -> Self {
        Self { book, router }
    }

    /// One matching pass over the book for `tick`.
    ///
    /// Buy fills deplete the tick's volume. Sell fills add to it: a crossing
    /// sell is filled for up to the volume available when it is reached and
    /// then makes that much more volume available to orders behind it.
    pub fn match_tick(&self, tick: &Tick) -> MatchResult {
        let mut fills = Vec::new();
        let mut available = tick.volume;
        if available == 0 {
            return MatchResult {
                fills,
                available,
                violation: None,
            };
        }

        let pass = self.book.for_each_matchable(&tick.instrument, |order| {
            if order.remaining == 0 || order.limit_price == 0 {
                return Visit::remove();
            }
            if available == 0 || !order.crosses(tick.price) {
                return Visit::keep();
            }

            let volume = order.remaining.min(available);
            match order.side {
                Side::Buy => available -= volume,
                Side::Sell => available = available.saturating_add(volume),
            }
            fills.push(Fill {
                deal_id: order.id,
                broker_id: order.broker_id,
                client_id: order.client_id,
                instrument: order.instrument.clone(),
                side: order.side,
                volume,
                price: tick.price,
                timestamp: tick.timestamp,
                partial: order.remaining > volume,
            });
            Visit::consume(volume)
        });

        MatchResult {
            fills,
            available,
            violation: pass.err(),
        }
    }

    /// Matches `tick` and hands every fill to its broker's queue.
    #[instrument(skip(self, tick), fields(instrument = %tick.instrument, price = tick.price, volume = tick.volume))]
    pub async fn process(&self, tick: &Tick) -> usize {
        let result = self.match_tick(tick);
        if let Some(violation) = &result.violation {
            error!(%violation, "matching pass aborted");
        }
        let count = result.fills.len();
        for fill in result.fills {
            debug!(deal_id = fill.deal_id, broker_id = fill.broker_id, volume = fill.volume, partial = fill.partial, "fill");
            metrics::counter!(crate::metrics::FILLS).increment(1);
            if let Err(err) = self.router.route(fill).await {
                metrics::counter!(crate::metrics::FILLS_DROPPED).increment(1);
                warn!(%err, "fill not delivered");
            }
        }
        count
    }

    /// Runs until the feed subscription closes.
    pub async fn run(self, mut feed: TickReceiver) {
        info!("matching engine started");
        while let Some(tick) = feed.recv().await {
            self.process(&tick).await;
        }
        info!("matching engine stopped");
    }

    pub fn spawn(self, feed: TickReceiver) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(feed))
    }
}
