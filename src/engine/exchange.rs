use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::Settings;
use crate::engine::results::{ResultRouter, ResultSubscription};
use crate::engine::statistics::{BarIds, StatisticGuard, StatisticRegistry, StatisticsAggregator};
use crate::feed::{FeedError, TickFeed};
use crate::matching::MatchingEngine;
use crate::matching::orderbook::OrderBook;
use crate::models::{BrokerId, DealId, NewOrder, OhlcvBar, Order, OrderError, OrderId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("no such deal id found: {id} (broker {broker_id})")]
    NotFound { id: OrderId, broker_id: BrokerId },
    #[error("invalid order: {0}")]
    InvalidOrder(#[from] OrderError),
    #[error("tick feed is closed")]
    FeedClosed,
}

pub struct ExchangeTasks {
    pub feed: JoinHandle<()>,
    pub matching: JoinHandle<()>,
}

/// The exchange state shared by every RPC handler.
///
/// Create and Cancel act on the book directly; the two streaming
/// subscriptions live in separate registries and never affect each other.
pub struct Exchange {
    book: Arc<OrderBook>,
    router: Arc<ResultRouter>,
    feed: Arc<TickFeed>,
    statistics: Arc<StatisticRegistry>,
    bar_ids: Arc<BarIds>,
    next_order_id: AtomicU64,
    settings: Settings,
}

impl Exchange {
    pub fn new(feed: Arc<TickFeed>, settings: Settings) -> Self {
        Self {
            book: Arc::new(OrderBook::new()),
            router: Arc::new(ResultRouter::new(&settings.results)),
            feed,
            statistics: Arc::new(StatisticRegistry::default()),
            bar_ids: Arc::new(BarIds::default()),
            next_order_id: AtomicU64::new(1),
            settings,
        }
    }

    /// Subscribes the matching engine, then starts feed delivery. The
    /// engine is spawned only once the feed has started, so a repeated call
    /// never adds a second matcher.
    pub fn start(&self) -> Result<ExchangeTasks, FeedError> {
        let ticks = self.feed.subscribe();
        let feed = self.feed.start()?;
        let engine = MatchingEngine::new(Arc::clone(&self.book), Arc::clone(&self.router));
        let matching = engine.spawn(ticks);
        info!(listen_addr = %self.settings.listen_addr, "exchange started");
        Ok(ExchangeTasks { feed, matching })
    }

    /// Closes the feed and every results queue. Consumer loops end on
    /// channel closure.
    pub fn shutdown(&self) {
        self.feed.close();
        self.router.close_all();
    }

    #[instrument(skip(self), fields(broker_id = order.broker_id, instrument = %order.instrument))]
    pub fn create(&self, order: NewOrder) -> Result<DealId, ExchangeError> {
        order.validate()?;
        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let broker_id = order.broker_id;
        self.book.insert(Order::from_new(id, order, Utc::now()));
        metrics::counter!(crate::metrics::ORDERS_CREATED).increment(1);
        info!(id, "order accepted");
        Ok(DealId { id, broker_id })
    }

    /// Removes a resident order owned by the caller.
    #[instrument(skip(self))]
    pub fn cancel(&self, deal: DealId) -> Result<(), ExchangeError> {
        if !self.book.remove_for_broker(deal.id, deal.broker_id) {
            return Err(ExchangeError::NotFound {
                id: deal.id,
                broker_id: deal.broker_id,
            });
        }
        metrics::counter!(crate::metrics::ORDERS_CANCELLED).increment(1);
        info!("order cancelled");
        Ok(())
    }

    /// Starts a dedicated aggregation loop on a fresh feed subscription.
    pub fn statistic(&self, broker_id: BrokerId) -> Result<StatisticStream, ExchangeError> {
        if self.feed.is_closed() {
            return Err(ExchangeError::FeedClosed);
        }
        let (tx, rx) = mpsc::channel(self.settings.statistics.buffer_size.max(1));
        let aggregator = StatisticsAggregator::new(self.settings.statistics.interval(), Arc::clone(&self.bar_ids));
        tokio::spawn(aggregator.run(self.feed.subscribe(), tx));
        Ok(StatisticStream {
            bars: rx,
            _guard: self.statistics.enter(broker_id),
        })
    }

    pub fn results(&self, broker_id: BrokerId) -> ResultSubscription {
        self.router.subscribe(broker_id)
    }

    pub fn book(&self) -> &Arc<OrderBook> {
        &self.book
    }

    pub fn router(&self) -> &Arc<ResultRouter> {
        &self.router
    }

    pub fn feed(&self) -> &Arc<TickFeed> {
        &self.feed
    }

    pub fn statistic_registry(&self) -> &Arc<StatisticRegistry> {
        &self.statistics
    }
}

/// Bars for one `Statistic` subscription.
#[derive(Debug)]
pub struct StatisticStream {
    bars: mpsc::Receiver<OhlcvBar>,
    _guard: StatisticGuard,
}

impl StatisticStream {
    pub async fn recv(&mut self) -> Option<OhlcvBar> {
        self.bars.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = OhlcvBar> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let bar = stream.recv().await?;
            Some((bar, stream))
        })
    }
}
