//! OHLCV bars over fixed-width intervals.
//!
//! Each `Statistic` stream runs its own aggregator on its own feed
//! subscription and interval clock; nothing is shared between brokers except
//! the bar id sequence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::feed::TickReceiver;
use crate::feed::clock::ReplayClock;
use crate::models::{BarId, BrokerId, Instrument, OhlcvBar, Price, Quantity, Tick};

/// Process-wide bar id sequence.
#[derive(Debug, Default)]
pub struct BarIds(AtomicU64);

impl BarIds {
    pub fn next(&self) -> BarId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone)]
struct Candle {
    open: Price,
    open_ts: DateTime<Utc>,
    high: Price,
    low: Price,
    close: Price,
    close_ts: DateTime<Utc>,
    volume: Quantity,
}

impl Candle {
    fn new(tick: &Tick) -> Self {
        Self {
            open: tick.price,
            open_ts: tick.timestamp,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            close_ts: tick.timestamp,
            volume: tick.volume,
        }
    }

    // Equal timestamps keep whichever tick came first.
    fn update(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.volume = self.volume.saturating_add(tick.volume);
        if tick.timestamp < self.open_ts {
            self.open = tick.price;
            self.open_ts = tick.timestamp;
        }
        if tick.timestamp > self.close_ts {
            self.close = tick.price;
            self.close_ts = tick.timestamp;
        }
    }
}

/// Per-instrument OHLCV state for the interval in progress.
#[derive(Debug, Default)]
pub struct BarAccumulator {
    candles: BTreeMap<Instrument, Candle>,
}

impl BarAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, tick: &Tick) {
        match self.candles.get_mut(&tick.instrument) {
            Some(candle) => candle.update(tick),
            None => {
                self.candles.insert(tick.instrument.clone(), Candle::new(tick));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// One bar per instrument seen since the last drain, ordered by
    /// instrument. Resets the accumulator.
    pub fn drain(&mut self, ids: &BarIds, interval_start: DateTime<Utc>, interval_secs: u32) -> Vec<OhlcvBar> {
        std::mem::take(&mut self.candles)
            .into_iter()
            .map(|(instrument, candle)| OhlcvBar {
                id: ids.next(),
                instrument,
                interval_start,
                interval_secs,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
            })
            .collect()
    }
}

pub struct StatisticsAggregator {
    interval: Duration,
    ids: Arc<BarIds>,
}

impl StatisticsAggregator {
    pub fn new(interval: Duration, ids: Arc<BarIds>) -> Self {
        Self { interval, ids }
    }

    /// Folds `feed` into bars and sends them to `out` at every interval
    /// boundary.
    ///
    /// Returns when `out` is dropped, or after flushing the last interval
    /// when the feed closes.
    pub async fn run(self, mut feed: TickReceiver, out: mpsc::Sender<OhlcvBar>) {
        let interval_secs = u32::try_from(self.interval.as_secs()).unwrap_or(u32::MAX);
        let clock = ReplayClock::start();
        let mut interval_start = clock.now();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bars = BarAccumulator::new();

        loop {
            tokio::select! {
                _ = out.closed() => {
                    debug!("statistic receiver dropped");
                    return;
                }
                tick = feed.recv() => match tick {
                    Some(tick) => bars.observe(&tick),
                    None => {
                        let last = bars.drain(&self.ids, interval_start, interval_secs);
                        let _ = emit(&out, last).await;
                        info!("feed closed, statistic stream ending");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    let ready = bars.drain(&self.ids, interval_start, interval_secs);
                    interval_start = clock.now();
                    if emit(&out, ready).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn emit(out: &mpsc::Sender<OhlcvBar>, bars: Vec<OhlcvBar>) -> Result<(), ()> {
    for bar in bars {
        debug!(id = bar.id, instrument = %bar.instrument, volume = bar.volume, "bar");
        metrics::counter!(crate::metrics::BARS_EMITTED).increment(1);
        out.send(bar).await.map_err(|_| ())?;
    }
    Ok(())
}

/// Live `Statistic` streams per broker. Independent of the result router.
#[derive(Debug, Default)]
pub struct StatisticRegistry {
    active: DashMap<BrokerId, usize>,
}

impl StatisticRegistry {
    pub fn enter(self: &Arc<Self>, broker_id: BrokerId) -> StatisticGuard {
        *self.active.entry(broker_id).or_insert(0) += 1;
        metrics::gauge!(crate::metrics::STATISTIC_SUBSCRIBERS).increment(1.0);
        info!(broker_id, "statistic subscription opened");
        StatisticGuard {
            registry: Arc::clone(self),
            broker_id,
        }
    }

    pub fn active(&self, broker_id: BrokerId) -> usize {
        self.active.get(&broker_id).map(|count| *count).unwrap_or(0)
    }

    fn leave(&self, broker_id: BrokerId) {
        if let Some(mut count) = self.active.get_mut(&broker_id) {
            *count = count.saturating_sub(1);
        }
        self.active.remove_if(&broker_id, |_, count| *count == 0);
    }
}

#[derive(Debug)]
pub struct StatisticGuard {
    registry: Arc<StatisticRegistry>,
    broker_id: BrokerId,
}

impl Drop for StatisticGuard {
    fn drop(&mut self) {
        self.registry.leave(self.broker_id);
        metrics::gauge!(crate::metrics::STATISTIC_SUBSCRIBERS).decrement(1.0);
        info!(broker_id = self.broker_id, "statistic subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(millis: i64, price: Price, volume: Quantity) -> Tick {
        let base = Utc.with_ymd_and_hms(2019, 5, 17, 10, 0, 0).unwrap();
        Tick {
            instrument: "SPFB.RTS".to_string(),
            timestamp: base + chrono::Duration::milliseconds(millis),
            price,
            volume,
        }
    }

    #[test]
    fn open_and_close_follow_timestamps() {
        let mut bars = BarAccumulator::new();
        bars.observe(&at(500, 150, 1));
        bars.observe(&at(0, 100, 1));
        bars.observe(&at(900, 50, 1));
        bars.observe(&at(900, 70, 1));

        let bar = bars.drain(&BarIds::default(), Utc::now(), 1).remove(0);
        assert_eq!((bar.open, bar.high, bar.low, bar.close, bar.volume), (100, 150, 50, 50, 4));
        assert!(bars.is_empty());
    }

    #[test]
    fn bar_ids_are_shared_and_increasing() {
        let ids = BarIds::default();
        let mut bars = BarAccumulator::new();
        bars.observe(&at(0, 1, 1));
        let mut other = at(0, 2, 1);
        other.instrument = "SPFB.Si".to_string();
        bars.observe(&other);
        let first: Vec<_> = bars.drain(&ids, Utc::now(), 1).into_iter().map(|b| (b.instrument, b.id)).collect();
        assert_eq!(first, vec![("SPFB.RTS".to_string(), 1), ("SPFB.Si".to_string(), 2)]);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn registry_counts_per_broker() {
        let registry = Arc::new(StatisticRegistry::default());
        let a = registry.enter(1);
        let b = registry.enter(1);
        assert_eq!(registry.active(1), 2);
        drop(a);
        assert_eq!(registry.active(1), 1);
        drop(b);
        assert_eq!(registry.active(1), 0);
    }
}
