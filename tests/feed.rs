use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TryRecvError;

use tick_exchange::feed::{FeedError, TickFeed, TickReceiver};
use tick_exchange::Tick;

fn tick(offset_ms: i64, instrument: &str, price: u64) -> Tick {
    Tick {
        instrument: instrument.to_string(),
        timestamp: Utc::now() + chrono::Duration::milliseconds(offset_ms),
        price,
        volume: 1,
    }
}

fn feed(ticks: Vec<Tick>) -> Arc<TickFeed> {
    Arc::new(TickFeed::new(ticks, Duration::from_secs(1), 100).unwrap())
}

fn drain(rx: &mut TickReceiver) -> Vec<Tick> {
    let mut out = Vec::new();
    while let Ok(tick) = rx.try_recv() {
        out.push(tick);
    }
    out
}

#[test]
fn empty_source_is_rejected() {
    assert!(matches!(TickFeed::new(Vec::new(), Duration::from_secs(1), 1), Err(FeedError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn every_subscriber_gets_the_same_ordered_feed() {
    let ticks = vec![
        tick(-60_000, "SPFB.RTS", 1),
        tick(-59_000, "SPFB.Si", 2),
        tick(500, "SPFB.RTS", 3),
        tick(1_500, "SPFB.Si", 4),
        tick(2_500, "SPFB.RTS", 5),
    ];
    let feed = feed(ticks.clone());
    let mut first = feed.subscribe();
    let mut second = feed.subscribe();
    let handle = feed.start().unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    let a = drain(&mut first);
    let b = drain(&mut second);
    assert_eq!(a, ticks);
    assert_eq!(a, b);

    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn past_ticks_are_due_on_the_first_wake_up() {
    let feed = feed(vec![tick(-3_600_000, "SPFB.RTS", 1), tick(3_600_000, "SPFB.RTS", 2)]);
    let mut rx = feed.subscribe();
    feed.start().unwrap();

    let first = tokio::time::timeout(Duration::from_millis(10), rx.recv()).await.unwrap();
    assert_eq!(first.map(|t| t.price), Some(1));
    assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    feed.close();
}

#[tokio::test(start_paused = true)]
async fn future_ticks_wait_for_their_timestamp() {
    let feed = feed(vec![tick(5_000, "SPFB.RTS", 9)]);
    let mut rx = feed.subscribe();
    feed.start().unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    assert_eq!(feed.pending(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rx.try_recv().map(|t| t.price), Ok(9));
    assert_eq!(feed.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_ends_subscribers_and_the_loop() {
    let feed = feed(vec![tick(60_000, "SPFB.RTS", 1)]);
    let mut rx = feed.subscribe();
    let handle = feed.start().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    feed.close();
    assert!(rx.recv().await.is_none());
    handle.await.unwrap();

    let mut late = feed.subscribe();
    assert!(late.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_subscribers_are_pruned() {
    let feed = feed(vec![tick(-1_000, "SPFB.RTS", 1), tick(60_000, "SPFB.RTS", 2)]);
    let mut kept = feed.subscribe();
    let dropped = feed.subscribe();
    assert_eq!(feed.subscriber_count(), 2);
    drop(dropped);
    assert_eq!(feed.subscriber_count(), 1);
    feed.start().unwrap();

    assert_eq!(kept.recv().await.map(|t| t.price), Some(1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(feed.subscriber_count(), 1);
    feed.close();
}
