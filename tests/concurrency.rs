use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tick_exchange::config::Settings;
use tick_exchange::{DealId, Exchange, ExchangeError, MatchingEngine, NewOrder, Side, Tick, TickFeed};

fn exchange() -> Arc<Exchange> {
    let tick = Tick {
        instrument: "SPFB.RTS".to_string(),
        timestamp: Utc::now() + chrono::Duration::hours(1),
        price: 100,
        volume: 1,
    };
    let feed = Arc::new(TickFeed::new(vec![tick], Duration::from_secs(1), 16).unwrap());
    Arc::new(Exchange::new(feed, Settings::default()))
}

fn buy(broker_id: u64, limit_price: u64) -> NewOrder {
    NewOrder {
        broker_id,
        client_id: 1,
        instrument: "SPFB.RTS".to_string(),
        side: Side::Buy,
        limit_price,
        volume: 1,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_and_cancels_keep_the_book_consistent() {
    const CREATES: u64 = 200;
    const CANCELS: usize = 75;
    let exchange = exchange();

    let creates: Vec<_> = (0..CREATES)
        .map(|i| {
            let exchange = Arc::clone(&exchange);
            tokio::spawn(async move { exchange.create(buy(i % 5, 100 + i)).unwrap() })
        })
        .collect();
    let mut deals = Vec::new();
    for handle in creates {
        deals.push(handle.await.unwrap());
    }
    assert_eq!(exchange.book().len(), CREATES as usize);

    let mut ids: Vec<_> = deals.iter().map(|deal| deal.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), CREATES as usize);

    let cancels: Vec<_> = deals
        .into_iter()
        .take(CANCELS)
        .map(|deal| {
            let exchange = Arc::clone(&exchange);
            tokio::spawn(async move { exchange.cancel(deal) })
        })
        .collect();
    for handle in cancels {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(exchange.book().len(), CREATES as usize - CANCELS);
}

#[tokio::test]
async fn cancel_needs_the_owning_broker() {
    let exchange = exchange();
    let deal = exchange.create(buy(3, 100)).unwrap();
    let stranger = DealId {
        id: deal.id,
        broker_id: 4,
    };
    assert_eq!(
        exchange.cancel(stranger),
        Err(ExchangeError::NotFound { id: deal.id, broker_id: 4 })
    );
    assert!(exchange.book().contains(deal.id));
    exchange.cancel(deal).unwrap();
}

#[test]
fn cancel_racing_a_match_has_one_winner() {
    for _ in 0..200 {
        let exchange = exchange();
        let engine = MatchingEngine::new(Arc::clone(exchange.book()), Arc::clone(exchange.router()));
        let deal = exchange.create(buy(9, 100)).unwrap();
        let tick = Tick {
            instrument: "SPFB.RTS".to_string(),
            timestamp: Utc::now(),
            price: 100,
            volume: 1,
        };

        let (filled, cancelled) = std::thread::scope(|scope| {
            let matcher = scope.spawn(|| engine.match_tick(&tick).fills.len());
            let canceller = scope.spawn(|| exchange.cancel(deal.clone()).is_ok());
            (matcher.join().unwrap(), canceller.join().unwrap())
        });

        assert!(filled <= 1);
        assert_ne!(filled == 1, cancelled, "exactly one of fill and cancel must win");
        assert!(exchange.book().is_empty());
    }
}
