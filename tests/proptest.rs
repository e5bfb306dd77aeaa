use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;

use tick_exchange::config::ResultsConfig;
use tick_exchange::engine::ResultRouter;
use tick_exchange::{MatchingEngine, Order, OrderBook, Side, Tick};

fn engine_with(orders: &[(bool, u64, u64)]) -> (MatchingEngine, Arc<OrderBook>) {
    let book = Arc::new(OrderBook::new());
    for (i, &(buy, limit_price, remaining)) in orders.iter().enumerate() {
        book.insert(Order {
            id: i as u64 + 1,
            broker_id: 1,
            client_id: 1,
            instrument: "SPFB.RTS".to_string(),
            side: if buy { Side::Buy } else { Side::Sell },
            limit_price,
            remaining,
            submitted_at: Utc::now(),
        });
    }
    let router = Arc::new(ResultRouter::new(&ResultsConfig::default()));
    (MatchingEngine::new(Arc::clone(&book), router), book)
}

fn ticks() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((90u64..110, 1u64..20), 1..20)
}

proptest! {
    #[test]
    fn filled_plus_remaining_is_conserved(
        orders in prop::collection::vec((any::<bool>(), 90u64..110, 1u64..50), 1..30),
        ticks in ticks(),
    ) {
        let (engine, book) = engine_with(&orders);
        let mut filled: HashMap<u64, u64> = HashMap::new();
        for (price, volume) in ticks {
            let tick = Tick { instrument: "SPFB.RTS".to_string(), timestamp: Utc::now(), price, volume };
            let result = engine.match_tick(&tick);
            prop_assert!(result.violation.is_none());
            for fill in result.fills {
                *filled.entry(fill.deal_id).or_default() += fill.volume;
            }
        }
        for (i, &(_, _, initial)) in orders.iter().enumerate() {
            let id = i as u64 + 1;
            let remaining = book.get(id).map(|order| order.remaining).unwrap_or(0);
            let done = filled.get(&id).copied().unwrap_or(0);
            prop_assert_eq!(done + remaining, initial);
            prop_assert_eq!(book.contains(id), remaining > 0);
        }
    }

    #[test]
    fn buy_fills_never_exceed_tick_volume(
        orders in prop::collection::vec((Just(true), 90u64..110, 1u64..50), 1..30),
        price in 90u64..110,
        volume in 1u64..100,
    ) {
        let (engine, _) = engine_with(&orders);
        let tick = Tick { instrument: "SPFB.RTS".to_string(), timestamp: Utc::now(), price, volume };
        let result = engine.match_tick(&tick);
        let total: u64 = result.fills.iter().map(|fill| fill.volume).sum();
        prop_assert!(total <= volume);
        prop_assert_eq!(total + result.available, volume);
        for fill in &result.fills {
            prop_assert!(orders[fill.deal_id as usize - 1].1 >= price);
        }
    }
}
