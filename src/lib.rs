pub mod config;
pub mod engine;
pub mod feed;
pub mod matching;
pub mod models;
pub mod server;

pub mod metrics;

pub use engine::exchange::{Exchange, ExchangeError};
pub use feed::TickFeed;
pub use matching::MatchingEngine;
pub use matching::orderbook::OrderBook;
pub use models::{BrokerId, DealId, Fill, NewOrder, OhlcvBar, Order, OrderId, Price, Quantity, Side, Tick};
