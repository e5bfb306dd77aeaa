pub mod exchange;
pub mod results;
pub mod statistics;

pub use exchange::{Exchange, ExchangeError, ExchangeTasks, StatisticStream};
pub use results::{FillQueue, ResultRouter, ResultSubscription, RouteError};
pub use statistics::{BarAccumulator, BarIds, StatisticRegistry, StatisticsAggregator};
