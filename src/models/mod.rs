use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/tickexchange.exchange.rs"));
}

pub type Instrument = String;
pub type BrokerId = u64;
pub type ClientId = u64;
pub type OrderId = u64;
pub type BarId = u64;
pub type Price = u64;
pub type Quantity = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

/// One observed trade on the simulated market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub price: Price,
    pub volume: Quantity,
}

/// Order as submitted, before the exchange assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub broker_id: BrokerId,
    pub client_id: ClientId,
    pub instrument: Instrument,
    pub side: Side,
    pub limit_price: Price,
    pub volume: Quantity,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.instrument.is_empty() {
            return Err(OrderError::EmptyInstrument);
        }
        if self.volume == 0 {
            return Err(OrderError::ZeroVolume);
        }
        if self.limit_price == 0 {
            return Err(OrderError::ZeroPrice);
        }
        Ok(())
    }
}

/// Resting book entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub broker_id: BrokerId,
    pub client_id: ClientId,
    pub instrument: Instrument,
    pub side: Side,
    pub limit_price: Price,
    pub remaining: Quantity,
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn from_new(id: OrderId, order: NewOrder, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            broker_id: order.broker_id,
            client_id: order.client_id,
            instrument: order.instrument,
            side: order.side,
            limit_price: order.limit_price,
            remaining: order.volume,
            submitted_at,
        }
    }

    /// Buy limits cross at or below the limit, sell limits at or above it.
    pub fn crosses(&self, price: Price) -> bool {
        match self.side {
            Side::Buy => self.limit_price >= price,
            Side::Sell => self.limit_price <= price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealId {
    pub id: OrderId,
    pub broker_id: BrokerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub deal_id: OrderId,
    pub broker_id: BrokerId,
    pub client_id: ClientId,
    pub instrument: Instrument,
    pub side: Side,
    pub volume: Quantity,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhlcvBar {
    pub id: BarId,
    pub instrument: Instrument,
    pub interval_start: DateTime<Utc>,
    pub interval_secs: u32,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("order volume must be positive")]
    ZeroVolume,
    #[error("order price must be non-zero")]
    ZeroPrice,
    #[error("explicit side requires a positive price, got {0}")]
    SignedPriceWithSide(i64),
    #[error("instrument must not be empty")]
    EmptyInstrument,
    #[error("unknown order side {0}")]
    UnknownSide(i32),
}

impl TryFrom<pb::Order> for NewOrder {
    type Error = OrderError;

    fn try_from(value: pb::Order) -> Result<Self, Self::Error> {
        if value.instrument.is_empty() {
            return Err(OrderError::EmptyInstrument);
        }
        if value.volume == 0 {
            return Err(OrderError::ZeroVolume);
        }
        if value.price == 0 {
            return Err(OrderError::ZeroPrice);
        }
        let wire_side = pb::Side::try_from(value.side).map_err(|_| OrderError::UnknownSide(value.side))?;
        let side = match wire_side {
            pb::Side::Buy => Side::Buy,
            pb::Side::Sell => Side::Sell,
            pb::Side::Unspecified if value.price > 0 => Side::Buy,
            pb::Side::Unspecified => Side::Sell,
        };
        if wire_side != pb::Side::Unspecified && value.price < 0 {
            return Err(OrderError::SignedPriceWithSide(value.price));
        }
        Ok(Self {
            broker_id: value.broker_id,
            client_id: value.client_id,
            instrument: value.instrument,
            side,
            limit_price: value.price.unsigned_abs(),
            volume: value.volume,
        })
    }
}

impl From<Side> for pb::Side {
    fn from(value: Side) -> Self {
        match value {
            Side::Buy => pb::Side::Buy,
            Side::Sell => pb::Side::Sell,
        }
    }
}

impl From<DealId> for pb::DealId {
    fn from(value: DealId) -> Self {
        Self {
            id: value.id,
            broker_id: value.broker_id,
        }
    }
}

impl From<pb::DealId> for DealId {
    fn from(value: pb::DealId) -> Self {
        Self {
            id: value.id,
            broker_id: value.broker_id,
        }
    }
}

impl From<Fill> for pb::Fill {
    fn from(value: Fill) -> Self {
        Self {
            deal_id: value.deal_id,
            broker_id: value.broker_id,
            client_id: value.client_id,
            instrument: value.instrument,
            volume: value.volume,
            price: value.price,
            time: Some(to_timestamp(value.timestamp)),
            partial: value.partial,
            side: pb::Side::from(value.side) as i32,
        }
    }
}

impl From<OhlcvBar> for pb::Ohlcv {
    fn from(value: OhlcvBar) -> Self {
        Self {
            id: value.id,
            instrument: value.instrument,
            interval_start: Some(to_timestamp(value.interval_start)),
            interval_seconds: value.interval_secs,
            open: value.open,
            high: value.high,
            low: value.low,
            close: value.close,
            volume: value.volume,
        }
    }
}

pub fn to_timestamp(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, u32::try_from(ts.nanos).ok()?).single()
}
