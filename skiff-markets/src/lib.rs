//! Venue-agnostic adapter traits used by the rest of the engine.
//!
//! Each venue driver exposes the same capability set: top of book, depth,
//! simulated order placement, a fee schedule and a latency estimate.
//! Multiple adapters coexist behind a [`VenueRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use skiff_core::{Price, Quantity, Side, Symbol, VenueId};
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for adapter results.
pub type VenueResult<T> = Result<T, VenueError>;

/// Common error type returned by venue adapters.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level failures (network, TLS, timeouts).
    #[error("transport error: {0}")]
    Transport(String),
    /// The operation exceeded its deadline.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// The request parameters are invalid for the target venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Venue responded with a business error.
    #[error("venue error: {0}")]
    Exchange(String),
    /// The adapter has no market data for the symbol yet.
    #[error("no quote available for {0}")]
    NoQuote(Symbol),
}

/// Best bid and ask captured at a point in time.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct BestBidAsk {
    pub bid: Price,
    pub ask: Price,
    pub timestamp: DateTime<Utc>,
}

impl BestBidAsk {
    /// Midpoint of the spread.
    #[must_use]
    pub fn mid(&self) -> Price {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

/// One side of the depth snapshot.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Quantity,
}

/// Truncated order book returned by `order_book`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

/// Taker/maker fees expressed in basis points.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeeSchedule {
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
}

impl FeeSchedule {
    /// Fractional taker rate (bps / 10_000).
    #[must_use]
    pub fn taker_rate(&self) -> Decimal {
        self.taker_bps / Decimal::from(10_000)
    }
}

/// Round-trip latency estimate used by the arbitrage edge model.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct VenueLatency {
    pub round_trip_ms: u64,
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub limit_price: Option<Price>,
    pub client_order_id: Option<String>,
}

/// Acknowledgement returned for a (simulated) order placement.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VenueOrderAck {
    pub order_id: Uuid,
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: Side,
    pub fill_price: Price,
    pub quantity: Quantity,
    pub timestamp: DateTime<Utc>,
}

/// Capability set implemented by every venue driver.
#[async_trait]
pub trait MarketAdapter: Send + Sync {
    /// Which venue this adapter speaks for.
    fn venue(&self) -> VenueId;

    /// Current best bid/ask for a symbol.
    async fn best_bid_ask(&self, symbol: &str) -> VenueResult<BestBidAsk>;

    /// Depth snapshot truncated to `limit` levels per side.
    async fn order_book(&self, symbol: &str, limit: usize) -> VenueResult<BookSnapshot>;

    /// Place a paper order; fills immediately against the stored quote.
    async fn place_order(&self, request: VenueOrderRequest) -> VenueResult<VenueOrderAck>;

    /// Venue fee schedule.
    fn fees(&self) -> FeeSchedule;

    /// Latency estimate for the venue round trip.
    fn latency(&self) -> VenueLatency;
}

/// Immutable lookup of adapters keyed by venue, assembled at boot.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    adapters: HashMap<VenueId, Arc<dyn MarketAdapter>>,
}

impl VenueRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous driver for the venue.
    pub fn register(&mut self, adapter: Arc<dyn MarketAdapter>) {
        let venue = adapter.venue();
        if self.adapters.insert(venue, adapter).is_some() {
            tracing::warn!(venue = %venue, "duplicate venue adapter registered; overriding");
        }
    }

    #[must_use]
    pub fn get(&self, venue: VenueId) -> Option<Arc<dyn MarketAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    /// All registered adapters in unspecified order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn MarketAdapter>> {
        self.adapters.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// In-memory venue used in paper mode and by tests. Quotes are pushed in
/// by the market stream; orders fill instantly at the stored top of book.
pub struct PaperVenue {
    venue: VenueId,
    quotes: Mutex<HashMap<Symbol, BestBidAsk>>,
    fees: FeeSchedule,
    latency: VenueLatency,
}

impl PaperVenue {
    pub fn new(venue: VenueId, fees: FeeSchedule, latency: VenueLatency) -> Self {
        Self {
            venue,
            quotes: Mutex::new(HashMap::new()),
            fees,
            latency,
        }
    }

    /// Update the stored top of book for a symbol.
    pub fn update_quote(&self, symbol: &str, bid: Price, ask: Price) {
        let mut quotes = self.quotes.lock().expect("quote map poisoned");
        quotes.insert(
            symbol.to_string(),
            BestBidAsk {
                bid,
                ask,
                timestamp: Utc::now(),
            },
        );
    }

    fn quote(&self, symbol: &str) -> VenueResult<BestBidAsk> {
        self.quotes
            .lock()
            .expect("quote map poisoned")
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::NoQuote(symbol.to_string()))
    }
}

#[async_trait]
impl MarketAdapter for PaperVenue {
    fn venue(&self) -> VenueId {
        self.venue
    }

    async fn best_bid_ask(&self, symbol: &str) -> VenueResult<BestBidAsk> {
        self.quote(symbol)
    }

    async fn order_book(&self, symbol: &str, limit: usize) -> VenueResult<BookSnapshot> {
        let quote = self.quote(symbol)?;
        let depth = limit.max(1).min(50);
        let step = Decimal::new(1, 4) * quote.mid().max(Decimal::ONE);
        let mut bids = Vec::with_capacity(depth);
        let mut asks = Vec::with_capacity(depth);
        for level in 0..depth {
            let offset = step * Decimal::from(level as u64);
            bids.push(BookLevel {
                price: quote.bid - offset,
                size: Decimal::ONE,
            });
            asks.push(BookLevel {
                price: quote.ask + offset,
                size: Decimal::ONE,
            });
        }
        Ok(BookSnapshot {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: quote.timestamp,
        })
    }

    async fn place_order(&self, request: VenueOrderRequest) -> VenueResult<VenueOrderAck> {
        if request.quantity <= Decimal::ZERO {
            return Err(VenueError::InvalidRequest(format!(
                "quantity must be positive (got {})",
                request.quantity
            )));
        }
        let quote = self.quote(&request.symbol)?;
        let fill_price = match request.side {
            Side::Buy => request.limit_price.map_or(quote.ask, |p| p.min(quote.ask)),
            Side::Sell => request.limit_price.map_or(quote.bid, |p| p.max(quote.bid)),
        };
        tracing::info!(
            venue = %self.venue,
            symbol = %request.symbol,
            side = %request.side,
            qty = %request.quantity,
            price = %fill_price,
            "paper venue order filled"
        );
        Ok(VenueOrderAck {
            order_id: Uuid::new_v4(),
            venue: self.venue,
            symbol: request.symbol,
            side: request.side,
            fill_price,
            quantity: request.quantity,
            timestamp: Utc::now(),
        })
    }

    fn fees(&self) -> FeeSchedule {
        self.fees
    }

    fn latency(&self) -> VenueLatency {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> PaperVenue {
        PaperVenue::new(
            VenueId::Binance,
            FeeSchedule {
                maker_bps: Decimal::from(2),
                taker_bps: Decimal::from(10),
            },
            VenueLatency { round_trip_ms: 40 },
        )
    }

    #[tokio::test]
    async fn quotes_round_trip_through_the_adapter() {
        let venue = paper();
        venue.update_quote("BTC-USDC", Decimal::from(59_990), Decimal::from(60_010));
        let quote = venue.best_bid_ask("BTC-USDC").await.unwrap();
        assert_eq!(quote.mid(), Decimal::from(60_000));
        assert!(matches!(
            venue.best_bid_ask("ETH-USDC").await,
            Err(VenueError::NoQuote(_))
        ));
    }

    #[tokio::test]
    async fn buy_orders_cross_the_spread() {
        let venue = paper();
        venue.update_quote("BTC-USDC", Decimal::from(59_990), Decimal::from(60_010));
        let ack = venue
            .place_order(VenueOrderRequest {
                symbol: "BTC-USDC".into(),
                side: Side::Buy,
                quantity: Decimal::ONE,
                limit_price: None,
                client_order_id: None,
            })
            .await
            .unwrap();
        assert_eq!(ack.fill_price, Decimal::from(60_010));
    }

    #[tokio::test]
    async fn registry_exposes_all_adapters() {
        let mut registry = VenueRegistry::new();
        registry.register(Arc::new(paper()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(VenueId::Binance).is_some());
        assert!(registry.get(VenueId::Kucoin).is_none());
    }

    #[test]
    fn taker_rate_is_fractional() {
        let fees = FeeSchedule {
            maker_bps: Decimal::from(2),
            taker_bps: Decimal::from(10),
        };
        assert_eq!(fees.taker_rate(), Decimal::new(1, 3));
    }
}
