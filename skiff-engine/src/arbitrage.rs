//! Cross-venue arbitrage: scan every adapter pair for a positive net
//! spread, then fill both legs concurrently with a hedge fallback.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use skiff_core::{round_price, Side, Symbol, Trade, VenueId};
use skiff_history::HistoryStore;
use skiff_markets::{MarketAdapter, VenueError, VenueOrderRequest, VenueRegistry, VenueResult};
use tracing::{info, warn};
use uuid::Uuid;

/// Edge-model settings for the scanner.
#[derive(Clone, Copy, Debug)]
pub struct ArbitrageConfig {
    /// Slippage assumed per leg, in basis points.
    pub slippage_bps: f64,
    /// Extra haircut per millisecond of combined venue latency.
    pub latency_buffer_per_ms: f64,
    /// Minimum net edge required to emit an opportunity.
    pub min_net_pct: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 4.0,
            latency_buffer_per_ms: 1e-6,
            min_net_pct: 0.0,
        }
    }
}

/// A profitable cross-venue spread after costs.
#[derive(Clone, Debug)]
pub struct ArbOpportunity {
    pub id: Uuid,
    pub symbol: Symbol,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_ask: Decimal,
    pub sell_bid: Decimal,
    pub net_pct: f64,
}

/// Result of executing both legs.
#[derive(Clone, Debug)]
pub struct ArbExecution {
    pub opportunity_id: Uuid,
    pub buy_trade: Option<Trade>,
    pub sell_trade: Option<Trade>,
    /// Set when one leg failed and the filled leg was flattened at market.
    pub hedged: bool,
}

/// Scans adapters and routes simulated orders to the best venue pair.
pub struct ArbitrageOrchestrator {
    registry: VenueRegistry,
    history: Arc<dyn HistoryStore>,
    config: ArbitrageConfig,
}

impl ArbitrageOrchestrator {
    pub fn new(
        registry: VenueRegistry,
        history: Arc<dyn HistoryStore>,
        config: ArbitrageConfig,
    ) -> Self {
        Self {
            registry,
            history,
            config,
        }
    }

    /// Query best bid/ask on every venue and return the best positive-net
    /// pairing, if any.
    pub async fn scan(&self, symbol: &str) -> VenueResult<Option<ArbOpportunity>> {
        let adapters = self.registry.all();
        if adapters.len() < 2 {
            return Ok(None);
        }
        let mut quotes = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            match adapter.best_bid_ask(symbol).await {
                Ok(quote) => quotes.push((adapter.clone(), quote)),
                Err(err) => {
                    warn!(venue = %adapter.venue(), error = %err, "quote unavailable during scan");
                }
            }
        }
        if quotes.len() < 2 {
            return Ok(None);
        }

        let mut best: Option<ArbOpportunity> = None;
        for (buy_adapter, buy_quote) in &quotes {
            for (sell_adapter, sell_quote) in &quotes {
                if buy_adapter.venue() == sell_adapter.venue() {
                    continue;
                }
                let ask = buy_quote.ask.to_f64().unwrap_or_default();
                let bid = sell_quote.bid.to_f64().unwrap_or_default();
                if ask <= 0.0 {
                    continue;
                }
                let gross = (bid - ask) / ask;
                let fees = (buy_adapter.fees().taker_rate() + sell_adapter.fees().taker_rate())
                    .to_f64()
                    .unwrap_or_default();
                let slippage = 2.0 * self.config.slippage_bps / 10_000.0;
                let latency_ms = (buy_adapter.latency().round_trip_ms
                    + sell_adapter.latency().round_trip_ms) as f64;
                let net = gross - fees - slippage - latency_ms * self.config.latency_buffer_per_ms;
                if net > self.config.min_net_pct
                    && best.as_ref().map(|b| net > b.net_pct).unwrap_or(true)
                {
                    best = Some(ArbOpportunity {
                        id: Uuid::new_v4(),
                        symbol: symbol.to_string(),
                        buy_venue: buy_adapter.venue(),
                        sell_venue: sell_adapter.venue(),
                        buy_ask: buy_quote.ask,
                        sell_bid: sell_quote.bid,
                        net_pct: net,
                    });
                }
            }
        }
        if let Some(opportunity) = &best {
            info!(
                symbol,
                buy = %opportunity.buy_venue,
                sell = %opportunity.sell_venue,
                net_pct = opportunity.net_pct,
                "arbitrage opportunity detected"
            );
        }
        Ok(best)
    }

    /// Place both legs concurrently. When exactly one leg fails, the
    /// filled leg is immediately hedged at market on its own venue.
    pub async fn execute(
        &self,
        opportunity: &ArbOpportunity,
        quantity: Decimal,
    ) -> VenueResult<ArbExecution> {
        let buy_venue = self
            .registry
            .get(opportunity.buy_venue)
            .ok_or_else(|| VenueError::InvalidRequest("buy venue not registered".into()))?;
        let sell_venue = self
            .registry
            .get(opportunity.sell_venue)
            .ok_or_else(|| VenueError::InvalidRequest("sell venue not registered".into()))?;

        let buy_request = VenueOrderRequest {
            symbol: opportunity.symbol.clone(),
            side: Side::Buy,
            quantity,
            limit_price: Some(opportunity.buy_ask),
            client_order_id: Some(format!("{}-buy", opportunity.id)),
        };
        let sell_request = VenueOrderRequest {
            symbol: opportunity.symbol.clone(),
            side: Side::Sell,
            quantity,
            limit_price: Some(opportunity.sell_bid),
            client_order_id: Some(format!("{}-sell", opportunity.id)),
        };
        let (buy_result, sell_result) = tokio::join!(
            buy_venue.place_order(buy_request),
            sell_venue.place_order(sell_request)
        );

        match (buy_result, sell_result) {
            (Ok(buy_ack), Ok(sell_ack)) => {
                let buy_trade = self.record_leg(opportunity, Side::Buy, buy_ack.fill_price, quantity, &buy_venue)?;
                let sell_trade =
                    self.record_leg(opportunity, Side::Sell, sell_ack.fill_price, quantity, &sell_venue)?;
                Ok(ArbExecution {
                    opportunity_id: opportunity.id,
                    buy_trade: Some(buy_trade),
                    sell_trade: Some(sell_trade),
                    hedged: false,
                })
            }
            (Ok(buy_ack), Err(err)) => {
                warn!(error = %err, "sell leg failed; hedging the filled buy leg");
                let hedge = buy_venue
                    .place_order(VenueOrderRequest {
                        symbol: opportunity.symbol.clone(),
                        side: Side::Sell,
                        quantity,
                        limit_price: None,
                        client_order_id: Some(format!("{}-hedge", opportunity.id)),
                    })
                    .await?;
                let buy_trade = self.record_leg(opportunity, Side::Buy, buy_ack.fill_price, quantity, &buy_venue)?;
                let hedge_trade =
                    self.record_leg(opportunity, Side::Sell, hedge.fill_price, quantity, &buy_venue)?;
                Ok(ArbExecution {
                    opportunity_id: opportunity.id,
                    buy_trade: Some(buy_trade),
                    sell_trade: Some(hedge_trade),
                    hedged: true,
                })
            }
            (Err(err), Ok(sell_ack)) => {
                warn!(error = %err, "buy leg failed; hedging the filled sell leg");
                let hedge = sell_venue
                    .place_order(VenueOrderRequest {
                        symbol: opportunity.symbol.clone(),
                        side: Side::Buy,
                        quantity,
                        limit_price: None,
                        client_order_id: Some(format!("{}-hedge", opportunity.id)),
                    })
                    .await?;
                let sell_trade =
                    self.record_leg(opportunity, Side::Sell, sell_ack.fill_price, quantity, &sell_venue)?;
                let hedge_trade =
                    self.record_leg(opportunity, Side::Buy, hedge.fill_price, quantity, &sell_venue)?;
                Ok(ArbExecution {
                    opportunity_id: opportunity.id,
                    buy_trade: Some(hedge_trade),
                    sell_trade: Some(sell_trade),
                    hedged: true,
                })
            }
            (Err(buy_err), Err(sell_err)) => {
                warn!(buy = %buy_err, sell = %sell_err, "both arbitrage legs failed");
                Ok(ArbExecution {
                    opportunity_id: opportunity.id,
                    buy_trade: None,
                    sell_trade: None,
                    hedged: false,
                })
            }
        }
    }

    fn record_leg(
        &self,
        opportunity: &ArbOpportunity,
        side: Side,
        fill_price: Decimal,
        quantity: Decimal,
        venue: &Arc<dyn MarketAdapter>,
    ) -> VenueResult<Trade> {
        let fee = round_price(fill_price * quantity * venue.fees().taker_rate());
        let trade = Trade {
            id: Uuid::new_v4(),
            decision_id: None,
            arbitrage_id: Some(opportunity.id),
            symbol: opportunity.symbol.clone(),
            side,
            price: fill_price,
            quantity,
            fee,
            pnl: None,
            r_multiple: None,
            exit_reason: None,
            simulation: None,
            timestamp: Utc::now(),
        };
        self.history
            .append_trade(&trade)
            .map_err(|err| VenueError::Exchange(format!("failed to journal arb leg: {err}")))?;
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use skiff_history::JsonlHistoryStore;
    use skiff_markets::{FeeSchedule, PaperVenue, VenueLatency};
    use tempfile::TempDir;

    use super::*;

    fn venue(id: VenueId, bid: i64, ask: i64) -> Arc<PaperVenue> {
        let venue = PaperVenue::new(
            id,
            FeeSchedule {
                maker_bps: Decimal::from(1),
                taker_bps: Decimal::from(5),
            },
            VenueLatency { round_trip_ms: 30 },
        );
        venue.update_quote("BTC-USDC", Decimal::from(bid), Decimal::from(ask));
        Arc::new(venue)
    }

    fn orchestrator(registry: VenueRegistry) -> (TempDir, ArbitrageOrchestrator) {
        let dir = TempDir::new().unwrap();
        let history = Arc::new(JsonlHistoryStore::open(dir.path()).unwrap());
        (
            dir,
            ArbitrageOrchestrator::new(registry, history, ArbitrageConfig::default()),
        )
    }

    #[tokio::test]
    async fn wide_cross_venue_spreads_surface_an_opportunity() {
        let mut registry = VenueRegistry::new();
        registry.register(venue(VenueId::Binance, 59_900, 59_910));
        registry.register(venue(VenueId::Kucoin, 60_200, 60_210));
        let (_dir, orchestrator) = orchestrator(registry);
        let opportunity = orchestrator.scan("BTC-USDC").await.unwrap().unwrap();
        assert_eq!(opportunity.buy_venue, VenueId::Binance);
        assert_eq!(opportunity.sell_venue, VenueId::Kucoin);
        assert!(opportunity.net_pct > 0.0);
    }

    #[tokio::test]
    async fn flat_markets_yield_nothing() {
        let mut registry = VenueRegistry::new();
        registry.register(venue(VenueId::Binance, 59_990, 60_010));
        registry.register(venue(VenueId::Kucoin, 59_991, 60_011));
        let (_dir, orchestrator) = orchestrator(registry);
        assert!(orchestrator.scan("BTC-USDC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_records_both_legs_with_the_arbitrage_tag() {
        let mut registry = VenueRegistry::new();
        registry.register(venue(VenueId::Binance, 59_900, 59_910));
        registry.register(venue(VenueId::Kucoin, 60_200, 60_210));
        let (_dir, orchestrator) = orchestrator(registry);
        let opportunity = orchestrator.scan("BTC-USDC").await.unwrap().unwrap();
        let execution = orchestrator
            .execute(&opportunity, Decimal::new(1, 1))
            .await
            .unwrap();
        assert!(!execution.hedged);
        let buy = execution.buy_trade.unwrap();
        let sell = execution.sell_trade.unwrap();
        assert_eq!(buy.arbitrage_id, Some(opportunity.id));
        assert_eq!(sell.arbitrage_id, Some(opportunity.id));
        assert!(sell.price > buy.price);
        let journaled = orchestrator.history.recent_trades(10).unwrap();
        assert_eq!(journaled.len(), 2);
    }

    #[tokio::test]
    async fn missing_quote_on_one_venue_hedges_the_filled_leg() {
        let mut registry = VenueRegistry::new();
        registry.register(venue(VenueId::Binance, 59_900, 59_910));
        // Kucoin quotes during the scan, then loses the symbol before
        // execution by quoting a different symbol only.
        let kucoin = venue(VenueId::Kucoin, 60_200, 60_210);
        registry.register(kucoin.clone());
        let (_dir, orchestrator) = orchestrator(registry);
        let opportunity = orchestrator.scan("BTC-USDC").await.unwrap().unwrap();

        // Rebuild the registry with a Kucoin adapter that has no quote.
        let mut broken = VenueRegistry::new();
        broken.register(venue(VenueId::Binance, 59_900, 59_910));
        broken.register(Arc::new(PaperVenue::new(
            VenueId::Kucoin,
            FeeSchedule {
                maker_bps: Decimal::from(1),
                taker_bps: Decimal::from(5),
            },
            VenueLatency { round_trip_ms: 30 },
        )));
        let dir = TempDir::new().unwrap();
        let history = Arc::new(JsonlHistoryStore::open(dir.path()).unwrap());
        let orchestrator =
            ArbitrageOrchestrator::new(broken, history, ArbitrageConfig::default());

        let execution = orchestrator
            .execute(&opportunity, Decimal::new(1, 1))
            .await
            .unwrap();
        assert!(execution.hedged);
        assert!(execution.buy_trade.is_some());
        assert!(execution.sell_trade.is_some());
    }
}
