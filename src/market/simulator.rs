use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::connection::Publisher;
use crate::market::events::{Quote, Trade, TradeSide};
use crate::utils::error::PublishError;

pub const SYMBOLS: [&str; 5] = ["PETR4", "VALE3", "ITUB4", "BBDC4", "ABEV3"];

/// Chance that a tick also produces a trade.
pub const TRADE_PROBABILITY: f64 = 0.3;

/// Events produced by one simulation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub quote: Quote,
    pub trade: Option<Trade>,
}

/// Generates random quotes and occasional trades.
pub struct MarketSimulator {
    rng: StdRng,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Current time as fractional Unix seconds.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Default for MarketSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketSimulator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create with a specific seed for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn tick(&mut self, timestamp: f64) -> Tick {
        let acao = SYMBOLS[self.rng.gen_range(0..SYMBOLS.len())].to_string();
        let valor = round2(self.rng.gen_range(10.0..100.0));
        let variacao = round2(self.rng.gen_range(-5.0..5.0));

        let trade = self.rng.gen_bool(TRADE_PROBABILITY).then(|| {
            let quantidade: u64 = self.rng.gen_range(100..=10_000);
            let tipo = if self.rng.gen_bool(0.5) {
                TradeSide::Compra
            } else {
                TradeSide::Venda
            };
            Trade {
                acao: acao.clone(),
                quantidade,
                valor_total: round2(quantidade as f64 * valor),
                tipo,
                timestamp,
            }
        });

        Tick {
            quote: Quote {
                acao,
                valor,
                variacao,
                timestamp,
            },
            trade,
        }
    }
}

/// Publish `count` ticks, pausing `interval` after each, then close the
/// publisher's connection whether or not publishing succeeded. Returns the
/// number of messages published.
pub async fn simulate(
    publisher: &mut Publisher,
    simulator: &mut MarketSimulator,
    count: usize,
    interval: Duration,
) -> Result<usize, PublishError> {
    let result = publish_ticks(publisher, simulator, count, interval).await;
    if let Err(e) = publisher.close().await {
        warn!("Failed to close the connection cleanly: {e}");
    }
    info!("Conexão fechada");
    result
}

async fn publish_ticks(
    publisher: &mut Publisher,
    simulator: &mut MarketSimulator,
    count: usize,
    interval: Duration,
) -> Result<usize, PublishError> {
    let mut published = 0;
    for _ in 0..count {
        let tick = simulator.tick(now_timestamp());

        let key = tick.quote.routing_key();
        publisher.publish_event(&key, &tick.quote, true).await?;
        info!("Mensagem enviada: {key} - {:?}", tick.quote);
        published += 1;

        if let Some(trade) = &tick.trade {
            let key = trade.routing_key();
            publisher.publish_event(&key, trade, true).await?;
            info!("Mensagem enviada: {key} - {trade:?}");
            published += 1;
        }

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(published)
}
