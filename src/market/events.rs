use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::message::Envelope;
use crate::broker::routing::RoutingKey;
use crate::utils::error::ProcessingError;

/// First segment of every market routing key.
pub const NAMESPACE: &str = "bolsa";

/// A price quote for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub acao: String,
    pub valor: f64,
    /// Percent change.
    pub variacao: f64,
    /// Unix seconds.
    pub timestamp: f64,
}

impl Quote {
    pub fn routing_key(&self) -> String {
        format!("{NAMESPACE}.cotacoes.acoes.{}", self.acao.to_lowercase())
    }

    fn validate(&self) -> Result<(), ProcessingError> {
        require_symbol(&self.acao)?;
        require_finite("valor", self.valor)?;
        require_finite("variacao", self.variacao)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Compra,
    Venda,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Compra => write!(f, "compra"),
            TradeSide::Venda => write!(f, "venda"),
        }
    }
}

/// An executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub acao: String,
    pub quantidade: u64,
    pub valor_total: f64,
    pub tipo: TradeSide,
    /// Unix seconds.
    pub timestamp: f64,
}

impl Trade {
    pub fn routing_key(&self) -> String {
        format!(
            "{NAMESPACE}.negociacoes.{}.{}",
            self.tipo,
            self.acao.to_lowercase()
        )
    }

    fn validate(&self) -> Result<(), ProcessingError> {
        require_symbol(&self.acao)?;
        require_finite("valor_total", self.valor_total)
    }
}

fn require_symbol(acao: &str) -> Result<(), ProcessingError> {
    if acao.trim().is_empty() {
        return Err(ProcessingError::InvalidField {
            field: "acao",
            reason: "symbol is empty".into(),
        });
    }
    Ok(())
}

fn require_finite(field: &'static str, value: f64) -> Result<(), ProcessingError> {
    if !value.is_finite() {
        return Err(ProcessingError::InvalidField {
            field,
            reason: format!("{value} is not a finite number"),
        });
    }
    Ok(())
}

/// Which namespace a routing key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Quote,
    Trade,
}

impl EventKind {
    /// Classify by the key prefix: `bolsa.cotacoes.*` or `bolsa.negociacoes.*`.
    pub fn classify(key: &RoutingKey) -> Option<Self> {
        if key.segment(0) != Some(NAMESPACE) {
            return None;
        }
        match key.segment(1)? {
            "cotacoes" => Some(EventKind::Quote),
            "negociacoes" => Some(EventKind::Trade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Quote(Quote),
    Trade(Trade),
}

impl MarketEvent {
    /// Decode the envelope's payload according to its routing key.
    /// `Ok(None)` means the key is outside both market namespaces.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, ProcessingError> {
        let Some(kind) = EventKind::classify(envelope.routing_key()) else {
            return Ok(None);
        };

        let event = match kind {
            EventKind::Quote => {
                let quote: Quote = envelope
                    .decode()
                    .map_err(|source| ProcessingError::Decode {
                        kind: "quote",
                        source,
                    })?;
                quote.validate()?;
                MarketEvent::Quote(quote)
            }
            EventKind::Trade => {
                let trade: Trade = envelope
                    .decode()
                    .map_err(|source| ProcessingError::Decode {
                        kind: "trade",
                        source,
                    })?;
                trade.validate()?;
                MarketEvent::Trade(trade)
            }
        };
        Ok(Some(event))
    }

    pub fn acao(&self) -> &str {
        match self {
            MarketEvent::Quote(quote) => &quote.acao,
            MarketEvent::Trade(trade) => &trade.acao,
        }
    }

    pub fn routing_key(&self) -> String {
        match self {
            MarketEvent::Quote(quote) => quote.routing_key(),
            MarketEvent::Trade(trade) => trade.routing_key(),
        }
    }
}
