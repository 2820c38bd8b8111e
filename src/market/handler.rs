//! Interpretation of market deliveries.
//!
//! Quotes and trades are decoded from the delivery payload, rendered as a
//! one-line summary and, for quotes with a large variation, flagged with an
//! alert. Deliveries outside both namespaces are accepted untouched.

use tracing::{debug, info, warn};

use crate::broker::message::Delivery;
use crate::connection::DeliveryHandler;
use crate::market::events::{MarketEvent, Quote, Trade};
use crate::utils::error::ProcessingError;

/// Absolute variation, in percent, above which a quote raises an alert.
pub const ALERT_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Alta,
    Queda,
}

impl Alert {
    pub fn for_variation(variacao: f64) -> Option<Self> {
        if variacao > ALERT_THRESHOLD {
            Some(Alert::Alta)
        } else if variacao < -ALERT_THRESHOLD {
            Some(Alert::Queda)
        } else {
            None
        }
    }

    pub fn message(&self, acao: &str) -> String {
        match self {
            Alert::Alta => format!("ALERTA: {acao} em alta expressiva!"),
            Alert::Queda => format!("ALERTA: {acao} em queda expressiva!"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub event: MarketEvent,
    pub summary: String,
    pub alert: Option<Alert>,
}

impl Interpretation {
    pub fn alert_message(&self) -> Option<String> {
        self.alert.map(|alert| alert.message(self.event.acao()))
    }
}

/// Price and variation print as shortest round-trip decimals, so a whole
/// price keeps its `.0`.
pub fn format_quote(quote: &Quote) -> String {
    format!(
        "Cotação de {}: R$ {:?} (variação: {:?}%)",
        quote.acao, quote.valor, quote.variacao
    )
}

pub fn format_trade(trade: &Trade) -> String {
    format!(
        "Negociação de {}: {} de {} ações por R$ {:.2}",
        trade.acao, trade.tipo, trade.quantidade, trade.valor_total
    )
}

/// Decode and summarize a delivery. `Ok(None)` for keys that are neither
/// quotes nor trades.
pub fn interpret(delivery: &Delivery) -> Result<Option<Interpretation>, ProcessingError> {
    let Some(event) = MarketEvent::decode(&delivery.envelope)? else {
        return Ok(None);
    };

    let (summary, alert) = match &event {
        MarketEvent::Quote(quote) => (format_quote(quote), Alert::for_variation(quote.variacao)),
        MarketEvent::Trade(trade) => (format_trade(trade), None),
    };
    Ok(Some(Interpretation {
        event,
        summary,
        alert,
    }))
}

/// Logs every delivery it interprets and keeps the latest result.
#[derive(Debug, Default)]
pub struct MarketHandler {
    processed: usize,
    last: Option<Interpretation>,
}

impl MarketHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn last(&self) -> Option<&Interpretation> {
        self.last.as_ref()
    }
}

impl DeliveryHandler for MarketHandler {
    fn handle(&mut self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let routing_key = delivery.routing_key();
        info!("Recebida mensagem com routing key: {routing_key}");
        info!(
            "Conteúdo: {}",
            serde_json::Value::Object(delivery.envelope.payload().clone())
        );
        if delivery.redelivered {
            debug!(%routing_key, "message was delivered before");
        }

        match interpret(delivery)? {
            Some(interpretation) => {
                info!("{}", interpretation.summary);
                if let Some(alert) = interpretation.alert_message() {
                    warn!("{alert}");
                }
                self.last = Some(interpretation);
            }
            None => debug!(%routing_key, "not a market event, accepting as is"),
        }

        self.processed += 1;
        info!("Mensagem processada com sucesso!");
        Ok(())
    }
}
