use std::fmt;

use clap::ValueEnum;

use crate::connection::Connection;
use crate::utils::error::ConnectionError;

/// The topic exchange all market events are published to.
pub const EXCHANGE: &str = "bolsa";

/// The two well-known durable queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueKind {
    Cotacoes,
    Negociacoes,
}

impl QueueKind {
    pub fn queue_name(&self) -> &'static str {
        match self {
            QueueKind::Cotacoes => "cotacoes",
            QueueKind::Negociacoes => "negociacoes",
        }
    }

    pub fn binding_pattern(&self) -> &'static str {
        match self {
            QueueKind::Cotacoes => "bolsa.cotacoes.#",
            QueueKind::Negociacoes => "bolsa.negociacoes.#",
        }
    }

    pub fn banner(&self) -> &'static str {
        match self {
            QueueKind::Cotacoes => "Iniciando consumer de COTAÇÕES...",
            QueueKind::Negociacoes => "Iniciando consumer de NEGOCIAÇÕES...",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Declare the durable `bolsa` topic exchange. Safe to repeat.
pub async fn declare_exchange(connection: &mut Connection) -> Result<(), ConnectionError> {
    connection.declare_exchange(EXCHANGE, true).await
}

/// Declare the exchange, the durable queue for `kind` and its binding.
pub async fn declare_queue(
    connection: &mut Connection,
    kind: QueueKind,
) -> Result<(), ConnectionError> {
    declare_exchange(connection).await?;
    connection.declare_queue(kind.queue_name(), true).await?;
    connection
        .bind_queue(kind.queue_name(), EXCHANGE, kind.binding_pattern())
        .await
}
