use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::broker::message::{Envelope, Payload};
use crate::broker::routing::RoutingKey;
use crate::connection::connection::Connection;
use crate::utils::error::{ConnectionError, PublishError};

/// Publishes envelopes to one exchange over an owned connection.
pub struct Publisher {
    connection: Connection,
    exchange: String,
}

impl Publisher {
    pub fn new(connection: Connection, exchange: &str) -> Self {
        Self {
            connection,
            exchange: exchange.to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Publish `payload` under `routing_key` and wait for the broker's
    /// confirmation. Nothing is retried.
    pub async fn publish(
        &mut self,
        routing_key: &str,
        payload: Payload,
        durable: bool,
    ) -> Result<(), PublishError> {
        if !self.connection.is_open() {
            return Err(PublishError::BrokerUnavailable);
        }
        let key = RoutingKey::parse(routing_key)?;
        let envelope = Envelope::new(key, payload, durable);

        self.connection.publish(&self.exchange, &envelope).await?;
        debug!(exchange = %self.exchange, "published {routing_key}");
        Ok(())
    }

    /// Serialize `event` into the payload and publish it.
    pub async fn publish_event<E: Serialize>(
        &mut self,
        routing_key: &str,
        event: &E,
        durable: bool,
    ) -> Result<(), PublishError> {
        let payload = match serde_json::to_value(event) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(PublishError::InvalidPayload(format!(
                    "expected a JSON object, got {other}"
                )));
            }
            Err(e) => return Err(PublishError::InvalidPayload(e.to_string())),
        };
        self.publish(routing_key, payload, durable).await
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.connection.close().await
    }
}
