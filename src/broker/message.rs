//! Message definitions shared by the broker and its clients.
//!
//! `Envelope` is the unit of transfer: a routing key, a JSON object payload
//! and a durability flag. It is immutable once built. Everything the broker
//! assigns per delivery attempt (delivery tag, redelivered flag, consumer
//! tag) lives on `Delivery` instead.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broker::routing::RoutingKey;

/// Structured, schema-less payload.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Broker-issued handle for one delivery attempt, unique per connection.
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    routing_key: RoutingKey,
    payload: Payload,
    durable: bool,
}

impl Envelope {
    pub fn new(routing_key: RoutingKey, payload: Payload, durable: bool) -> Self {
        Self {
            routing_key,
            payload,
            durable,
        }
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Decodes the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// One delivery of an envelope to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub envelope: Envelope,
}

impl Delivery {
    pub fn routing_key(&self) -> &RoutingKey {
        self.envelope.routing_key()
    }
}
