//! Wire frames exchanged between broker and clients.
//!
//! Every request except `ack`/`nack` carries a `request_id`. The broker
//! answers it with `ok` or `error` carrying the same id. Settlements get no
//! reply. A misuse there is reported with an `error` frame with no
//! `request_id`. Deliveries are pushed as `deliver` frames at any time, so
//! a client waiting for a reply must buffer them.

use serde::{Deserialize, Serialize};

use crate::broker::exchange::ExchangeKind;
use crate::broker::message::{Delivery, DeliveryTag, Envelope};
use crate::utils::error::ErrorCode;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        request_id: RequestId,
        username: String,
        vhost: String,
    },
    ExchangeDeclare {
        request_id: RequestId,
        exchange: String,
        #[serde(default)]
        kind: ExchangeKind,
        durable: bool,
    },
    QueueDeclare {
        request_id: RequestId,
        queue: String,
        durable: bool,
    },
    QueueBind {
        request_id: RequestId,
        queue: String,
        exchange: String,
        pattern: String,
    },
    Qos {
        request_id: RequestId,
        prefetch_count: u16,
    },
    Consume {
        request_id: RequestId,
        queue: String,
    },
    Cancel {
        request_id: RequestId,
        consumer_tag: String,
    },
    Publish {
        request_id: RequestId,
        exchange: String,
        envelope: Envelope,
    },
    Ack {
        delivery_tag: DeliveryTag,
    },
    Nack {
        delivery_tag: DeliveryTag,
        requeue: bool,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Hello { request_id, .. }
            | ClientMessage::ExchangeDeclare { request_id, .. }
            | ClientMessage::QueueDeclare { request_id, .. }
            | ClientMessage::QueueBind { request_id, .. }
            | ClientMessage::Qos { request_id, .. }
            | ClientMessage::Consume { request_id, .. }
            | ClientMessage::Cancel { request_id, .. }
            | ClientMessage::Publish { request_id, .. } => Some(*request_id),
            ClientMessage::Ack { .. } | ClientMessage::Nack { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ok {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_tag: Option<String>,
    },
    Error {
        #[serde(default)]
        request_id: Option<RequestId>,
        code: ErrorCode,
        message: String,
    },
    Deliver(Delivery),
}
