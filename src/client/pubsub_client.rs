//! Client representation
//!
//! `Client` models one connection as seen by the broker. It holds the
//! sending side of the per-connection channel used to push frames, the
//! prefetch limit requested with `qos`, and the ledger of deliveries the
//! client has not settled yet. Delivery tags are issued per client and
//! increase monotonically from 1.

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::DeliveryTag;
use crate::broker::queue::{ConsumerTag, QueuedMessage};

/// A delivery handed to the client and awaiting ack or nack.
#[derive(Debug, Clone)]
pub struct Unacked {
    pub queue: String,
    pub consumer_tag: ConsumerTag,
    pub message: QueuedMessage,
}

#[derive(Debug)]
pub struct Client {
    pub id: String,
    pub sender: UnboundedSender<WsMessage>,
    /// Set once the `hello` frame was accepted.
    pub username: Option<String>,
    /// Maximum unacked deliveries; 0 means unlimited.
    pub prefetch: u16,
    pub unacked: BTreeMap<DeliveryTag, Unacked>,
    last_delivery_tag: DeliveryTag,
}

impl Client {
    /// Create a new client with a sender channel. The `id` is a UUID used
    /// to identify the client across broker operations.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sender,
            username: None,
            prefetch: 0,
            unacked: BTreeMap::new(),
            last_delivery_tag: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.username.is_some()
    }

    pub fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }

    pub fn next_delivery_tag(&mut self) -> DeliveryTag {
        self.last_delivery_tag += 1;
        self.last_delivery_tag
    }

    /// Whether `tag` was ever issued to this client.
    pub fn issued(&self, tag: DeliveryTag) -> bool {
        tag != 0 && tag <= self.last_delivery_tag
    }
}
