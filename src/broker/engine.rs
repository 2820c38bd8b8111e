//! Broker engine
//!
//! This module contains the broker implementation responsible for:
//! - declaring topic exchanges, durable queues and bindings (idempotently)
//! - routing published envelopes to every queue with a matching binding
//! - handing queued messages to consumers within their prefetch limit
//! - settling deliveries: ack removes, nack discards or requeues
//! - returning unsettled deliveries to their queue when a client goes away
//! - persisting durable topology and messages through `Persistence`
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`) by the transport layer. Callers must not hold the
//!   lock across network I/O; frames are pushed to clients through their
//!   unbounded channels, never written directly.
//! - Dispatch happens eagerly: every operation that makes a message or a
//!   prefetch slot available tries to deliver right away.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::exchange::Exchange;
use crate::broker::message::{Delivery, DeliveryTag, Envelope};
use crate::broker::queue::{ConsumerTag, Queue, QueuedMessage};
use crate::broker::routing::BindingPattern;
use crate::client::{Client, Unacked};
use crate::persistence::{Persistence, StoredMessage, TopologyRecord};
use crate::transport::message::ServerMessage;
use crate::utils::error::{BrokerError, ProtocolViolation};

pub type SubscriberId = String;
pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker, recovering the guard if a holder panicked.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub tag: ConsumerTag,
    pub client_id: SubscriberId,
    pub queue: String,
}

#[derive(Debug)]
pub struct Broker {
    pub vhost: String,
    pub exchanges: HashMap<String, Exchange>,
    pub queues: HashMap<String, Queue>,
    pub clients: HashMap<SubscriberId, Client>,
    pub consumers: HashMap<ConsumerTag, Consumer>,
    persistence: Option<Persistence>,
    last_message_id: u64,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub const DEFAULT_VHOST: &'static str = "/";

    /// An in-memory broker; durable flags are honoured but nothing is stored.
    pub fn new() -> Self {
        Self {
            vhost: Self::DEFAULT_VHOST.to_string(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            clients: HashMap::new(),
            consumers: HashMap::new(),
            persistence: None,
            last_message_id: 0,
        }
    }

    /// A broker backed by `persistence`, restoring whatever it holds.
    pub fn new_with_persistence(persistence: Persistence) -> Result<Self, BrokerError> {
        let mut broker = Self::new();
        broker.restore(&persistence)?;
        broker.persistence = Some(persistence);
        Ok(broker)
    }

    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_string();
        self
    }

    fn restore(&mut self, persistence: &Persistence) -> Result<(), BrokerError> {
        for record in persistence.load_topology()? {
            match record {
                TopologyRecord::Exchange { name } => {
                    self.exchanges
                        .insert(name.clone(), Exchange::new(&name, true));
                }
                TopologyRecord::Queue { name } => {
                    self.queues.insert(name.clone(), Queue::new(&name, true));
                }
                TopologyRecord::Binding {
                    exchange,
                    queue,
                    pattern,
                } => {
                    let pattern =
                        BindingPattern::parse(&pattern).map_err(BrokerError::InvalidPattern)?;
                    if let Some(exchange) = self.exchanges.get_mut(&exchange) {
                        exchange.bind(&queue, pattern);
                    }
                }
            }
        }

        let mut restored = 0;
        for queue in self.queues.values_mut() {
            for (id, stored) in persistence.load_messages(&queue.name)? {
                self.last_message_id = self.last_message_id.max(id);
                queue.enqueue(QueuedMessage {
                    id,
                    exchange: stored.exchange,
                    envelope: stored.envelope,
                    redelivered: false,
                    persisted: true,
                });
                restored += 1;
            }
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            messages = restored,
            "restored durable state"
        );
        Ok(())
    }

    fn persist_topology(&self, record: TopologyRecord) -> Result<(), BrokerError> {
        if let Some(persistence) = &self.persistence {
            persistence.save_topology(&record)?;
        }
        Ok(())
    }

    fn forget(&self, queue: &str, message: &QueuedMessage) {
        if !message.persisted {
            return;
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove_message(queue, message.id) {
                error!(queue, id = message.id, "failed to remove settled message: {e}");
            }
        }
    }

    pub fn register_client(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Accept the `hello` of `client_id` for `vhost`.
    pub fn open(
        &mut self,
        client_id: &str,
        username: &str,
        vhost: &str,
    ) -> Result<(), BrokerError> {
        if vhost != self.vhost {
            return Err(BrokerError::UnknownVhost(vhost.to_string()));
        }
        let client = self.client_mut(client_id)?;
        client.username = Some(username.to_string());
        info!(client = client_id, username, vhost, "session opened");
        Ok(())
    }

    fn client_mut(&mut self, client_id: &str) -> Result<&mut Client, BrokerError> {
        self.clients
            .get_mut(client_id)
            .ok_or_else(|| BrokerError::UnknownClient(client_id.to_string()))
    }

    /// Declare a topic exchange. Redeclaring with the same durability is a no-op.
    pub fn declare_exchange(&mut self, name: &str, durable: bool) -> Result<(), BrokerError> {
        if let Some(existing) = self.exchanges.get(name) {
            if existing.durable != durable {
                return Err(BrokerError::PreconditionFailed {
                    name: name.to_string(),
                    existing: existing.durable,
                });
            }
            return Ok(());
        }
        if durable {
            self.persist_topology(TopologyRecord::Exchange {
                name: name.to_string(),
            })?;
        }
        self.exchanges
            .insert(name.to_string(), Exchange::new(name, durable));
        info!(exchange = name, durable, "exchange declared");
        Ok(())
    }

    /// Declare a queue. Redeclaring with the same durability is a no-op.
    pub fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), BrokerError> {
        if let Some(existing) = self.queues.get(name) {
            if existing.durable != durable {
                return Err(BrokerError::PreconditionFailed {
                    name: name.to_string(),
                    existing: existing.durable,
                });
            }
            return Ok(());
        }
        if durable {
            self.persist_topology(TopologyRecord::Queue {
                name: name.to_string(),
            })?;
        }
        self.queues.insert(name.to_string(), Queue::new(name, durable));
        info!(queue = name, durable, "queue declared");
        Ok(())
    }

    /// Bind `queue` to `exchange` with `pattern`. Binding twice is a no-op.
    pub fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let pattern = BindingPattern::parse(pattern).map_err(BrokerError::InvalidPattern)?;
        let queue_durable = self
            .queues
            .get(queue)
            .map(|q| q.durable)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let target = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        if target.bindings.iter().any(|b| b.queue == queue && b.pattern == pattern) {
            return Ok(());
        }
        if queue_durable && target.durable {
            self.persist_topology(TopologyRecord::Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            })?;
        }
        if let Some(target) = self.exchanges.get_mut(exchange) {
            target.bind(queue, pattern.clone());
        }
        info!(queue, exchange, %pattern, "queue bound");
        Ok(())
    }

    /// Set the prefetch limit of a client's channel (0 = unlimited).
    pub fn set_prefetch(&mut self, client_id: &str, prefetch: u16) -> Result<(), BrokerError> {
        self.client_mut(client_id)?.prefetch = prefetch;
        Ok(())
    }

    /// Attach a new consumer of `queue` for `client_id` and start delivering.
    pub fn consume(&mut self, client_id: &str, queue: &str) -> Result<ConsumerTag, BrokerError> {
        if !self.clients.contains_key(client_id) {
            return Err(BrokerError::UnknownClient(client_id.to_string()));
        }
        let target = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let tag = format!("ctag-{}", Uuid::new_v4());
        target.attach(tag.clone());
        self.consumers.insert(
            tag.clone(),
            Consumer {
                tag: tag.clone(),
                client_id: client_id.to_string(),
                queue: queue.to_string(),
            },
        );
        info!(client = client_id, queue, consumer = %tag, "consumer attached");

        self.dispatch(queue);
        Ok(tag)
    }

    /// Detach a consumer. Its unacked deliveries stay with the client.
    pub fn cancel(&mut self, client_id: &str, consumer_tag: &str) -> Result<(), BrokerError> {
        match self.consumers.get(consumer_tag) {
            Some(consumer) if consumer.client_id == client_id => {}
            _ => return Err(BrokerError::ConsumerNotFound(consumer_tag.to_string())),
        }
        if let Some(consumer) = self.consumers.remove(consumer_tag) {
            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue.detach(consumer_tag);
            }
            info!(client = client_id, consumer = consumer_tag, "consumer cancelled");
        }
        Ok(())
    }

    /// Route `envelope` through `exchange`.
    ///
    /// Returns the number of queues it was enqueued on. Zero means no binding
    /// matched and the message was dropped.
    pub fn publish(&mut self, exchange: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        let targets: BTreeSet<String> = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?
            .route(envelope.routing_key());

        if targets.is_empty() {
            debug!(
                exchange,
                routing_key = %envelope.routing_key(),
                "no binding matched, message dropped"
            );
            return Ok(0);
        }

        let mut prepared = Vec::with_capacity(targets.len());
        for queue_name in &targets {
            let Some(queue) = self.queues.get(queue_name) else {
                warn!(queue = %queue_name, "binding points to a missing queue");
                continue;
            };
            self.last_message_id += 1;
            let message = QueuedMessage {
                id: self.last_message_id,
                exchange: exchange.to_string(),
                envelope: envelope.clone(),
                redelivered: false,
                persisted: envelope.durable() && queue.durable && self.persistence.is_some(),
            };
            prepared.push((queue_name.clone(), message));
        }

        // every durable copy is stored in one batch before anything is enqueued
        if let Some(persistence) = &self.persistence {
            let stored = StoredMessage::new(exchange, envelope.clone());
            let records: Vec<(&str, u64, &StoredMessage)> = prepared
                .iter()
                .filter(|(_, message)| message.persisted)
                .map(|(queue_name, message)| (queue_name.as_str(), message.id, &stored))
                .collect();
            if !records.is_empty() {
                persistence.store_messages(&records)?;
            }
        }

        let routed = prepared.len();
        for (queue_name, message) in prepared {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.enqueue(message);
            }
            self.dispatch(&queue_name);
        }
        debug!(exchange, routing_key = %envelope.routing_key(), queues = routed, "message routed");
        Ok(routed)
    }

    /// Positive settlement: the message is removed for good.
    pub fn ack(&mut self, client_id: &str, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        let unacked = self.take_unacked(client_id, delivery_tag)?;
        self.forget(&unacked.queue, &unacked.message);
        debug!(client = client_id, delivery_tag, "ack");
        self.dispatch(&unacked.queue);
        Ok(())
    }

    /// Negative settlement: requeue at the head or discard.
    pub fn nack(
        &mut self,
        client_id: &str,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let unacked = self.take_unacked(client_id, delivery_tag)?;
        if requeue {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
            }
        } else {
            self.forget(&unacked.queue, &unacked.message);
            info!(
                client = client_id,
                delivery_tag,
                queue = %unacked.queue,
                "message rejected and discarded"
            );
        }
        self.dispatch(&unacked.queue);
        Ok(())
    }

    fn take_unacked(
        &mut self,
        client_id: &str,
        delivery_tag: DeliveryTag,
    ) -> Result<Unacked, BrokerError> {
        let client = self.client_mut(client_id)?;
        if let Some(unacked) = client.unacked.remove(&delivery_tag) {
            return Ok(unacked);
        }
        let violation = if client.issued(delivery_tag) {
            ProtocolViolation::AlreadySettled(delivery_tag)
        } else {
            ProtocolViolation::UnknownDeliveryTag(delivery_tag)
        };
        error!(client = client_id, "protocol violation: {violation}");
        Err(violation.into())
    }

    /// Remove a client, its consumers, and return its unacked deliveries to
    /// their queues in the order they were delivered.
    pub fn cleanup_client(&mut self, client_id: &str) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };

        let tags: Vec<ConsumerTag> = self
            .consumers
            .values()
            .filter(|c| c.client_id == client_id)
            .map(|c| c.tag.clone())
            .collect();
        for tag in &tags {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.detach(tag);
                }
            }
        }

        let mut touched = BTreeSet::new();
        let requeued = client.unacked.len();
        for (_, unacked) in client.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
                touched.insert(unacked.queue);
            }
        }
        for queue in &touched {
            self.dispatch(queue);
        }

        info!(client = client_id, consumers = tags.len(), requeued, "cleaned up client");
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(Queue::depth)
    }

    /// Hand ready messages of `queue_name` to consumers with free capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let consumers = &self.consumers;
            let clients = &self.clients;
            let Some(tag) = queue.next_consumer(|tag| {
                consumers
                    .get(tag)
                    .and_then(|c| clients.get(&c.client_id))
                    .is_some_and(Client::has_capacity)
            }) else {
                break;
            };

            let Some(client) = self
                .consumers
                .get(&tag)
                .and_then(|c| self.clients.get_mut(&c.client_id))
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let delivery_tag = client.next_delivery_tag();
            let frame = ServerMessage::Deliver(Delivery {
                consumer_tag: tag.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                envelope: message.envelope.clone(),
            });
            if let Err(e) = send(client, &frame) {
                // the connection is going away; cleanup will requeue the rest
                warn!(client = %client.id, "failed to deliver: {e}");
                queue.ready.push_front(message);
                break;
            }
            client.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: tag,
                    message,
                },
            );
        }
    }
}

/// Serialize `frame` and push it to the client's outgoing channel.
pub fn send(client: &Client, frame: &ServerMessage) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    client
        .sender
        .send(WsMessage::text(text))
        .map_err(|e| e.to_string())
}
