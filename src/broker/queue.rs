//! Queues hold messages waiting for a consumer with free prefetch capacity.
//!
//! Messages are kept in FIFO order. A requeued message goes back to the
//! front so it is the next one handed out. Consumers attached to a queue are
//! served round-robin.

use std::collections::VecDeque;

use crate::broker::message::Envelope;

pub type ConsumerTag = String;

/// A message sitting in a queue, or held unacked by a consumer.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Broker-wide id, also the storage key for persisted copies.
    pub id: u64,
    pub exchange: String,
    pub envelope: Envelope,
    pub redelivered: bool,
    pub persisted: bool,
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub ready: VecDeque<QueuedMessage>,
    pub consumers: VecDeque<ConsumerTag>,
}

impl Queue {
    pub fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            ready: VecDeque::new(),
            consumers: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        self.ready.push_back(message);
    }

    /// Put a message back at the head of the queue, flagged as redelivered.
    pub fn requeue(&mut self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }

    pub fn depth(&self) -> usize {
        self.ready.len()
    }

    pub fn attach(&mut self, consumer_tag: ConsumerTag) {
        if !self.consumers.contains(&consumer_tag) {
            self.consumers.push_back(consumer_tag);
        }
    }

    pub fn detach(&mut self, consumer_tag: &str) {
        self.consumers.retain(|tag| tag != consumer_tag);
    }

    /// Next consumer accepted by `eligible`, rotating the round-robin order.
    pub fn next_consumer(&mut self, eligible: impl Fn(&str) -> bool) -> Option<ConsumerTag> {
        for _ in 0..self.consumers.len() {
            let tag = self.consumers.pop_front()?;
            self.consumers.push_back(tag.clone());
            if eligible(&tag) {
                return Some(tag);
            }
        }
        None
    }
}
