//! Exchange management
//!
//! An `Exchange` holds the bindings attached to it. Only the topic kind is
//! supported. Duplicate bindings are a no-op, so redeclaring the same
//! (queue, pattern) pair after a restart leaves the exchange unchanged.
//!
//! Concurrency note: callers must synchronize access to `Exchange` (for
//! example via the broker lock) when modifying bindings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::broker::routing::{Binding, BindingPattern, RoutingKey, match_bindings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Topic,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    /// Create a new topic exchange with no bindings.
    pub fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: ExchangeKind::Topic,
            durable,
            bindings: Vec::new(),
        }
    }

    /// Bind `queue` with `pattern`. Returns false when the binding already exists.
    pub fn bind(&mut self, queue: &str, pattern: BindingPattern) -> bool {
        let binding = Binding::new(queue, pattern);
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    /// Remove every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|binding| binding.queue != queue);
    }

    /// Queues whose bindings match `key`.
    pub fn route(&self, key: &RoutingKey) -> BTreeSet<String> {
        match_bindings(key, &self.bindings)
    }
}
