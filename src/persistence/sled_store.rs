//! Persistence layer backed by `sled`
//!
//! Two kinds of data are stored:
//! - topology: durable exchanges, durable queues and the bindings between
//!   them, in the `topology` tree
//! - messages: durable messages routed to durable queues, in the `messages`
//!   tree, keyed by the length-prefixed queue name followed by the big-endian
//!   message id so a prefix scan yields one queue in enqueue order
//!
//! Every copy of one published message is written in a single batch. A
//! message record is removed once the message is settled. Whatever is left
//! when the broker stops is loaded back on the next start.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};

use crate::broker::message::Envelope;
use crate::utils::error::StorageError;

const TOPOLOGY_TREE: &str = "topology";
const MESSAGES_TREE: &str = "messages";

fn queue_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + queue.len() + 8);
    prefix.extend_from_slice(&(queue.len() as u32).to_be_bytes());
    prefix.extend_from_slice(queue.as_bytes());
    prefix
}

fn message_key(queue: &str, id: u64) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub envelope: Envelope,
    pub stored_at: i64,
}

impl StoredMessage {
    pub fn new(exchange: &str, envelope: Envelope) -> Self {
        Self {
            exchange: exchange.to_string(),
            envelope,
            stored_at: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyRecord {
    Exchange {
        name: String,
    },
    Queue {
        name: String,
    },
    Binding {
        exchange: String,
        queue: String,
        pattern: String,
    },
}

impl TopologyRecord {
    fn key(&self) -> String {
        match self {
            TopologyRecord::Exchange { name } => format!("exchange/{name}"),
            TopologyRecord::Queue { name } => format!("queue/{name}"),
            TopologyRecord::Binding {
                exchange,
                queue,
                pattern,
            } => format!("binding/{exchange}/{queue}/{pattern}"),
        }
    }
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A throwaway database, removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    pub fn save_topology(&self, record: &TopologyRecord) -> Result<(), StorageError> {
        let tree = self.db.open_tree(TOPOLOGY_TREE)?;
        tree.insert(record.key().as_bytes(), serde_json::to_vec(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// Every topology record, exchanges and queues before bindings.
    pub fn load_topology(&self) -> Result<Vec<TopologyRecord>, StorageError> {
        let tree = self.db.open_tree(TOPOLOGY_TREE)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice::<TopologyRecord>(&value)?);
        }
        records.sort_by_key(|record| matches!(record, TopologyRecord::Binding { .. }));
        Ok(records)
    }

    pub fn store_message(
        &self,
        queue: &str,
        id: u64,
        message: &StoredMessage,
    ) -> Result<(), StorageError> {
        self.store_messages(&[(queue, id, message)])
    }

    /// Write every `(queue, id, message)` record atomically: either all of
    /// them are stored or none is.
    pub fn store_messages(
        &self,
        records: &[(&str, u64, &StoredMessage)],
    ) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for (queue, id, message) in records {
            batch.insert(message_key(queue, *id), serde_json::to_vec(message)?);
        }
        self.message_tree()?.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, id: u64) -> Result<(), StorageError> {
        self.message_tree()?.remove(message_key(queue, id))?;
        self.db.flush()?;
        Ok(())
    }

    /// Messages stored for `queue`, in enqueue order.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<(u64, StoredMessage)>, StorageError> {
        let prefix = queue_prefix(queue);
        let mut messages = Vec::new();
        for entry in self.message_tree()?.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let Ok(bytes) = <[u8; 8]>::try_from(&key[prefix.len()..]) else {
                tracing::warn!(queue, "skipping message record with malformed key");
                continue;
            };
            messages.push((u64::from_be_bytes(bytes), serde_json::from_slice(&value)?));
        }
        Ok(messages)
    }

    fn message_tree(&self) -> Result<Tree, StorageError> {
        Ok(self.db.open_tree(MESSAGES_TREE)?)
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
