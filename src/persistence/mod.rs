//! The `persistence` module keeps durable broker state across restarts.
//!
//! It uses `sled` as an embedded key-value store for the declared topology
//! and for durable messages that have not been settled yet.

pub mod sled_store;

pub use sled_store::{Persistence, StoredMessage, TopologyRecord};
