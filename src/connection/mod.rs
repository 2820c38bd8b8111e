//! The `connection` module is the client side of the broker protocol.
//!
//! A `Connection` owns one WebSocket session. It is handed either to a
//! `Publisher`, which sends confirmed publishes to an exchange, or to a
//! `DeliverySession`, which consumes a queue one delivery at a time.

pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod uri;

pub use connection::{Connection, ConnectionState};
pub use consumer::{DeliveryHandler, DeliverySession, RunSummary, SessionState, Settlement};
pub use publisher::Publisher;
pub use uri::ConnectionUri;

#[cfg(test)]
mod tests;
