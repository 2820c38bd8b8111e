//! # Bolsa
//!
//! `bolsa` is a small topic-routed message broker and the client library
//! used to publish stock-market events to it and consume them. The broker
//! speaks a JSON frame protocol over WebSockets.
//!
//! ## Core Modules
//!
//! - `broker`: topic exchanges, durable queues, routing, prefetch and settlement.
//! - `client`: the broker's view of a connected peer.
//! - `connection`: the client side: connection, publisher and delivery session.
//! - `market`: quote and trade events, their topology, handler and simulator.
//! - `config`: server settings and broker URL resolution.
//! - `persistence`: sled storage for durable topology and messages.
//! - `transport`: the frame protocol and the WebSocket server.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod market;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
