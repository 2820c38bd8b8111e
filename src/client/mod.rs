//! The `client` module defines how the broker sees a connected peer.
//!
//! It provides the `Client` struct, which encapsulates the state of a single
//! connection: its identifier, the channel for pushing frames to it, its
//! prefetch limit and the deliveries it still has to settle.

pub mod pubsub_client;
pub use pubsub_client::{Client, Unacked};

#[cfg(test)]
mod tests;
