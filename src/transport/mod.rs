//! The `transport` module is responsible for network communication between
//! the broker and its clients over WebSockets.
//!
//! It defines the JSON frame protocol and implements the WebSocket server,
//! which manages connections and forwards client requests to the broker.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
