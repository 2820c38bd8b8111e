//! The broker: topic exchanges, durable queues, consumers and settlement.

pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod routing;

pub use engine::{Broker, SharedBroker};
