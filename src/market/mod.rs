//! The stock-market domain carried over the broker: quote and trade events,
//! the `bolsa` exchange with its two queues, the handler that interprets
//! deliveries and a simulator that produces random events.

pub mod events;
pub mod handler;
pub mod simulator;
pub mod topology;

pub use events::{EventKind, MarketEvent, Quote, Trade, TradeSide};
pub use handler::{Alert, Interpretation, MarketHandler, interpret};
pub use simulator::{MarketSimulator, Tick, simulate};
pub use topology::{EXCHANGE, QueueKind};
