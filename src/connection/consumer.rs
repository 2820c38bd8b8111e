//! Delivery session
//!
//! A `DeliverySession` consumes one queue with a prefetch of one: at most a
//! single delivery is in flight, and it must be settled before the next one
//! is requested. Settlement goes through a `Settlement` token which `ack`
//! and `nack` take by value, so a delivery cannot be settled twice.

use std::future::Future;

use tracing::{error, info, warn};

use crate::broker::message::{Delivery, DeliveryTag};
use crate::broker::queue::ConsumerTag;
use crate::connection::connection::Connection;
use crate::utils::error::{ConnectionError, ConsumeError, ProcessingError, ProtocolViolation};

pub const PREFETCH_LIMIT: u16 = 1;

/// `Acked` and `Nacked` behave like `Idle` and record the last outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Delivering,
    Processing,
    Acked,
    Nacked,
}

/// Proof that a delivery is pending; consumed by `ack` or `nack`.
#[must_use = "every delivery must be settled with ack or nack"]
#[derive(Debug, PartialEq, Eq)]
pub struct Settlement {
    delivery_tag: DeliveryTag,
}

impl Settlement {
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    #[cfg(test)]
    pub(crate) fn for_tag(delivery_tag: DeliveryTag) -> Self {
        Self { delivery_tag }
    }
}

/// Application logic run for each delivery. `Ok` acks the delivery, `Err`
/// nacks it without requeue.
pub trait DeliveryHandler {
    fn handle(&mut self, delivery: &Delivery) -> Result<(), ProcessingError>;
}

impl<F> DeliveryHandler for F
where
    F: FnMut(&Delivery) -> Result<(), ProcessingError>,
{
    fn handle(&mut self, delivery: &Delivery) -> Result<(), ProcessingError> {
        self(delivery)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub acked: usize,
    pub nacked: usize,
}

pub struct DeliverySession {
    connection: Connection,
    queue: String,
    consumer_tag: ConsumerTag,
    state: SessionState,
    pending: Option<DeliveryTag>,
}

impl DeliverySession {
    /// Limit the channel to one unacked delivery and start consuming `queue`.
    pub async fn attach(mut connection: Connection, queue: &str) -> Result<Self, ConnectionError> {
        connection.set_prefetch(PREFETCH_LIMIT).await?;
        let consumer_tag = connection.consume(queue).await?;
        info!(queue, consumer = %consumer_tag, "consumer attached");

        Ok(Self {
            connection,
            queue: queue.to_string(),
            consumer_tag,
            state: SessionState::Idle,
            pending: None,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> Option<DeliveryTag> {
        self.pending
    }

    /// Wait for the next delivery. Fails with `Unsettled` while the previous
    /// one has not been acked or nacked.
    pub async fn next_delivery(&mut self) -> Result<(Delivery, Settlement), ConsumeError> {
        if let Some(tag) = self.pending {
            error!(queue = %self.queue, "next delivery requested while tag {tag} is unsettled");
            return Err(ProtocolViolation::Unsettled(tag).into());
        }

        let delivery = self.connection.next_delivery().await?;
        let delivery_tag = delivery.delivery_tag;
        self.pending = Some(delivery_tag);
        self.state = SessionState::Delivering;
        Ok((delivery, Settlement { delivery_tag }))
    }

    pub async fn ack(&mut self, settlement: Settlement) -> Result<(), ConsumeError> {
        self.settle(settlement, true).await
    }

    /// Reject the delivery. It is discarded, never requeued.
    pub async fn nack(&mut self, settlement: Settlement) -> Result<(), ConsumeError> {
        self.settle(settlement, false).await
    }

    async fn settle(&mut self, settlement: Settlement, ack: bool) -> Result<(), ConsumeError> {
        let tag = settlement.delivery_tag;
        if self.pending != Some(tag) {
            error!(
                queue = %self.queue,
                "settlement for tag {tag} does not match the pending delivery"
            );
            return Err(ProtocolViolation::UnknownDeliveryTag(tag).into());
        }

        if ack {
            self.connection.ack(tag).await?;
            self.state = SessionState::Acked;
        } else {
            self.connection.nack(tag, false).await?;
            self.state = SessionState::Nacked;
        }
        self.pending = None;
        Ok(())
    }

    /// Run `handler` on a delivery and settle it from the outcome.
    pub async fn process<H: DeliveryHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        delivery: Delivery,
        settlement: Settlement,
    ) -> Result<SessionState, ConsumeError> {
        self.state = SessionState::Processing;
        match handler.handle(&delivery) {
            Ok(()) => self.ack(settlement).await?,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key(),
                    "processing failed, discarding message: {e}"
                );
                self.nack(settlement).await?;
            }
        }
        Ok(self.state)
    }

    /// Consume until `shutdown` resolves or the connection fails. Shutdown
    /// is only observed between deliveries.
    pub async fn run<H, S>(
        &mut self,
        handler: &mut H,
        shutdown: S,
    ) -> Result<RunSummary, ConsumeError>
    where
        H: DeliveryHandler + ?Sized,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                next = self.next_delivery() => Some(next),
            };
            let Some(next) = next else {
                info!(queue = %self.queue, "shutdown requested");
                break;
            };
            let (delivery, settlement) = next?;

            match self.process(handler, delivery, settlement).await? {
                SessionState::Acked => summary.acked += 1,
                _ => summary.nacked += 1,
            }
        }

        Ok(summary)
    }

    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.connection.close().await
    }
}
