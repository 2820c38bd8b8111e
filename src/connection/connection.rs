//! Client-side broker connection.
//!
//! A `Connection` is a single WebSocket session driven sequentially by its
//! owner: every request is written and its reply awaited before the next
//! one goes out. Deliveries pushed by the broker while a reply is pending
//! are buffered in arrival order and handed out by `next_delivery`.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::exchange::ExchangeKind;
use crate::broker::message::{Delivery, DeliveryTag, Envelope};
use crate::broker::queue::ConsumerTag;
use crate::connection::uri::ConnectionUri;
use crate::transport::message::{ClientMessage, RequestId, ServerMessage};
use crate::utils::error::{ConnectionError, ErrorCode};

/// How long `close` waits for the broker to answer the close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Consuming,
    Closing,
}

pub struct Connection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    uri: ConnectionUri,
    state: ConnectionState,
    next_request_id: RequestId,
    deliveries: VecDeque<Delivery>,
}

impl Connection {
    /// Dial the broker and open a session on the URI's vhost.
    pub async fn connect(uri: &ConnectionUri) -> Result<Self, ConnectionError> {
        let endpoint = uri.endpoint();
        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|source| ConnectionError::Unreachable {
                endpoint: endpoint.clone(),
                source,
            })?;

        let mut connection = Self {
            stream,
            uri: uri.clone(),
            state: ConnectionState::Connected,
            next_request_id: 1,
            deliveries: VecDeque::new(),
        };

        let username = uri.username.clone();
        let vhost = uri.vhost.clone();
        if let Err(e) = connection
            .request(|request_id| ClientMessage::Hello {
                request_id,
                username,
                vhost,
            })
            .await
        {
            connection.state = ConnectionState::Disconnected;
            return Err(e);
        }

        info!("Connected to broker at {uri}");
        Ok(connection)
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Consuming
        )
    }

    pub async fn declare_exchange(
        &mut self,
        name: &str,
        durable: bool,
    ) -> Result<(), ConnectionError> {
        let exchange = name.to_string();
        self.request(|request_id| ClientMessage::ExchangeDeclare {
            request_id,
            exchange,
            kind: ExchangeKind::Topic,
            durable,
        })
        .await
        .map(|_| ())
    }

    pub async fn declare_queue(
        &mut self,
        name: &str,
        durable: bool,
    ) -> Result<(), ConnectionError> {
        let queue = name.to_string();
        self.request(|request_id| ClientMessage::QueueDeclare {
            request_id,
            queue,
            durable,
        })
        .await
        .map(|_| ())
    }

    pub async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), ConnectionError> {
        let (queue, exchange, pattern) = (
            queue.to_string(),
            exchange.to_string(),
            pattern.to_string(),
        );
        self.request(|request_id| ClientMessage::QueueBind {
            request_id,
            queue,
            exchange,
            pattern,
        })
        .await
        .map(|_| ())
    }

    pub async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), ConnectionError> {
        self.request(|request_id| ClientMessage::Qos {
            request_id,
            prefetch_count,
        })
        .await
        .map(|_| ())
    }

    /// Start consuming `queue`; deliveries become available via `next_delivery`.
    pub async fn consume(&mut self, queue: &str) -> Result<ConsumerTag, ConnectionError> {
        let queue = queue.to_string();
        let consumer_tag = self
            .request(|request_id| ClientMessage::Consume { request_id, queue })
            .await?
            .ok_or_else(|| ConnectionError::Rejected {
                code: ErrorCode::InternalError,
                message: "consume reply carried no consumer tag".into(),
            })?;
        self.state = ConnectionState::Consuming;
        Ok(consumer_tag)
    }

    pub async fn cancel(&mut self, consumer_tag: &str) -> Result<(), ConnectionError> {
        let consumer_tag = consumer_tag.to_string();
        self.request(|request_id| ClientMessage::Cancel {
            request_id,
            consumer_tag,
        })
        .await?;
        if self.state == ConnectionState::Consuming {
            self.state = ConnectionState::Connected;
        }
        Ok(())
    }

    /// Publish and wait for the broker to confirm it routed the envelope.
    pub async fn publish(
        &mut self,
        exchange: &str,
        envelope: &Envelope,
    ) -> Result<(), ConnectionError> {
        let exchange = exchange.to_string();
        let envelope = envelope.clone();
        self.request(|request_id| ClientMessage::Publish {
            request_id,
            exchange,
            envelope,
        })
        .await
        .map(|_| ())
    }

    /// The oldest buffered delivery, or the next one the broker pushes.
    pub async fn next_delivery(&mut self) -> Result<Delivery, ConnectionError> {
        if let Some(delivery) = self.deliveries.pop_front() {
            return Ok(delivery);
        }
        self.ensure_open()?;

        loop {
            match self.read_frame().await? {
                ServerMessage::Deliver(delivery) => return Ok(delivery),
                ServerMessage::Error {
                    request_id: None,
                    code,
                    message,
                } => error!("Broker reported {code}: {message}"),
                other => debug!("Ignoring unexpected frame while consuming: {other:?}"),
            }
        }
    }

    pub async fn ack(&mut self, delivery_tag: DeliveryTag) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.send(&ClientMessage::Ack { delivery_tag }).await
    }

    pub async fn nack(
        &mut self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.send(&ClientMessage::Nack {
            delivery_tag,
            requeue,
        })
        .await
    }

    /// Close the session. Settlements already written reach the broker
    /// ahead of the close frame. Buffered deliveries are dropped and the
    /// broker requeues them.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.state = ConnectionState::Closing;
        if !self.deliveries.is_empty() {
            debug!(
                "Dropping {} buffered deliveries on close",
                self.deliveries.len()
            );
            self.deliveries.clear();
        }

        let result = match self.stream.close(None).await {
            Ok(()) => {
                let drained = timeout(CLOSE_TIMEOUT, async {
                    while let Some(frame) = self.stream.next().await {
                        if matches!(frame, Ok(WsMessage::Close(_)) | Err(_)) {
                            break;
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!("Broker did not answer the close frame within {CLOSE_TIMEOUT:?}");
                }
                Ok(())
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ConnectionError::Transport(e)),
        };

        self.state = ConnectionState::Disconnected;
        info!("Connection to {} closed", self.uri);
        result
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    async fn request(
        &mut self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<Option<ConsumerTag>, ConnectionError> {
        self.ensure_open()?;
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.send(&build(id)).await?;

        loop {
            match self.read_frame().await? {
                ServerMessage::Ok {
                    request_id,
                    consumer_tag,
                } if request_id == id => return Ok(consumer_tag),
                ServerMessage::Error {
                    request_id: Some(request_id),
                    code,
                    message,
                } if request_id == id => return Err(ConnectionError::Rejected { code, message }),
                ServerMessage::Error {
                    request_id: None,
                    code,
                    message,
                } => error!("Broker reported {code}: {message}"),
                ServerMessage::Deliver(delivery) => self.deliveries.push_back(delivery),
                other => warn!("Ignoring reply for another request: {other:?}"),
            }
        }
    }

    async fn send(&mut self, frame: &ClientMessage) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(frame)?;
        if let Err(e) = self.stream.send(WsMessage::text(json)).await {
            self.state = ConnectionState::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<ServerMessage, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(serde_json::from_str(text.as_str())?);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.state = ConnectionState::Disconnected;
                    return Err(ConnectionError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
            }
        }
    }
}
