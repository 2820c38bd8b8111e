//! WebSocket transport
//!
//! This file implements the broker's WebSocket server, which translates JSON
//! frames into broker operations. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Create a `Client` for each connection and register it with the `Broker`
//! - Enforce the `hello` -> everything-else order: a session must be opened
//!   on the configured virtual host before it may declare, publish or consume
//! - Answer each request with `ok`/`error` on the same outgoing channel the
//!   broker uses for deliveries, so replies and deliveries keep their order
//! - Return unsettled deliveries to their queues when the connection ends

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::engine::{self, Broker, SharedBroker};
use crate::client::Client;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{BrokerError, ErrorCode, TransportError};

/// What the connection loop should do after a frame was handled.
#[derive(Debug, PartialEq)]
pub struct Handled {
    pub reply: Option<ServerMessage>,
    pub close: bool,
}

impl Handled {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply: Some(reply),
            close: false,
        }
    }
}

fn error_frame(request_id: Option<u64>, err: &BrokerError) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code: err.code(),
        message: err.to_string(),
    }
}

/// Apply one client frame to the broker.
pub fn handle_client_message(
    broker: &mut Broker,
    client_id: &str,
    message: ClientMessage,
) -> Handled {
    let request_id = message.request_id();
    let opened = broker.clients.get(client_id).is_some_and(Client::is_open);

    let result = match message {
        ClientMessage::Hello {
            username, vhost, ..
        } => match broker.open(client_id, &username, &vhost) {
            Ok(()) => Ok(None),
            Err(e) => {
                warn!(client = client_id, "hello refused: {e}");
                return Handled {
                    reply: Some(error_frame(request_id, &e)),
                    close: true,
                };
            }
        },
        _ if !opened => {
            warn!(client = client_id, "frame received before hello");
            return Handled {
                reply: Some(error_frame(request_id, &BrokerError::NotOpened)),
                close: true,
            };
        }
        ClientMessage::ExchangeDeclare {
            exchange, durable, ..
        } => broker.declare_exchange(&exchange, durable).map(|_| None),
        ClientMessage::QueueDeclare { queue, durable, .. } => {
            broker.declare_queue(&queue, durable).map(|_| None)
        }
        ClientMessage::QueueBind {
            queue,
            exchange,
            pattern,
            ..
        } => broker.bind_queue(&queue, &exchange, &pattern).map(|_| None),
        ClientMessage::Qos { prefetch_count, .. } => {
            broker.set_prefetch(client_id, prefetch_count).map(|_| None)
        }
        ClientMessage::Consume { queue, .. } => broker.consume(client_id, &queue).map(Some),
        ClientMessage::Cancel { consumer_tag, .. } => {
            broker.cancel(client_id, &consumer_tag).map(|_| None)
        }
        ClientMessage::Publish {
            exchange, envelope, ..
        } => broker.publish(&exchange, envelope).map(|_| None),
        ClientMessage::Ack { delivery_tag } => broker.ack(client_id, delivery_tag).map(|_| None),
        ClientMessage::Nack {
            delivery_tag,
            requeue,
        } => broker.nack(client_id, delivery_tag, requeue).map(|_| None),
    };

    match (result, request_id) {
        (Ok(consumer_tag), Some(request_id)) => Handled::reply(ServerMessage::Ok {
            request_id,
            consumer_tag,
        }),
        (Ok(_), None) => Handled {
            reply: None,
            close: false,
        },
        (Err(e), request_id) => Handled::reply(error_frame(request_id, &e)),
    }
}

pub async fn start_websocket_server(
    addr: &str,
    broker: SharedBroker,
) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    serve(listener, broker).await
}

/// Accept connections on an already bound listener until accepting fails.
pub async fn serve(listener: TcpListener, broker: SharedBroker) -> Result<(), TransportError> {
    info!("WebSocket broker listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        spawn(handle_connection(stream, peer, broker.clone()));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: SharedBroker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx.clone());
    let client_id = client.id.clone();
    engine::lock(&broker).register_client(client);
    debug!(client = %client_id, %peer, "connection accepted");

    let writer = {
        let client_id = client_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(client = %client_id, "failed to send frame: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!(client = %client_id, "send loop closed");
        })
    };

    // keep reading after a close frame so the automatic close reply is flushed
    let mut closed_by_broker = false;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    client = %client_id,
                    "invalid client message: {err} | {}",
                    text.chars().take(100).collect::<String>()
                );
                let frame = ServerMessage::Error {
                    request_id: None,
                    code: ErrorCode::MalformedFrame,
                    message: err.to_string(),
                };
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = tx.send(WsMessage::text(json));
                }
                continue;
            }
        };

        let handled = {
            let mut broker = engine::lock(&broker);
            let handled = handle_client_message(&mut broker, &client_id, message);
            if let (Some(reply), Some(client)) = (&handled.reply, broker.clients.get(&client_id)) {
                if let Err(e) = engine::send(client, reply) {
                    warn!(client = %client_id, "failed to queue reply: {e}");
                }
            }
            handled
        };
        if handled.close {
            closed_by_broker = true;
            break;
        }
    }

    engine::lock(&broker).cleanup_client(&client_id);
    if closed_by_broker {
        let _ = tx.send(WsMessage::Close(None));
    }
    drop(tx);
    if let Err(e) = writer.await {
        error!(client = %client_id, "send loop panicked: {e}");
    }
    info!(client = %client_id, %peer, "disconnected");
}
