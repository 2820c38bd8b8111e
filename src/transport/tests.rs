use crate::broker::Broker;
use crate::broker::message::{Envelope, Payload};
use crate::broker::routing::RoutingKey;
use crate::client::Client;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::handle_client_message;
use crate::utils::error::ErrorCode;

use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

fn register(broker: &mut Broker) -> (String, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    let client_id = client.id.clone();
    broker.register_client(client);
    (client_id, rx)
}

fn hello(request_id: u64, vhost: &str) -> ClientMessage {
    ClientMessage::Hello {
        request_id,
        username: "guest".into(),
        vhost: vhost.into(),
    }
}

fn expect_ok(reply: Option<ServerMessage>, expected: u64) -> Option<String> {
    match reply {
        Some(ServerMessage::Ok {
            request_id,
            consumer_tag,
        }) => {
            assert_eq!(request_id, expected);
            consumer_tag
        }
        other => panic!("Expected ok for request {expected}, got {other:?}"),
    }
}

fn expect_error(reply: Option<ServerMessage>) -> ErrorCode {
    match reply {
        Some(ServerMessage::Error { code, .. }) => code,
        other => panic!("Expected an error frame, got {other:?}"),
    }
}

#[test]
fn test_frames_use_snake_case_tags() {
    let frame = ClientMessage::QueueBind {
        request_id: 3,
        queue: "cotacoes".into(),
        exchange: "bolsa".into(),
        pattern: "bolsa.cotacoes.#".into(),
    };
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "queue_bind");
    assert_eq!(value["pattern"], "bolsa.cotacoes.#");

    let parsed: ClientMessage =
        serde_json::from_value(json!({"type": "ack", "delivery_tag": 9})).unwrap();
    assert_eq!(parsed, ClientMessage::Ack { delivery_tag: 9 });
    assert_eq!(parsed.request_id(), None);
}

#[test]
fn test_publish_frame_rejects_invalid_routing_key() {
    let raw = json!({
        "type": "publish",
        "request_id": 1,
        "exchange": "bolsa",
        "envelope": {"routing_key": "bolsa..petr4", "payload": {}, "durable": true}
    });
    assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
}

#[test]
fn test_hello_opens_session() {
    let mut broker = Broker::new();
    let (client_id, _rx) = register(&mut broker);

    let handled = handle_client_message(&mut broker, &client_id, hello(1, "/"));
    assert!(!handled.close);
    assert_eq!(expect_ok(handled.reply, 1), None);
    assert!(broker.clients[&client_id].is_open());
}

#[test]
fn test_hello_on_unknown_vhost_closes() {
    let mut broker = Broker::new();
    let (client_id, _rx) = register(&mut broker);

    let handled = handle_client_message(&mut broker, &client_id, hello(1, "producao"));
    assert!(handled.close);
    assert_eq!(expect_error(handled.reply), ErrorCode::AccessRefused);
}

#[test]
fn test_frames_before_hello_are_refused() {
    let mut broker = Broker::new();
    let (client_id, _rx) = register(&mut broker);

    let handled = handle_client_message(
        &mut broker,
        &client_id,
        ClientMessage::QueueDeclare {
            request_id: 1,
            queue: "cotacoes".into(),
            durable: true,
        },
    );
    assert!(handled.close);
    assert_eq!(expect_error(handled.reply), ErrorCode::NotOpen);
    assert!(broker.queues.is_empty());
}

#[test]
fn test_declare_bind_consume_publish_flow() {
    let mut broker = Broker::new();
    let (client_id, mut rx) = register(&mut broker);
    handle_client_message(&mut broker, &client_id, hello(1, "/"));

    let requests = [
        ClientMessage::ExchangeDeclare {
            request_id: 2,
            exchange: "bolsa".into(),
            kind: Default::default(),
            durable: true,
        },
        ClientMessage::QueueDeclare {
            request_id: 3,
            queue: "negociacoes".into(),
            durable: true,
        },
        ClientMessage::QueueBind {
            request_id: 4,
            queue: "negociacoes".into(),
            exchange: "bolsa".into(),
            pattern: "bolsa.negociacoes.#".into(),
        },
        ClientMessage::Qos {
            request_id: 5,
            prefetch_count: 1,
        },
    ];
    for request in requests {
        let id = request.request_id().unwrap();
        expect_ok(handle_client_message(&mut broker, &client_id, request).reply, id);
    }

    let consumer_tag = expect_ok(
        handle_client_message(
            &mut broker,
            &client_id,
            ClientMessage::Consume {
                request_id: 6,
                queue: "negociacoes".into(),
            },
        )
        .reply,
        6,
    )
    .expect("consume returns a consumer tag");

    let mut payload = Payload::new();
    payload.insert("acao".into(), json!("VALE3"));
    let envelope = Envelope::new(
        RoutingKey::parse("bolsa.negociacoes.venda.vale3").unwrap(),
        payload,
        true,
    );
    let handled = handle_client_message(
        &mut broker,
        &client_id,
        ClientMessage::Publish {
            request_id: 7,
            exchange: "bolsa".into(),
            envelope: envelope.clone(),
        },
    );
    expect_ok(handled.reply, 7);

    let Ok(WsMessage::Text(text)) = rx.try_recv() else {
        panic!("Expected a deliver frame");
    };
    let ServerMessage::Deliver(delivery) = serde_json::from_str(text.as_str()).unwrap() else {
        panic!("Expected a deliver frame");
    };
    assert_eq!(delivery.consumer_tag, consumer_tag);
    assert_eq!(delivery.envelope, envelope);

    let handled = handle_client_message(
        &mut broker,
        &client_id,
        ClientMessage::Ack {
            delivery_tag: delivery.delivery_tag,
        },
    );
    assert_eq!(handled.reply, None);

    // acking again is reported without a request id
    let handled = handle_client_message(
        &mut broker,
        &client_id,
        ClientMessage::Ack {
            delivery_tag: delivery.delivery_tag,
        },
    );
    match handled.reply {
        Some(ServerMessage::Error {
            request_id: None,
            code: ErrorCode::ProtocolViolation,
            ..
        }) => {}
        other => panic!("Expected a protocol violation, got {other:?}"),
    }
}

#[test]
fn test_publish_to_undeclared_exchange_is_rejected() {
    let mut broker = Broker::new();
    let (client_id, _rx) = register(&mut broker);
    handle_client_message(&mut broker, &client_id, hello(1, "/"));

    let handled = handle_client_message(
        &mut broker,
        &client_id,
        ClientMessage::Publish {
            request_id: 2,
            exchange: "bolsa".into(),
            envelope: Envelope::new(
                RoutingKey::parse("bolsa.cotacoes.acoes.petr4").unwrap(),
                Payload::new(),
                true,
            ),
        },
    );
    assert!(!handled.close);
    assert_eq!(expect_error(handled.reply), ErrorCode::NotFound);
}
