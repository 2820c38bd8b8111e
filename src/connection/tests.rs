use crate::broker::message::Payload;
use crate::connection::consumer::{DeliverySession, SessionState, Settlement};
use crate::connection::{Connection, ConnectionState, ConnectionUri, Publisher};
use crate::tests::{closed_port, start_broker};
use crate::utils::error::{
    ConnectionError, ConsumeError, ErrorCode, ProtocolViolation, PublishError,
};

use serde_json::json;

fn quote_payload(acao: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("acao".into(), json!(acao));
    payload.insert("valor".into(), json!(31.5));
    payload
}

async fn declare_quotes(connection: &mut Connection) {
    connection.declare_exchange("bolsa", true).await.unwrap();
    connection.declare_queue("cotacoes", true).await.unwrap();
    connection
        .bind_queue("cotacoes", "bolsa", "bolsa.cotacoes.#")
        .await
        .unwrap();
}

#[test]
fn test_uri_defaults() {
    let uri = ConnectionUri::parse("ws://localhost").unwrap();
    assert_eq!(uri.host, "localhost");
    assert_eq!(uri.port, 8080);
    assert_eq!(uri.username, "guest");
    assert_eq!(uri.password, None);
    assert_eq!(uri.vhost, "/");
}

#[test]
fn test_uri_all_parts() {
    let uri: ConnectionUri = "ws://ana:s3nh%40@broker.local:9000/producao".parse().unwrap();
    assert_eq!(uri.host, "broker.local");
    assert_eq!(uri.port, 9000);
    assert_eq!(uri.username, "ana");
    assert_eq!(uri.password.as_deref(), Some("s3nh@"));
    assert_eq!(uri.vhost, "producao");
    assert_eq!(uri.endpoint(), "ws://broker.local:9000/");
}

#[test]
fn test_uri_encoded_default_vhost() {
    let uri = ConnectionUri::parse("ws://guest:guest@localhost:8080/%2F").unwrap();
    assert_eq!(uri.vhost, "/");
}

#[test]
fn test_uri_display_masks_password() {
    let uri = ConnectionUri::parse("ws://ana:segredo@localhost:8080/producao").unwrap();
    let shown = uri.to_string();
    assert_eq!(shown, "ws://ana:***@localhost:8080/producao");
    assert!(!shown.contains("segredo"));
}

#[test]
fn test_uri_rejects_other_schemes() {
    for raw in ["wss://localhost:8080/", "amqp://guest@localhost/", "not a url"] {
        assert!(
            matches!(ConnectionUri::parse(raw), Err(ConnectionError::InvalidUri { .. })),
            "{raw} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_connect_to_unreachable_broker() {
    let port = closed_port().await;
    let uri = ConnectionUri::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
    match Connection::connect(&uri).await {
        Err(ConnectionError::Unreachable { endpoint, .. }) => {
            assert_eq!(endpoint, format!("ws://127.0.0.1:{port}/"));
        }
        Err(other) => panic!("Expected unreachable, got {other}"),
        Ok(_) => panic!("Expected unreachable, got a connection"),
    }
}

#[tokio::test]
async fn test_connect_to_unknown_vhost_is_rejected() {
    let server = start_broker().await;
    let uri =
        ConnectionUri::parse(&format!("ws://guest@127.0.0.1:{}/producao", server.port)).unwrap();
    match Connection::connect(&uri).await {
        Err(ConnectionError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::AccessRefused),
        Err(other) => panic!("Expected rejection, got {other}"),
        Ok(_) => panic!("Expected rejection, got a connection"),
    }
}

#[tokio::test]
async fn test_connection_state_transitions() {
    let server = start_broker().await;
    let mut connection = server.connect().await;
    assert_eq!(connection.state(), ConnectionState::Connected);

    declare_quotes(&mut connection).await;
    let consumer_tag = connection.consume("cotacoes").await.unwrap();
    assert!(consumer_tag.starts_with("ctag-"));
    assert_eq!(connection.state(), ConnectionState::Consuming);

    connection.cancel(&consumer_tag).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);

    connection.close().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_open());
    assert!(matches!(
        connection.declare_queue("cotacoes", true).await,
        Err(ConnectionError::Closed)
    ));
}

#[tokio::test]
async fn test_deliveries_are_buffered_while_awaiting_replies() {
    let server = start_broker().await;
    let mut connection = server.connect().await;
    declare_quotes(&mut connection).await;
    connection.consume("cotacoes").await.unwrap();

    let mut publisher = Publisher::new(server.connect().await, "bolsa");
    publisher
        .publish("bolsa.cotacoes.acoes.petr4", quote_payload("PETR4"), true)
        .await
        .unwrap();

    // the delivery arrives before the reply to this declaration
    connection.declare_queue("cotacoes", true).await.unwrap();

    let delivery = connection.next_delivery().await.unwrap();
    assert_eq!(delivery.routing_key().as_str(), "bolsa.cotacoes.acoes.petr4");
    assert_eq!(delivery.exchange, "bolsa");
    assert!(!delivery.redelivered);
    connection.ack(delivery.delivery_tag).await.unwrap();
}

#[tokio::test]
async fn test_publisher_rejects_invalid_keys_before_sending() {
    let server = start_broker().await;
    let mut publisher = Publisher::new(server.connect().await, "bolsa");
    for key in ["", "bolsa..petr4", "bolsa.cota coes"] {
        assert!(
            matches!(
                publisher.publish(key, Payload::new(), true).await,
                Err(PublishError::InvalidRoutingKey(_))
            ),
            "{key:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_publish_to_missing_exchange_is_rejected() {
    let server = start_broker().await;
    let mut publisher = Publisher::new(server.connect().await, "inexistente");
    match publisher
        .publish("bolsa.cotacoes.acoes.petr4", Payload::new(), true)
        .await
    {
        Err(PublishError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::NotFound),
        other => panic!("Expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_event_requires_an_object() {
    let server = start_broker().await;
    let mut publisher = Publisher::new(server.connect().await, "bolsa");
    assert!(matches!(
        publisher
            .publish_event("bolsa.cotacoes.acoes.petr4", &[1, 2, 3], true)
            .await,
        Err(PublishError::InvalidPayload(_))
    ));
}

#[tokio::test]
async fn test_publish_after_close_is_unavailable() {
    let server = start_broker().await;
    let mut publisher = Publisher::new(server.connect().await, "bolsa");
    publisher.close().await.unwrap();
    assert!(matches!(
        publisher
            .publish("bolsa.cotacoes.acoes.petr4", Payload::new(), true)
            .await,
        Err(PublishError::BrokerUnavailable)
    ));
}

#[tokio::test]
async fn test_session_requires_settlement_before_next_delivery() {
    let server = start_broker().await;
    let mut setup = server.connect().await;
    declare_quotes(&mut setup).await;

    let mut session = DeliverySession::attach(server.connect().await, "cotacoes")
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let mut publisher = Publisher::new(setup, "bolsa");
    for acao in ["petr4", "vale3"] {
        publisher
            .publish(
                &format!("bolsa.cotacoes.acoes.{acao}"),
                quote_payload(acao),
                true,
            )
            .await
            .unwrap();
    }

    let (delivery, settlement) = session.next_delivery().await.unwrap();
    assert_eq!(session.state(), SessionState::Delivering);
    assert_eq!(session.pending(), Some(delivery.delivery_tag));

    match session.next_delivery().await {
        Err(ConsumeError::Protocol(ProtocolViolation::Unsettled(tag))) => {
            assert_eq!(tag, delivery.delivery_tag)
        }
        other => panic!("Expected unsettled violation, got {other:?}"),
    }

    match session.ack(Settlement::for_tag(delivery.delivery_tag + 100)).await {
        Err(ConsumeError::Protocol(ProtocolViolation::UnknownDeliveryTag(_))) => {}
        other => panic!("Expected unknown tag violation, got {other:?}"),
    }

    session.ack(settlement).await.unwrap();
    assert_eq!(session.state(), SessionState::Acked);
    assert_eq!(session.pending(), None);

    let (second, settlement) = session.next_delivery().await.unwrap();
    assert_eq!(second.routing_key().as_str(), "bolsa.cotacoes.acoes.vale3");
    session.nack(settlement).await.unwrap();
    assert_eq!(session.state(), SessionState::Nacked);

    session.close().await.unwrap();
}
