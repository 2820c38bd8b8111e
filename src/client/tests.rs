use super::pubsub_client::Client;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    assert!(client.id.starts_with("client-"));
    assert!(!client.is_open());
    assert!(client.unacked.is_empty());
}

#[test]
fn test_delivery_tags_increase_from_one() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    assert!(!client.issued(1));
    assert_eq!(client.next_delivery_tag(), 1);
    assert_eq!(client.next_delivery_tag(), 2);
    assert!(client.issued(2));
    assert!(!client.issued(3));
    assert!(!client.issued(0));
}

#[test]
fn test_unlimited_prefetch_always_has_capacity() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    assert!(client.has_capacity());
    client.prefetch = 1;
    assert!(client.has_capacity());
}
