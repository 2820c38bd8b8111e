use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::broker::engine;
use crate::broker::message::{Delivery, Payload};
use crate::connection::{DeliverySession, Publisher, SessionState};
use crate::market::handler::Alert;
use crate::market::{
    EXCHANGE, MarketHandler, MarketSimulator, Quote, QueueKind, Trade, TradeSide, simulate,
    topology,
};
use crate::tests::{TestBroker, start_broker};
use crate::utils::error::{ConnectionError, ErrorCode, ProcessingError};

async fn consumer(server: &TestBroker, kind: QueueKind) -> DeliverySession {
    let mut connection = server.connect().await;
    topology::declare_queue(&mut connection, kind).await.unwrap();
    DeliverySession::attach(connection, kind.queue_name())
        .await
        .unwrap()
}

async fn publisher(server: &TestBroker) -> Publisher {
    let mut connection = server.connect().await;
    topology::declare_exchange(&mut connection).await.unwrap();
    Publisher::new(connection, EXCHANGE)
}

fn quote(acao: &str, variacao: f64) -> Quote {
    Quote {
        acao: acao.into(),
        valor: 30.0,
        variacao,
        timestamp: 1_700_000_000.5,
    }
}

/// Total deliveries the broker holds unacked across all clients.
fn unacked(server: &TestBroker) -> usize {
    engine::lock(&server.broker)
        .clients
        .values()
        .map(|client| client.unacked.len())
        .sum()
}

fn depth(server: &TestBroker, queue: &str) -> usize {
    engine::lock(&server.broker).queue_depth(queue).unwrap_or(0)
}

#[tokio::test]
async fn test_quote_with_high_variation_raises_alta_alert() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    let event = quote("PETR4", 3.5);
    publisher
        .publish_event("bolsa.cotacoes.acoes.petr4", &event, true)
        .await
        .unwrap();

    let (delivery, settlement) = session.next_delivery().await.unwrap();
    assert_eq!(delivery.routing_key().as_str(), "bolsa.cotacoes.acoes.petr4");
    assert_eq!(delivery.envelope.decode::<Quote>().unwrap(), event);

    let mut handler = MarketHandler::new();
    let state = session
        .process(&mut handler, delivery, settlement)
        .await
        .unwrap();
    assert_eq!(state, SessionState::Acked);

    let interpretation = handler.last().unwrap();
    assert_eq!(interpretation.alert, Some(Alert::Alta));
    assert_eq!(
        interpretation.alert_message().as_deref(),
        Some("ALERTA: PETR4 em alta expressiva!")
    );

    session.close().await.unwrap();
    assert_eq!(depth(&server, "cotacoes"), 0);
}

#[tokio::test]
async fn test_trade_is_formatted_and_acked() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Negociacoes).await;
    let mut publisher = publisher(&server).await;

    let trade = Trade {
        acao: "VALE3".into(),
        quantidade: 500,
        valor_total: 12345.67,
        tipo: TradeSide::Venda,
        timestamp: 1_700_000_000.5,
    };
    publisher
        .publish_event(&trade.routing_key(), &trade, true)
        .await
        .unwrap();

    let (delivery, settlement) = session.next_delivery().await.unwrap();
    assert_eq!(delivery.routing_key().as_str(), "bolsa.negociacoes.venda.vale3");

    let mut handler = MarketHandler::new();
    let state = session
        .process(&mut handler, delivery, settlement)
        .await
        .unwrap();
    assert_eq!(state, SessionState::Acked);
    assert_eq!(
        handler.last().unwrap().summary,
        "Negociação de VALE3: venda de 500 ações por R$ 12345.67"
    );

    session.close().await.unwrap();
    assert_eq!(depth(&server, "negociacoes"), 0);
    assert_eq!(unacked(&server), 0);
}

#[tokio::test]
async fn test_unbound_key_is_never_delivered() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    publisher
        .publish("bolsa.noticias.petr4", Payload::new(), true)
        .await
        .unwrap();

    let waited = timeout(Duration::from_millis(300), session.next_delivery()).await;
    assert!(waited.is_err(), "nothing should be routed to cotacoes");
    assert_eq!(depth(&server, "cotacoes"), 0);
}

#[tokio::test]
async fn test_unsettled_delivery_is_redelivered_after_disconnect() {
    let server = start_broker().await;
    let mut first = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    let event = quote("ITUB4", -1.0);
    publisher
        .publish_event(&event.routing_key(), &event, true)
        .await
        .unwrap();

    let (delivery, settlement) = first.next_delivery().await.unwrap();
    assert!(!delivery.redelivered);
    // the consumer dies mid-processing
    drop(settlement);
    drop(first);

    let mut second = consumer(&server, QueueKind::Cotacoes).await;
    let (again, settlement) = timeout(Duration::from_secs(5), second.next_delivery())
        .await
        .expect("the message comes back")
        .unwrap();
    assert!(again.redelivered);
    assert_eq!(again.envelope, delivery.envelope);

    second.ack(settlement).await.unwrap();
    second.close().await.unwrap();
    assert_eq!(depth(&server, "cotacoes"), 0);
}

#[tokio::test]
async fn test_setup_is_idempotent() {
    let server = start_broker().await;
    let mut connection = server.connect().await;
    for _ in 0..3 {
        topology::declare_queue(&mut connection, QueueKind::Cotacoes)
            .await
            .unwrap();
    }

    {
        let broker = engine::lock(&server.broker);
        assert_eq!(broker.exchanges.len(), 1);
        assert_eq!(broker.exchanges[EXCHANGE].bindings.len(), 1);
        assert_eq!(broker.queues.len(), 1);
    }

    match connection.declare_queue("cotacoes", false).await {
        Err(ConnectionError::Rejected { code, .. }) => {
            assert_eq!(code, ErrorCode::PreconditionFailed)
        }
        other => panic!("Expected a precondition failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_prefetch_allows_one_delivery_in_flight() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    for i in 0..10 {
        let event = quote(&format!("TEST{i}"), 0.0);
        publisher
            .publish_event(&event.routing_key(), &event, true)
            .await
            .unwrap();
    }

    let mut windows: Vec<(Instant, Instant)> = Vec::new();
    let mut handler = |_: &Delivery| -> Result<(), ProcessingError> {
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        windows.push((start, Instant::now()));
        Ok(())
    };

    for i in 0..10 {
        let (delivery, settlement) = session.next_delivery().await.unwrap();
        assert_eq!(unacked(&server), 1);
        assert_eq!(depth(&server, "cotacoes"), 10 - (i + 1));
        session
            .process(&mut handler, delivery, settlement)
            .await
            .unwrap();
    }

    assert_eq!(windows.len(), 10);
    for pair in windows.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "processing windows overlap");
    }
}

#[tokio::test]
async fn test_ack_and_nack_are_final() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    for event in [quote("PETR4", 1.0), quote("VALE3", 2.5)] {
        publisher
            .publish_event(&event.routing_key(), &event, true)
            .await
            .unwrap();
    }
    // missing `variacao`: decoded as a processing failure and discarded
    let mut broken = Payload::new();
    broken.insert("acao".into(), json!("ABEV3"));
    publisher
        .publish("bolsa.cotacoes.acoes.abev3", broken, true)
        .await
        .unwrap();

    let mut handler = MarketHandler::new();
    let summary = session
        .run(&mut handler, tokio::time::sleep(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(summary.acked, 2);
    assert_eq!(summary.nacked, 1);
    assert_eq!(handler.processed(), 2);

    session.close().await.unwrap();
    assert_eq!(depth(&server, "cotacoes"), 0);
    assert_eq!(unacked(&server), 0);

    // nothing comes back to a fresh consumer
    let mut fresh = consumer(&server, QueueKind::Cotacoes).await;
    let waited = timeout(Duration::from_millis(300), fresh.next_delivery()).await;
    assert!(waited.is_err());
}

#[tokio::test]
async fn test_shutdown_during_handling_still_settles_the_delivery() {
    let server = start_broker().await;
    let mut session = consumer(&server, QueueKind::Cotacoes).await;
    let mut publisher = publisher(&server).await;

    for event in [quote("PETR4", 1.0), quote("VALE3", 2.5)] {
        publisher
            .publish_event(&event.routing_key(), &event, true)
            .await
            .unwrap();
    }

    let (stop, stopped) = oneshot::channel::<()>();
    let mut stop = Some(stop);
    let mut seen = Vec::new();
    let mut handler = |delivery: &Delivery| -> Result<(), ProcessingError> {
        seen.push(delivery.routing_key().as_str().to_string());
        if let Some(stop) = stop.take() {
            let _ = stop.send(());
        }
        Ok(())
    };
    let summary = session
        .run(&mut handler, async {
            let _ = stopped.await;
        })
        .await
        .unwrap();

    assert_eq!(summary.acked, 1);
    assert_eq!(summary.nacked, 0);
    assert_eq!(seen, vec!["bolsa.cotacoes.acoes.petr4"]);

    session.close().await.unwrap();
    assert_eq!(unacked(&server), 0);
    // the message never handed to the handler waits for the next consumer
    assert_eq!(depth(&server, "cotacoes"), 1);

    let mut fresh = consumer(&server, QueueKind::Cotacoes).await;
    let (delivery, settlement) = timeout(Duration::from_secs(5), fresh.next_delivery())
        .await
        .expect("the remaining quote is delivered")
        .unwrap();
    assert_eq!(delivery.routing_key().as_str(), "bolsa.cotacoes.acoes.vale3");
    fresh.ack(settlement).await.unwrap();
    fresh.close().await.unwrap();
    assert_eq!(depth(&server, "cotacoes"), 0);
}

#[tokio::test]
async fn test_simulation_fills_both_queues() {
    let server = start_broker().await;
    let mut setup = server.connect().await;
    topology::declare_queue(&mut setup, QueueKind::Cotacoes)
        .await
        .unwrap();
    topology::declare_queue(&mut setup, QueueKind::Negociacoes)
        .await
        .unwrap();

    let mut publisher = publisher(&server).await;
    let mut simulator = MarketSimulator::with_seed(3);
    let published = simulate(&mut publisher, &mut simulator, 15, Duration::ZERO)
        .await
        .unwrap();

    assert!(!publisher.connection_mut().is_open());
    assert_eq!(depth(&server, "cotacoes"), 15);
    assert_eq!(depth(&server, "cotacoes") + depth(&server, "negociacoes"), published);
}
