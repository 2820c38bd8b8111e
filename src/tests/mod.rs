//! End-to-end tests against a broker served on an ephemeral port.

mod integration_test;

use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;

use crate::broker::{Broker, SharedBroker};
use crate::connection::{Connection, ConnectionUri};
use crate::transport::websocket::serve;

pub(crate) struct TestBroker {
    pub broker: SharedBroker,
    pub port: u16,
}

impl TestBroker {
    pub fn url(&self) -> String {
        format!("ws://guest:guest@127.0.0.1:{}/", self.port)
    }

    pub fn uri(&self) -> ConnectionUri {
        ConnectionUri::parse(&self.url()).unwrap()
    }

    pub async fn connect(&self) -> Connection {
        Connection::connect(&self.uri()).await.unwrap()
    }
}

pub(crate) async fn start_broker_with(broker: Broker) -> TestBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = Arc::new(Mutex::new(broker));
    tokio::spawn(serve(listener, broker.clone()));
    TestBroker { broker, port }
}

pub(crate) async fn start_broker() -> TestBroker {
    start_broker_with(Broker::new()).await
}

/// A port nothing listens on.
pub(crate) async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
