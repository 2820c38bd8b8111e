//! CLI for Bolsa
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: simulate the market and publish quotes and trades
//! - `consume`: consume the `cotacoes` or `negociacoes` queue

use std::error::Error;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bolsa::broker::Broker;
use bolsa::config::{Settings, load_config, resolve_broker_url};
use bolsa::connection::{Connection, ConnectionUri, DeliverySession, Publisher, RunSummary};
use bolsa::market::{self, MarketHandler, MarketSimulator, QueueKind, topology};
use bolsa::persistence::Persistence;
use bolsa::transport::websocket::start_websocket_server;
use bolsa::utils::logging;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bolsa")]
enum Command {
    /// Start the broker
    Server,
    /// Publish simulated quotes and trades to the `bolsa` exchange
    Publish {
        /// Number of iterations
        #[arg(long, default_value_t = 20)]
        count: usize,
        /// Seconds between iterations
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Broker URL (ws://user:pass@host:port/vhost)
        #[arg(long)]
        url: Option<String>,
    },
    /// Consume one of the market queues
    Consume {
        #[arg(value_enum)]
        kind: QueueKind,
        /// Broker URL (ws://user:pass@host:port/vhost)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = load_config();
    let level = settings
        .as_ref()
        .map(|s| s.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    logging::init(&level);

    let result = match cmd {
        Command::Server => match settings {
            Ok(settings) => run_server(settings).await,
            Err(e) => Err(e.into()),
        },
        Command::Publish {
            count,
            interval,
            url,
        } => run_publisher(&resolve_broker_url(url.as_deref()), count, interval).await,
        Command::Consume { kind, url } => {
            run_consumer(kind, &resolve_broker_url(url.as_deref())).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn Error>> {
    let broker = if settings.broker.in_memory {
        warn!("Running without storage; durable state is lost on exit");
        Broker::new()
    } else {
        let persistence = Persistence::open(&settings.broker.data_dir)?;
        Broker::new_with_persistence(persistence)?
    };
    let broker = Arc::new(Mutex::new(broker.with_vhost(&settings.server.vhost)));

    let listen_addr = settings.listen_addr();
    tokio::select! {
        result = start_websocket_server(&listen_addr, broker) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_publisher(url: &str, count: usize, interval: f64) -> Result<(), Box<dyn Error>> {
    if !interval.is_finite() || interval < 0.0 {
        return Err(
            format!("interval must be a non-negative number of seconds, got {interval}").into(),
        );
    }

    let uri = ConnectionUri::parse(url)?;
    let mut connection = Connection::connect(&uri).await?;
    topology::declare_exchange(&mut connection).await?;

    let mut publisher = Publisher::new(connection, market::EXCHANGE);
    let mut simulator = MarketSimulator::new();
    let published = market::simulate(
        &mut publisher,
        &mut simulator,
        count,
        Duration::from_secs_f64(interval),
    )
    .await?;

    info!("Published {published} messages");
    Ok(())
}

async fn run_consumer(kind: QueueKind, url: &str) -> Result<(), Box<dyn Error>> {
    info!("{}", kind.banner());

    let uri = ConnectionUri::parse(url)?;
    let mut connection = Connection::connect(&uri).await?;
    topology::declare_queue(&mut connection, kind).await?;

    let mut session = DeliverySession::attach(connection, kind.queue_name()).await?;
    info!("Consumer {kind} aguardando mensagens...");

    let mut handler = MarketHandler::new();
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for the interrupt signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Consumer interrompido pelo usuário");
    };
    let result = session.run(&mut handler, interrupted).await;

    info!("Fechando conexão...");
    if let Err(e) = session.close().await {
        warn!("Failed to close the connection cleanly: {e}");
    }

    let RunSummary { acked, nacked } = result?;
    info!("{acked} messages acked, {nacked} rejected");
    Ok(())
}
