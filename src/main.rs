//! Tapeflow — real-time order-flow ingestion and distribution pipeline.
//!
//! Wires the data plane together: one ingestor per (exchange, symbol), the
//! hot state store, the analytics workers, and the WebSocket/REST gateway,
//! all supervised with restart backoff and a cooperative shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tapeflow_backend::analytics::{
    footprint::FootprintWorker, heatmap::HeatmapWorker, iceberg::IcebergWorker,
    scorer::ScorerWorker, tape::TapeWorker, walls::WallWorker, WorkerContext,
};
use tapeflow_backend::broker::Broker;
use tapeflow_backend::config::Config;
use tapeflow_backend::exchanges::make_adapter;
use tapeflow_backend::gateway::{self, GatewayState};
use tapeflow_backend::hotstore::{DomTable, HotStore};
use tapeflow_backend::ingest::Ingestor;
use tapeflow_backend::supervisor::{spawn_supervised, TaskRegistry};

const EXIT_CONFIG: i32 = 2;
const BROKER_CONNECT_ATTEMPTS: u32 = 5;
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "tapeflow", about = "Order-flow ingestion and distribution pipeline")]
struct Args {
    /// Gateway listen address.
    #[arg(long, env = "GATEWAY_BIND")]
    bind: Option<String>,

    /// Tracing filter, e.g. `tapeflow_backend=debug`.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .map(|f| tracing_subscriber::EnvFilter::new(f))
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapeflow_backend=info,tower_http=warn".into())
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_broker(url: &str) -> Option<Broker> {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=BROKER_CONNECT_ATTEMPTS {
        match Broker::connect(url).await {
            Ok(broker) => return Some(broker),
            Err(e) => {
                warn!(attempt, error = %e, "broker connect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }
    }
    None
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let cfg = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let instruments = cfg.instruments();
    if instruments.is_empty() {
        error!("no symbols configured (set SYMBOLS_BYBIT / SYMBOLS_BINANCE / SYMBOLS_OKX)");
        std::process::exit(EXIT_CONFIG);
    }

    let Some(broker) = connect_broker(&cfg.broker_url).await else {
        error!(url = %cfg.broker_url, "broker unreachable at startup");
        std::process::exit(EXIT_CONFIG);
    };

    info!(
        instruments = instruments.len(),
        broker = %cfg.broker_url,
        "🚀 tapeflow starting"
    );

    let registry = TaskRegistry::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client");

    // Hot state store (shared DOM table survives task restarts).
    let dom_table = DomTable::default();
    {
        let broker = broker.clone();
        let cfg = cfg.clone();
        let registry_for_task = registry.clone();
        let table = dom_table.clone();
        let cancel = cancel_rx.clone();
        spawn_supervised(
            "hotstore".to_string(),
            registry.clone(),
            cancel_rx.clone(),
            move || {
                let store = HotStore::new(
                    broker.clone(),
                    cfg.clone(),
                    registry_for_task.clone(),
                    table.clone(),
                );
                store.run(cancel.clone())
            },
        );
    }

    // One ingestor per (exchange, symbol).
    for inst in &instruments {
        let adapter = make_adapter(inst.exchange, &inst.symbol, http.clone());
        let broker = broker.clone();
        let cfg = cfg.clone();
        let registry_for_task = registry.clone();
        let cancel = cancel_rx.clone();
        let name = format!("ingestor:{inst}");
        spawn_supervised(name, registry.clone(), cancel_rx.clone(), move || {
            let ingestor = Ingestor::new(
                adapter.clone(),
                broker.clone(),
                cfg.clone(),
                registry_for_task.clone(),
            );
            ingestor.run(cancel.clone())
        });
    }

    // Analytics workers per (worker kind, exchange, symbol).
    for inst in &instruments {
        let ctx = WorkerContext {
            broker: broker.clone(),
            cfg: cfg.clone(),
            instrument: inst.clone(),
            registry: registry.clone(),
        };
        macro_rules! launch {
            ($kind:literal, $worker:ident) => {{
                let ctx = ctx.clone();
                let cancel = cancel_rx.clone();
                spawn_supervised(
                    format!(concat!($kind, ":{}"), inst),
                    registry.clone(),
                    cancel_rx.clone(),
                    move || $worker::new(ctx.clone()).run(cancel.clone()),
                );
            }};
        }
        launch!("tape", TapeWorker);
        launch!("heatmap", HeatmapWorker);
        launch!("footprint", FootprintWorker);
        launch!("iceberg", IcebergWorker);
        launch!("walls", WallWorker);
        launch!("scores", ScorerWorker);
    }

    // Gateway.
    let bind = args.bind.unwrap_or_else(|| cfg.gateway_bind.clone());
    let app = gateway::router(GatewayState {
        broker: broker.clone(),
        cfg: cfg.clone(),
        registry: registry.clone(),
        doms: dom_table,
    });
    let listener = match TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = %bind, error = %e, "cannot bind gateway");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!(bind = %bind, "🎯 gateway listening");

    let mut shutdown_rx = cancel_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "gateway server error");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "signal handler failed"),
    }

    // Cooperative shutdown: flip the cancel signal and give tasks the
    // drain window before the process exits.
    let _ = cancel_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("bye");
}
