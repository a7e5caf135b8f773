mod api;
mod cancel;
mod config;
mod relay;
mod session_key;

use anyhow::Context;
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::auth::StaticTokenAuthenticator;
use crate::cancel::file_repository::FileCancellationStore;
use crate::cancel::memory_repository::MemoryCancellationStore;
use crate::cancel::registry::CancellationRegistry;
use crate::cancel::repository::CancellationStore;
use crate::config::{CancelStoreKind, Config};
use crate::relay::connector::{AutomationBackend, HttpAutomationBackend, StreamingConnector};
use crate::relay::session::RelayContext;
use crate::session_key::SessionKey;

const SWEEP_EVERY: Duration = Duration::from_secs(10 * 60);

#[derive(Parser)]
#[command(name = "flowrelay", about = "Streaming relay and cancellation service for a workflow-automation chat backend")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Flag a session as cancelled in the shared store
    Cancel {
        /// Session key as the client knows it
        session_key: String,
    },
    /// Delete stale cancellation flags once and exit
    Sweep,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env();
    init_tracing();

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Cancel { session_key } => {
            let Some(key) = SessionKey::parse(&session_key) else {
                return Err(format!("'{session_key}' has no usable characters").into());
            };
            let store = FileCancellationStore::new(config.cancellations_dir());
            store.mark_cancelled(&key).await?;
            println!("Cancellation flag set for {key} in {}", store.dir().display());
            Ok(())
        }
        Cli::Sweep => {
            let store = FileCancellationStore::new(config.cancellations_dir());
            let removed = store.sweep_stale(config.stale_flag_ttl).await?;
            println!("Removed {removed} stale cancellation flag(s)");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowrelay=info,tower_http=warn,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

fn build_store(config: &Config) -> Arc<dyn CancellationStore> {
    match config.cancel_store {
        CancelStoreKind::File => {
            tracing::info!(dir = %config.cancellations_dir().display(), "using file cancellation store");
            Arc::new(FileCancellationStore::new(config.cancellations_dir()))
        }
        CancelStoreKind::Memory => {
            tracing::info!("using in-memory cancellation store (single instance only)");
            Arc::new(MemoryCancellationStore::new())
        }
    }
}

fn spawn_sweeper(store: Arc<dyn CancellationStore>, ttl: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_EVERY);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep_stale(ttl).await {
                tracing::warn!(error = %e, "stale flag sweep failed");
            }
        }
    });
}

async fn run_server(config: Config) -> Result<(), Box<dyn Error>> {
    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    // No overall timeout here: each upstream request carries its own.
    let http_client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let backend: Arc<dyn AutomationBackend> = Arc::new(HttpAutomationBackend::new(
        http_client,
        config.upstream_url.clone(),
        config.upstream_token.clone(),
    ));
    let connector = Arc::new(StreamingConnector::new(
        backend,
        config.mobile.clone(),
        config.desktop.clone(),
    ));

    let store = build_store(&config);
    spawn_sweeper(store.clone(), config.stale_flag_ttl);

    let relay = RelayContext {
        connector,
        registry: Arc::new(CancellationRegistry::new()),
        store,
        poll_interval: config.poll_interval,
        long_poll_ceiling: config.long_poll_ceiling,
        outbound_capacity: config.outbound_capacity,
    };

    if config.api_token.is_none() {
        tracing::warn!("API_TOKEN is not set, accepting unauthenticated requests");
    }
    let authenticator = Arc::new(StaticTokenAuthenticator::new(config.api_token.clone()));

    let port = config.port;
    tracing::info!(
        upstream = %config.upstream_url,
        mobile_timeout_secs = config.mobile.timeout.as_secs(),
        desktop_timeout_secs = config.desktop.timeout.as_secs(),
        "relay configured"
    );

    let app_state = api::AppState {
        config: Arc::new(config),
        relay,
        authenticator,
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
