use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use cro_domain::config::Config;
use cro_orchestrator::{SessionHub, TurnDeps};
use cro_providers::cli::ChildRegistry;
use cro_providers::ProviderRegistry;
use cro_sessions::{EventSink, SessionStore};

mod routes;
mod state;

use state::AppState;

#[derive(Parser)]
#[command(name = "cro-gateway")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load_or_default(&cli.config));
    init_tracing(&config);

    tracing::info!("chat run orchestrator gateway starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let sink = Arc::new(EventSink::new(config.data_dir.clone()));
    let store = Arc::new(SessionStore::new(&config.data_dir).context("initializing session store")?);
    let providers = Arc::new(ProviderRegistry::from_config(&config).context("initializing LLM providers")?);
    let cli_registry = Arc::new(ChildRegistry::new());
    let rate_limiter = Arc::new(cro_orchestrator::runtime::tools::RateLimiter::default());
    let http_client = reqwest::Client::new();

    tracing::info!(agents = config.agents.len(), "agent configuration loaded");

    let deps = TurnDeps {
        sink,
        store: store.clone(),
        providers,
        cli_registry,
        rate_limiter,
        http_client,
    };
    let hub = SessionHub::new(deps, (*config).clone());

    // Periodic session-store flush, matching the cadence the teacher uses
    // for its own background persistence sweeps.
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = store.flush() {
                    tracing::warn!(error = %e, "session store flush failed");
                }
            }
        });
    }

    let state = AppState { config: config.clone(), hub };
    let app = routes::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Structured logging, with OTLP export layered in only when
/// `observability.otlp_endpoint` is configured; tests and local runs get
/// plain stdout logs.
fn init_tracing(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cro_gateway=debug"));
    let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if config.observability.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    match &config.observability.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
                .install_batch(opentelemetry_sdk::runtime::Tokio);
            match tracer {
                Ok(tracer) => {
                    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt_layer)
                        .with(otel_layer)
                        .init();
                }
                Err(e) => {
                    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
                    tracing::warn!(error = %e, endpoint = %endpoint, "failed to install OTLP exporter, continuing without it");
                }
            }
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
        }
    }
}
