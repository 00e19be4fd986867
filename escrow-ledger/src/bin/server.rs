//! Escrow ledger server binary

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use escrow_ledger::{Config, Ledger, Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("ESCROW_LOG_JSON").is_ok() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting escrow ledger server");

    // Load configuration
    let config = match std::env::var("ESCROW_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };
    let metrics_addr = config.metrics_listen_addr.clone();
    let sweeper_config = config.sweeper.clone();

    // Open ledger
    let ledger = Ledger::open(config).await.context("opening ledger")?;
    ledger.reconcile_all().context("startup reconciliation")?;
    tracing::info!("Ledger opened and reconciled");

    let sweeper = if sweeper_config.enabled {
        Some(Sweeper::new(ledger.clone(), sweeper_config).spawn())
    } else {
        tracing::info!("Timeout sweeper disabled");
        None
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(ledger.clone());

    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("binding {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "Serving /health and /metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down escrow ledger server");
    if let Some(task) = sweeper {
        task.abort();
    }
    ledger.shutdown().await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(ledger): State<Ledger>) -> Result<String, (StatusCode, String)> {
    ledger
        .metrics()
        .render()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
