//! aegis-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads layered
//! config, builds the shared state, wires middleware, starts the sweeper
//! loops, and serves. All route handlers live in `routes.rs`; all shared
//! state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use aegis_daemon::{routes, state};
use aegis_gateway::{
    AttestationVerdict, HttpPaymentGateway, InMemoryOtpDelivery, InMemoryPaymentGateway,
    StaticAttestationVerifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = load_settings()?;
    let bind_addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("bad bind_addr {}", settings.bind_addr))?;

    let pool = aegis_db::connect_from_env().await?;
    aegis_db::migrate(&pool).await?;

    // Outbound adapters. The payment gateway is HTTP when configured,
    // in-memory otherwise (dev); OTP delivery and attestation keep their
    // dev adapters until the real transports are wired.
    let payment: Arc<dyn aegis_gateway::PaymentGateway> =
        match std::env::var("AEGIS_PAYMENT_URL").ok() {
            Some(url) => Arc::new(HttpPaymentGateway::new(url, Duration::from_secs(10))),
            None => {
                warn!("AEGIS_PAYMENT_URL unset; using in-memory payment gateway");
                Arc::new(InMemoryPaymentGateway::new())
            }
        };
    let otp_delivery = Arc::new(InMemoryOtpDelivery::new());
    let attestation = Arc::new(StaticAttestationVerifier::new(AttestationVerdict::Unsupported));

    let shared = Arc::new(state::AppState::new(
        pool.clone(),
        settings,
        payment,
        otp_delivery,
        attestation,
    ));

    // Warm the caches once before serving, then hand the handles to the
    // sweeper loops.
    if let Err(e) =
        aegis_sweeper::run_cache_warm(&pool, &shared.coverage, &shared.products).await
    {
        warn!("initial cache warm failed: {e:#}");
    }
    aegis_sweeper::spawn_jobs(
        pool,
        Arc::clone(&shared.directory),
        Arc::clone(&shared.settings),
        Arc::clone(&shared.coverage),
        Arc::clone(&shared.products),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    info!("aegis-daemon listening on http://{}", bind_addr);
    axum::serve(tokio::net::TcpListener::bind(bind_addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Layered YAML: base config plus an optional local override, path from
/// AEGIS_CONFIG (defaults to config/aegis.yaml when present).
fn load_settings() -> anyhow::Result<aegis_config::Settings> {
    let mut paths: Vec<String> = Vec::new();
    match std::env::var("AEGIS_CONFIG") {
        Ok(p) => paths.push(p),
        Err(_) => {
            if std::path::Path::new("config/aegis.yaml").exists() {
                paths.push("config/aegis.yaml".to_string());
            }
        }
    }
    if std::path::Path::new("config/aegis.local.yaml").exists() {
        paths.push("config/aegis.local.yaml".to_string());
    }

    if paths.is_empty() {
        info!("no config files found; using defaults");
        return Ok(aegis_config::Settings::default());
    }

    let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = aegis_config::load_layered_yaml(&path_refs)?;
    info!(config_hash = %loaded.config_hash, files = ?paths, "config loaded");
    loaded.settings()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
