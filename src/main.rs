//! Settlement and scoring backend for a reality-TV prediction game.
//! Binary wiring only; the engines live in the library.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realitybet_backend::{
    api::{create_router, AppState},
    events,
    livepool::LivePoolEngine,
    models::Config,
    resolution::ResolutionEngine,
    scoring::StreakConfig,
    store::GameDb,
    verify::{OpenRouterExtractor, TavilyClient, VerificationAgent, VerifyConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load configuration")?;
    init_tracing();

    info!("starting realitybet backend");

    let db = GameDb::new(&config.database_path).context("open game database")?;
    info!(path = %config.database_path, "database ready");

    let (event_tx, event_rx) = events::channel(256);
    tokio::spawn(event_logger(event_rx));

    let resolution = Arc::new(ResolutionEngine::new(
        db.clone(),
        StreakConfig {
            bonus_cadence: config.streak_bonus_cadence,
            bonus_points: config.streak_bonus_points,
        },
        config.jokers_per_season,
        event_tx.clone(),
    ));
    let livepool = Arc::new(LivePoolEngine::new(db.clone(), event_tx.clone()));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.search_timeout_secs.max(config.llm_timeout_secs)))
        .build()
        .context("build HTTP client")?;

    if config.tavily_api_key.is_none() {
        warn!("TAVILY_API_KEY not set; verification searches will fail upstream");
    }
    if config.openrouter_api_key.is_none() {
        warn!("OPENROUTER_API_KEY not set; answer extraction will fail upstream");
    }
    let search = Arc::new(TavilyClient::new(
        http_client.clone(),
        config.tavily_api_key.clone().unwrap_or_default(),
        Duration::from_secs(config.search_timeout_secs),
    ));
    let extractor = Arc::new(OpenRouterExtractor::new(
        http_client,
        config.openrouter_api_key.clone().unwrap_or_default(),
        config.openrouter_model.clone(),
        Duration::from_secs(config.llm_timeout_secs),
    ));
    let agent = Arc::new(VerificationAgent::new(
        db.clone(),
        resolution.clone(),
        search,
        extractor,
        VerifyConfig {
            auto_resolve_threshold: config.auto_resolve_threshold,
            batch_size: config.verify_batch_size,
            max_search_results: config.evidence_max_results,
        },
    ));

    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set; admin routes are disabled");
    }

    let state = AppState {
        db,
        resolution,
        livepool,
        agent,
        admin_token: config.admin_token.clone(),
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realitybet_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Drain engine events into the log so every settlement leaves a trace
/// even with no subscriber attached.
async fn event_logger(mut rx: events::EventReceiver) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                info!(event = %payload, "engine event");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
