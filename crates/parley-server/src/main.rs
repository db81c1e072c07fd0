mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::auth::{AppState, AppStateInner};
use parley_chat::model::OpenAiCompatClient;
use parley_chat::{ChatConfig, ChatService};
use parley_streams::{RetryPolicy, StreamRegistry, registry};

use crate::config::Config;

const PRUNE_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.model_api_key.is_empty() {
        warn!("PARLEY_MODEL_API_KEY is not set; model requests will be rejected upstream");
    }

    // Init database
    let db = Arc::new(parley_db::Database::open(&config.db_path)?);

    // Streams do not survive a restart; release the threads they held.
    let released = db.with_conn(parley_db::queries::reset_streaming_threads)?;
    if released > 0 {
        info!("Released {} threads left streaming by a previous run", released);
    }

    // Resumable streams live in-process and are pruned after the retention window.
    let streams = StreamRegistry::new(config.max_streams, config.stream_retention);
    tokio::spawn(registry::run_prune_loop(streams.clone(), PRUNE_INTERVAL_SECS));

    let model = OpenAiCompatClient::new(&config.model_api_url, &config.model_api_key)?;
    let chat = ChatService::new(
        db.clone(),
        Arc::new(model),
        Arc::new(streams),
        ChatConfig {
            title_model: config.title_model.clone(),
            limits: config.limits,
            retry: RetryPolicy::default(),
            ..ChatConfig::default()
        },
    );

    let state: AppState = Arc::new(AppStateInner {
        db,
        chat,
        jwt_secret: config.jwt_secret.clone(),
    });

    let app = parley_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.addr().parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
