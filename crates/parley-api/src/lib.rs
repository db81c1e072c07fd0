pub mod auth;
pub mod chat;
pub mod error;
pub mod middleware;
pub mod models;
pub mod settings;
pub mod threads;
pub mod usage;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use rusqlite::Connection;

use parley_db::Database;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::require_auth;

/// All routes, with authentication applied to everything outside `/auth`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/anonymous", post(auth::anonymous))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/threads", get(threads::list_threads))
        .route("/threads/{thread_id}", get(threads::get_thread).delete(threads::delete_thread))
        .route("/threads/{thread_id}/messages", get(threads::get_messages))
        .route("/models", get(models::list_models))
        .route("/usage", get(usage::get_usage))
        .route("/settings", get(settings::get_settings).put(settings::update_settings))
        .route("/chat", post(chat::start_chat))
        .route("/chat/{thread_id}/stream", get(chat::resume_stream))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

/// Run blocking DB work off the async runtime.
pub(crate) async fn run_db<T, F>(db: &Arc<Database>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    let value = tokio::task::spawn_blocking(move || db.with_conn(f)).await??;
    Ok(value)
}
