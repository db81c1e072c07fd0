use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_db::queries;
use parley_types::api::{Claims, ThreadView};
use parley_types::models::Thread;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::run_db;

pub async fn list_threads(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let threads = run_db(&state.db, move |conn| queries::list_threads_by_user_id(conn, &user_id)).await?;
    Ok(Json(threads))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = owned_thread(&state, thread_id, claims.sub).await?;
    let messages = run_db(&state.db, move |conn| queries::get_thread_message_history(conn, &thread_id)).await?;

    Ok(Json(ThreadView {
        is_streaming: thread.is_streaming(),
        message_ids: messages.iter().map(|m| m.id).collect(),
        thread,
    }))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    owned_thread(&state, thread_id, claims.sub).await?;
    let messages = run_db(&state.db, move |conn| queries::get_thread_message_history(conn, &thread_id)).await?;
    Ok(Json(messages))
}

pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = owned_thread(&state, thread_id, claims.sub).await?;
    if thread.is_streaming() {
        return Err(ApiError::BadRequest("thread is streaming".into()));
    }

    run_db(&state.db, move |conn| queries::delete_thread(conn, &thread_id)).await?;
    info!("Deleted thread {}", thread_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn owned_thread(state: &AppState, thread_id: Uuid, user_id: Uuid) -> Result<Thread, ApiError> {
    let thread = run_db(&state.db, move |conn| queries::get_thread_by_id(conn, &thread_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("thread not found".into()))?;

    if thread.user_id != user_id {
        return Err(ApiError::Forbidden("thread belongs to another user".into()));
    }
    Ok(thread)
}
