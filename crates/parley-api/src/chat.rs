use std::convert::Infallible;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use parley_streams::TextStream;
use parley_types::api::{ChatRequest, Claims};
use parley_types::models::MessagePart;

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn start_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message.parts.is_empty() {
        return Err(ApiError::BadRequest("message has no parts".into()));
    }
    if req
        .message
        .parts
        .iter()
        .all(|p| matches!(p, MessagePart::Text { text } if text.trim().is_empty()))
    {
        return Err(ApiError::BadRequest("message is empty".into()));
    }

    let stream = state.chat.start_chat(claims.sub, claims.anonymous, req).await?;
    Ok(sse(stream))
}

/// Reattach to a thread's live response. 204 when there is nothing to resume.
pub async fn resume_stream(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, ApiError> {
    match state.chat.resume_chat(claims.sub, thread_id).await? {
        Some(stream) => Ok(sse(stream).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

fn sse(stream: TextStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(stream.map(|data| Ok(Event::default().data(data)))).keep_alive(KeepAlive::default())
}
