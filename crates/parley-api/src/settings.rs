use axum::{Extension, Json, extract::State, response::IntoResponse};

use parley_db::queries;
use parley_types::api::{Claims, UpdateSettingsRequest};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::run_db;

const MAX_NICKNAME_CHARS: usize = 64;
const MAX_INSTRUCTIONS_CHARS: usize = 4000;

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let settings = run_db(&state.db, move |conn| queries::get_settings_by_user_id(conn, &user_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("settings not found".into()))?;
    Ok(Json(settings))
}

/// Replace the text preferences. An omitted temperature keeps the current one.
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nickname = non_blank(req.nickname);
    let custom_instructions = non_blank(req.custom_instructions);

    if nickname.as_ref().is_some_and(|n| n.chars().count() > MAX_NICKNAME_CHARS) {
        return Err(ApiError::BadRequest("nickname is too long".into()));
    }
    if custom_instructions
        .as_ref()
        .is_some_and(|i| i.chars().count() > MAX_INSTRUCTIONS_CHARS)
    {
        return Err(ApiError::BadRequest("custom instructions are too long".into()));
    }
    if let Some(t) = req.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ApiError::BadRequest("temperature must be between 0 and 2".into()));
        }
    }

    let user_id = claims.sub;
    let updated = run_db(&state.db, move |conn| {
        let Some(mut settings) = queries::get_settings_by_user_id(conn, &user_id)? else {
            return Ok(None);
        };
        settings.nickname = nickname;
        settings.custom_instructions = custom_instructions;
        if let Some(t) = req.temperature {
            settings.temperature = t;
        }
        queries::update_settings(conn, &settings)?;
        Ok(Some(settings))
    })
    .await?
    .ok_or_else(|| ApiError::NotFound("settings not found".into()))?;

    Ok(Json(updated))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
