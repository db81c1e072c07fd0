use axum::{Json, extract::State, response::IntoResponse};

use parley_db::queries;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::run_db;

pub async fn list_models(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let models = run_db(&state.db, queries::list_models).await?;
    Ok(Json(models))
}
