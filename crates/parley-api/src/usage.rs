use axum::{Extension, Json, extract::State, response::IntoResponse};
use chrono::Utc;

use parley_chat::limits;
use parley_db::queries;
use parley_types::api::{Claims, UsageResponse};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::run_db;

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let (usage, customer) = run_db(&state.db, move |conn| {
        Ok((
            queries::get_usage_by_user_id(conn, &user_id)?,
            queries::get_user_customer_by_user_id(conn, &user_id)?,
        ))
    })
    .await?;
    let usage = usage.ok_or_else(|| ApiError::NotFound("usage not found".into()))?;

    let limits = limits::limits_for(customer.as_ref(), claims.anonymous, Utc::now(), state.chat.limits());

    Ok(Json(UsageResponse {
        tier: limits.tier,
        credit_limit: limits.credits,
        credits_used: usage.credits,
        search_used: usage.search,
        research_used: usage.research,
        remaining_credits: limits::remaining_credits(&limits, usage.credits, 0).max(0),
    }))
}
