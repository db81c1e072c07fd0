use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand_core::OsRng;
use tracing::info;
use uuid::Uuid;

use parley_chat::ChatService;
use parley_db::{Database, queries};
use parley_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};

use crate::error::ApiError;
use crate::run_db;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    pub jwt_secret: String,
}

const ANONYMOUS_USERNAME: &str = "anonymous";
const TOKEN_TTL_DAYS: i64 = 30;

/// Start a guest session: a fresh anonymous user on the lowest tier.
pub async fn anonymous(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let user_id = Uuid::new_v4();
    run_db(&state.db, move |conn| queries::create_user(conn, &user_id, None, None, true)).await?;

    let token = create_token(&state.jwt_secret, user_id, ANONYMOUS_USERNAME, true)?;
    info!("Anonymous session started for {}", user_id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user_id,
            anonymous: true,
            token,
        }),
    ))
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::BadRequest("username must be 3 to 32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters".into()));
    }

    let username = req.username.clone();
    let taken = run_db(&state.db, move |conn| queries::get_user_by_username(conn, &username)).await?;
    if taken.is_some() {
        return Err(ApiError::Conflict("username is taken".into()));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
        .to_string();

    let user_id = Uuid::new_v4();
    let username = req.username.clone();
    run_db(&state.db, move |conn| {
        queries::create_user(conn, &user_id, Some(&username), Some(&password_hash), false)
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &req.username, false)?;
    info!("Registered {} as {}", req.username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user_id,
            anonymous: false,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.clone();
    let user = run_db(&state.db, move |conn| queries::get_user_by_username(conn, &username))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    // Anonymous users have no password and cannot log in.
    let stored = user.password.as_deref().ok_or(ApiError::Unauthorized)?;
    let parsed_hash = PasswordHash::new(stored).map_err(|e| anyhow::anyhow!("stored hash is invalid: {e}"))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let user_id: Uuid = user.id.parse().map_err(anyhow::Error::from)?;
    let token = create_token(&state.jwt_secret, user_id, &req.username, false)?;

    Ok(Json(AuthResponse {
        user_id,
        anonymous: false,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str, anonymous: bool) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        anonymous,
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}
