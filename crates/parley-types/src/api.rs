use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessagePart, Thread, Tier};

// -- JWT Claims --

/// JWT claims shared by the auth handlers and the request middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub anonymous: bool,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub anonymous: bool,
    pub token: String,
}

// -- Chat --

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessageInput {
    /// Client-generated id. Reusing the id of an existing message edits it.
    pub id: Uuid,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatRequest {
    pub thread_id: Uuid,
    pub model_id: String,
    pub message: ChatMessageInput,
    #[serde(default)]
    pub search: bool,
}

// -- Threads --

/// What the message list needs to render: ordering and the streaming flag.
#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadView {
    pub thread: Thread,
    pub is_streaming: bool,
    pub message_ids: Vec<Uuid>,
}

// -- Usage --

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub tier: Tier,
    pub credit_limit: i64,
    pub credits_used: i64,
    pub search_used: i64,
    pub research_used: i64,
    pub remaining_credits: i64,
}

// -- Settings --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSettingsRequest {
    pub nickname: Option<String>,
    pub custom_instructions: Option<String>,
    pub temperature: Option<f32>,
}
