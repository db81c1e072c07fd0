//! Database row types. These map directly to SQLite rows and are converted
//! into parley-types models at the edge of the query layer.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{Message, MessagePart, Role, Thread, ThreadStatus};

pub struct UserRow {
    pub id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_anonymous: bool,
    pub created_at: String,
}

pub struct ThreadRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: String,
    pub stream_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ThreadRow {
    pub fn into_model(self) -> Result<Thread> {
        Ok(Thread {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            status: ThreadStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("Corrupt status '{}' on thread '{}'", self.status, self.id))?,
            title: self.title,
            stream_id: self.stream_id,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub parts: String,
    pub model_id: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_model(self) -> Result<Message> {
        let parts: Vec<MessagePart> = serde_json::from_str(&self.parts)
            .with_context(|| format!("Corrupt parts on message '{}'", self.id))?;

        Ok(Message {
            id: parse_uuid(&self.id)?,
            thread_id: parse_uuid(&self.thread_id)?,
            role: Role::parse(&self.role)
                .ok_or_else(|| anyhow!("Corrupt role '{}' on message '{}'", self.role, self.id))?,
            parts,
            model_id: self.model_id,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Fixed-width RFC 3339 timestamps sort lexicographically in SQL.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; treat it as UTC.
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", value))
}

pub fn parse_uuid(value: &str) -> Result<Uuid> {
    value.parse().with_context(|| format!("Corrupt id '{}'", value))
}
