//! The query layer. Every function takes a plain `&Connection`, so it runs the
//! same way on a pooled connection or inside `Database::transaction`.

use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use parley_types::models::{
    Customer, Message, MessagePart, Model, Role, Settings, Thread, ThreadStatus, Usage, UsageDelta,
};

use crate::models::{MessageRow, ThreadRow, UserRow, now_timestamp, parse_timestamp, parse_uuid};

// -- Users --

/// Create a user together with its default settings and zeroed usage row.
pub fn create_user(
    conn: &Connection,
    id: &Uuid,
    username: Option<&str>,
    password_hash: Option<&str>,
    is_anonymous: bool,
) -> Result<()> {
    let id = id.to_string();
    conn.execute(
        "INSERT INTO users (id, username, password, is_anonymous, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![id, username, password_hash, is_anonymous, now_timestamp()],
    )?;
    conn.execute("INSERT INTO settings (user_id) VALUES (?1)", [&id])?;
    conn.execute("INSERT INTO usage (user_id) VALUES (?1)", [&id])?;
    Ok(())
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password, is_anonymous, created_at FROM users WHERE username = ?1",
    )?;
    let row = stmt.query_row([username], map_user).optional()?;
    Ok(row)
}

pub fn get_user_by_id(conn: &Connection, id: &Uuid) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, is_anonymous, created_at FROM users WHERE id = ?1")?;
    let row = stmt.query_row([id.to_string()], map_user).optional()?;
    Ok(row)
}

// -- Threads --

pub fn get_thread_by_id(conn: &Connection, id: &Uuid) -> Result<Option<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, title, status, stream_id, created_at, updated_at FROM threads WHERE id = ?1",
    )?;
    stmt.query_row([id.to_string()], map_thread)
        .optional()?
        .map(ThreadRow::into_model)
        .transpose()
}

pub fn list_threads_by_user_id(conn: &Connection, user_id: &Uuid) -> Result<Vec<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, title, status, stream_id, created_at, updated_at
         FROM threads
         WHERE user_id = ?1
         ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([user_id.to_string()], map_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(ThreadRow::into_model).collect()
}

pub fn create_thread(conn: &Connection, id: &Uuid, user_id: &Uuid) -> Result<Thread> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO threads (id, user_id, title, status, created_at, updated_at) VALUES (?1, ?2, '', ?3, ?4, ?4)",
        rusqlite::params![id.to_string(), user_id.to_string(), ThreadStatus::Ready.as_str(), now],
    )?;
    get_thread_by_id(conn, id)?.ok_or_else(|| anyhow!("Thread vanished after insert: {}", id))
}

/// Set the thread's status and stream id together. `None` clears the stream id.
pub fn update_thread(
    conn: &Connection,
    id: &Uuid,
    status: ThreadStatus,
    stream_id: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE threads SET status = ?2, stream_id = ?3, updated_at = ?4 WHERE id = ?1",
        rusqlite::params![id.to_string(), status.as_str(), stream_id, now_timestamp()],
    )?;
    if changed == 0 {
        return Err(anyhow!("Thread not found: {}", id));
    }
    Ok(())
}

/// Return every streaming thread to `ready`. Used at startup, when no stream
/// from a previous process can still be running.
pub fn reset_streaming_threads(conn: &Connection) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE threads SET status = ?1, stream_id = NULL, updated_at = ?2 WHERE status = ?3",
        rusqlite::params![ThreadStatus::Ready.as_str(), now_timestamp(), ThreadStatus::Streaming.as_str()],
    )?;
    Ok(changed)
}

pub fn update_thread_title(conn: &Connection, id: &Uuid, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE threads SET title = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), title],
    )?;
    Ok(())
}

pub fn delete_thread(conn: &Connection, id: &Uuid) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM threads WHERE id = ?1", [id.to_string()])?;
    Ok(deleted > 0)
}

// -- Messages --

pub fn get_message_by_id(conn: &Connection, id: &Uuid) -> Result<Option<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, thread_id, role, parts, model_id, created_at FROM messages WHERE id = ?1",
    )?;
    stmt.query_row([id.to_string()], map_message)
        .optional()?
        .map(MessageRow::into_model)
        .transpose()
}

pub fn create_message(
    conn: &Connection,
    id: &Uuid,
    thread_id: &Uuid,
    role: Role,
    parts: &[MessagePart],
    model_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, thread_id, role, parts, model_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.to_string(),
            thread_id.to_string(),
            role.as_str(),
            serde_json::to_string(parts)?,
            model_id,
            now_timestamp(),
        ],
    )?;
    Ok(())
}

pub fn update_message(conn: &Connection, id: &Uuid, parts: &[MessagePart]) -> Result<()> {
    conn.execute(
        "UPDATE messages SET parts = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), serde_json::to_string(parts)?],
    )?;
    Ok(())
}

/// Delete every message in the thread that comes after `message_id`.
/// Returns the number of messages removed.
pub fn delete_trailing_messages(conn: &Connection, thread_id: &Uuid, message_id: &Uuid) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM messages
         WHERE thread_id = ?1
           AND (created_at, rowid) > (SELECT created_at, rowid FROM messages WHERE id = ?2)",
        rusqlite::params![thread_id.to_string(), message_id.to_string()],
    )?;
    Ok(deleted)
}

pub fn get_thread_message_history(conn: &Connection, thread_id: &Uuid) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, thread_id, role, parts, model_id, created_at
         FROM messages
         WHERE thread_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map([thread_id.to_string()], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(MessageRow::into_model).collect()
}

// -- Models --

pub fn get_model_by_id(conn: &Connection, id: &str) -> Result<Option<Model>> {
    let mut stmt = conn.prepare("SELECT id, name, provider_model, credits FROM models WHERE id = ?1")?;
    let row = stmt.query_row([id], map_model).optional()?;
    Ok(row)
}

pub fn list_models(conn: &Connection) -> Result<Vec<Model>> {
    let mut stmt = conn.prepare("SELECT id, name, provider_model, credits FROM models ORDER BY credits, id")?;
    let rows = stmt
        .query_map([], map_model)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Settings --

pub fn get_settings_by_user_id(conn: &Connection, user_id: &Uuid) -> Result<Option<Settings>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, nickname, custom_instructions, temperature FROM settings WHERE user_id = ?1",
    )?;
    let row = stmt
        .query_row([user_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })
        .optional()?;

    row.map(|(user_id, nickname, custom_instructions, temperature)| {
        Ok(Settings {
            user_id: parse_uuid(&user_id)?,
            nickname,
            custom_instructions,
            temperature: temperature as f32,
        })
    })
    .transpose()
}

pub fn update_settings(conn: &Connection, settings: &Settings) -> Result<()> {
    conn.execute(
        "UPDATE settings SET nickname = ?2, custom_instructions = ?3, temperature = ?4 WHERE user_id = ?1",
        rusqlite::params![
            settings.user_id.to_string(),
            settings.nickname,
            settings.custom_instructions,
            f64::from(settings.temperature),
        ],
    )?;
    Ok(())
}

// -- Usage --

pub fn get_usage_by_user_id(conn: &Connection, user_id: &Uuid) -> Result<Option<Usage>> {
    let mut stmt = conn.prepare("SELECT credits, search, research FROM usage WHERE user_id = ?1")?;
    let row = stmt
        .query_row([user_id.to_string()], |row| {
            Ok(Usage {
                user_id: *user_id,
                credits: row.get(0)?,
                search: row.get(1)?,
                research: row.get(2)?,
            })
        })
        .optional()?;
    Ok(row)
}

pub fn increment_usage(conn: &Connection, user_id: &Uuid, delta: &UsageDelta) -> Result<()> {
    conn.execute(
        "UPDATE usage
         SET credits = credits + ?2, search = search + ?3, research = research + ?4
         WHERE user_id = ?1",
        rusqlite::params![user_id.to_string(), delta.credits, delta.search, delta.research],
    )?;
    Ok(())
}

/// Refund usage. Counters never drop below zero.
pub fn decrement_usage(conn: &Connection, user_id: &Uuid, delta: &UsageDelta) -> Result<()> {
    conn.execute(
        "UPDATE usage
         SET credits = MAX(credits - ?2, 0), search = MAX(search - ?3, 0), research = MAX(research - ?4, 0)
         WHERE user_id = ?1",
        rusqlite::params![user_id.to_string(), delta.credits, delta.search, delta.research],
    )?;
    Ok(())
}

// -- Customers --

pub fn get_user_customer_by_user_id(conn: &Connection, user_id: &Uuid) -> Result<Option<Customer>> {
    let mut stmt = conn.prepare(
        "SELECT customer_id, subscription_ends_at FROM customers WHERE user_id = ?1",
    )?;
    let row = stmt
        .query_row([user_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .optional()?;

    row.map(|(customer_id, ends_at)| {
        Ok(Customer {
            user_id: *user_id,
            customer_id,
            subscription_ends_at: ends_at.as_deref().map(parse_timestamp).transpose()?,
        })
    })
    .transpose()
}

/// Mirror a billing provider customer record.
pub fn upsert_customer(conn: &Connection, customer: &Customer) -> Result<()> {
    conn.execute(
        "INSERT INTO customers (user_id, customer_id, subscription_ends_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
             customer_id = excluded.customer_id,
             subscription_ends_at = excluded.subscription_ends_at",
        rusqlite::params![
            customer.user_id.to_string(),
            customer.customer_id,
            customer.subscription_ends_at.map(crate::models::format_timestamp),
        ],
    )?;
    Ok(())
}

// -- Row mappers --

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        is_anonymous: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_thread(row: &Row<'_>) -> rusqlite::Result<ThreadRow> {
    Ok(ThreadRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        stream_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: row.get(2)?,
        parts: row.get(3)?,
        model_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_model(row: &Row<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_model: row.get(2)?,
        credits: row.get(3)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
