use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, error, info};
use uuid::Uuid;

use parley_db::{Database, queries};
use parley_types::models::{
    Customer, Message, MessagePart, Model, Role, Settings, Thread, ThreadStatus, Usage, UsageDelta,
};

use crate::error::ChatError;
use crate::limits::{self, Limits, LimitsConfig};

const PREPARE_FAILED: &str = "failed to prepare thread context";

#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub is_anonymous: bool,
    pub message_id: Uuid,
    pub parts: Vec<MessagePart>,
    pub model_id: String,
    pub stream_id: String,
}

/// Everything the model call needs, assembled under one transaction.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub thread: Thread,
    pub model: Model,
    pub settings: Settings,
    pub limits: Limits,
    pub remaining_credits: i64,
    pub messages: Vec<Message>,
    pub is_new_thread: bool,
    pub edited: bool,
}

/// The independent reads preparation starts from.
struct Snapshot {
    thread: Option<Thread>,
    message: Option<Message>,
    model: Option<Model>,
    settings: Option<Settings>,
    usage: Option<Usage>,
    customer: Option<Customer>,
}

impl Snapshot {
    fn load(conn: &Connection, req: &PrepareRequest) -> anyhow::Result<Self> {
        Ok(Self {
            thread: queries::get_thread_by_id(conn, &req.thread_id)?,
            message: queries::get_message_by_id(conn, &req.message_id)?,
            model: queries::get_model_by_id(conn, &req.model_id)?,
            settings: queries::get_settings_by_user_id(conn, &req.user_id)?,
            usage: queries::get_usage_by_user_id(conn, &req.user_id)?,
            customer: queries::get_user_customer_by_user_id(conn, &req.user_id)?,
        })
    }
}

/// Validate the request, claim the thread for a new stream and store the
/// user's message. Runs in a single transaction: any error leaves the
/// database untouched.
pub fn prepare_thread_context(
    db: &Database,
    req: &PrepareRequest,
    limits_config: &LimitsConfig,
    now: DateTime<Utc>,
) -> Result<ThreadContext, ChatError> {
    db.transaction(|tx| prepare_in(tx, req, limits_config, now))
        .map_err(|e| match e {
            ChatError::Internal(detail) => {
                error!("Thread {} preparation failed: {}", req.thread_id, detail);
                ChatError::Internal(PREPARE_FAILED.into())
            }
            other => other,
        })
}

fn prepare_in(
    conn: &Connection,
    req: &PrepareRequest,
    limits_config: &LimitsConfig,
    now: DateTime<Utc>,
) -> Result<ThreadContext, ChatError> {
    let snapshot = Snapshot::load(conn, req)?;

    let settings = snapshot.settings.ok_or_else(|| ChatError::not_found("settings"))?;
    let usage = snapshot.usage.ok_or_else(|| ChatError::not_found("usage"))?;
    let model = snapshot.model.ok_or_else(|| ChatError::not_found("model"))?;

    let (mut thread, is_new_thread) = match snapshot.thread {
        Some(thread) => (thread, false),
        None => {
            debug!("Creating thread {} for {}", req.thread_id, req.user_id);
            (queries::create_thread(conn, &req.thread_id, &req.user_id)?, true)
        }
    };

    if thread.is_streaming() {
        return Err(ChatError::Conflict("thread is already streaming".into()));
    }
    if thread.user_id != req.user_id {
        return Err(ChatError::Forbidden("thread belongs to another user".into()));
    }

    let limits = limits::limits_for(snapshot.customer.as_ref(), req.is_anonymous, now, limits_config);
    let remaining_credits = limits::remaining_credits(&limits, usage.credits, model.credits);
    if remaining_credits < 0 {
        return Err(ChatError::Forbidden("credit limit reached".into()));
    }

    if let Some(existing) = &snapshot.message {
        if existing.thread_id != thread.id {
            return Err(ChatError::Conflict("message belongs to another thread".into()));
        }
        if existing.role != Role::User {
            return Err(ChatError::Conflict("only user messages can be edited".into()));
        }
    }

    queries::update_thread(conn, &thread.id, ThreadStatus::Streaming, Some(&req.stream_id))?;
    thread.status = ThreadStatus::Streaming;
    thread.stream_id = Some(req.stream_id.clone());

    let edited = match snapshot.message {
        Some(existing) => {
            queries::update_message(conn, &existing.id, &req.parts)?;
            let removed = queries::delete_trailing_messages(conn, &thread.id, &existing.id)?;
            debug!("Edited message {} and dropped {} later messages", existing.id, removed);
            true
        }
        None => {
            queries::create_message(
                conn,
                &req.message_id,
                &thread.id,
                Role::User,
                &req.parts,
                Some(&model.id),
            )?;
            false
        }
    };

    let messages = queries::get_thread_message_history(conn, &thread.id)?;

    info!(
        "Prepared thread {} ({} messages, {} credits left)",
        thread.id,
        messages.len(),
        remaining_credits
    );

    Ok(ThreadContext {
        thread,
        model,
        settings,
        limits,
        remaining_credits,
        messages,
        is_new_thread,
        edited,
    })
}

/// Check that `user_id` may reattach to the thread's live stream and return
/// its stream id.
pub fn validate_resume_context(db: &Database, thread_id: &Uuid, user_id: &Uuid) -> Result<String, ChatError> {
    let thread = db
        .with_conn(|conn| queries::get_thread_by_id(conn, thread_id))?
        .ok_or_else(|| ChatError::not_found("thread"))?;

    if thread.user_id != *user_id {
        return Err(ChatError::Forbidden("thread belongs to another user".into()));
    }
    if !thread.is_streaming() {
        return Err(ChatError::Conflict("thread is not streaming".into()));
    }
    thread
        .stream_id
        .ok_or_else(|| ChatError::Conflict("thread has no active stream".into()))
}

/// Store the assistant reply and hand the thread back to `ready`. Skipped if
/// another stream has claimed the thread in the meantime.
pub fn complete_thread_stream(
    db: &Database,
    thread_id: &Uuid,
    stream_id: &str,
    reply: Option<(&Uuid, &[MessagePart], &str)>,
) -> Result<bool, ChatError> {
    db.transaction(|tx| {
        if !owns_stream(tx, thread_id, stream_id)? {
            return Ok(false);
        }
        if let Some((message_id, parts, model_id)) = reply {
            queries::create_message(tx, message_id, thread_id, Role::Assistant, parts, Some(model_id))?;
        }
        queries::update_thread(tx, thread_id, ThreadStatus::Ready, None)?;
        Ok(true)
    })
}

/// Release the thread after a failed generation and refund what was charged.
pub fn abort_thread_stream(
    db: &Database,
    thread_id: &Uuid,
    stream_id: &str,
    user_id: &Uuid,
    refund: &UsageDelta,
) -> Result<(), ChatError> {
    db.transaction(|tx| {
        if owns_stream(tx, thread_id, stream_id)? {
            queries::update_thread(tx, thread_id, ThreadStatus::Ready, None)?;
        }
        Ok::<_, ChatError>(())
    })?;
    db.with_conn(|conn| queries::decrement_usage(conn, user_id, refund))?;
    Ok(())
}

fn owns_stream(conn: &Connection, thread_id: &Uuid, stream_id: &str) -> anyhow::Result<bool> {
    Ok(queries::get_thread_by_id(conn, thread_id)?
        .is_some_and(|t| t.is_streaming() && t.stream_id.as_deref() == Some(stream_id)))
}
