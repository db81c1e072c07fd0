use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::{Database, queries};
use parley_types::models::Role;

use crate::model::{GenerateRequest, ModelClient, PromptMessage};

const TITLE_PROMPT: &str = "Write a short title (at most six words) that summarizes the user's first message. \
Reply with the title only: no quotes, no trailing punctuation.";

const MAX_TITLE_CHARS: usize = 80;

/// Upper bound on the title call; the latch must reopen even if the model hangs.
pub const TITLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Single-permit gate between "title pending" and "title ready".
///
/// Title generation holds the permit while it runs; [`TitleLatch::wait`]
/// returns once it has been released. Nothing stops two generations for the
/// same thread from running at once; each request owns its own latch.
#[derive(Clone)]
pub struct TitleLatch {
    gate: Arc<Semaphore>,
}

impl Default for TitleLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleLatch {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Close the latch until the returned permit is dropped.
    pub async fn close(&self) -> Option<OwnedSemaphorePermit> {
        self.gate.clone().acquire_owned().await.ok()
    }

    pub async fn wait(&self) {
        let _open = self.gate.acquire().await;
    }
}

/// Close `latch`, then generate and store a title in the background. The
/// latch reopens once the title is persisted (or has failed).
pub async fn spawn_title_generation(
    latch: &TitleLatch,
    model: Arc<dyn ModelClient>,
    db: Arc<Database>,
    title_model: String,
    thread_id: Uuid,
    first_message: String,
) -> JoinHandle<String> {
    let permit = latch.close().await;

    tokio::spawn(async move {
        let title = generate_title(model.as_ref(), title_model, &first_message).await;

        let title_for_db = title.clone();
        let stored = tokio::task::spawn_blocking(move || {
            db.with_conn(|conn| queries::update_thread_title(conn, &thread_id, &title_for_db))
        })
        .await;
        match stored {
            Ok(Ok(())) => debug!("Thread {} titled {:?}", thread_id, title),
            Ok(Err(e)) => warn!("Failed to store title for thread {}: {}", thread_id, e),
            Err(e) => warn!("spawn_blocking join error while storing title: {}", e),
        }

        drop(permit);
        title
    })
}

/// Ask the model for a title. Any failure yields an empty title.
pub async fn generate_title(model: &dyn ModelClient, title_model: String, first_message: &str) -> String {
    let request = GenerateRequest {
        model: title_model,
        system: TITLE_PROMPT.to_string(),
        temperature: 0.3,
        messages: vec![PromptMessage {
            role: Role::User,
            content: first_message.to_string(),
        }],
    };

    match tokio::time::timeout(TITLE_TIMEOUT, model.generate_text(request)).await {
        Ok(Ok(raw)) => clean_title(&raw),
        Ok(Err(e)) => {
            warn!("Title generation failed: {}", e);
            String::new()
        }
        Err(_) => {
            warn!("Title generation timed out after {}s", TITLE_TIMEOUT.as_secs());
            String::new()
        }
    }
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let trimmed = line
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(['.', '!', '?'])
        .trim();
    trimmed.chars().take(MAX_TITLE_CHARS).collect()
}
