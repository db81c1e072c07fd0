//! Fixtures shared by the unit tests in this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::oneshot;
use uuid::Uuid;

use parley_db::{Database, queries};
use parley_types::models::{Customer, Message, MessagePart, Role, Thread, Usage, UsageDelta};

use crate::model::{GenerateRequest, ModelClient, TextDeltaStream};

pub fn text(value: &str) -> Vec<MessagePart> {
    vec![MessagePart::Text { text: value.into() }]
}

/// An anonymous user with a thread id that may or may not exist yet.
pub struct Fixture {
    pub db: Arc<Database>,
    pub user_id: Uuid,
    pub thread_id: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Database::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        db.with_conn(|conn| queries::create_user(conn, &user_id, None, None, true))
            .unwrap();
        Self {
            db: Arc::new(db),
            user_id,
            thread_id: Uuid::new_v4(),
        }
    }

    pub fn create_thread(&self) {
        self.db
            .with_conn(|conn| queries::create_thread(conn, &self.thread_id, &self.user_id))
            .unwrap();
    }

    pub fn second_thread(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .with_conn(|conn| queries::create_thread(conn, &id, &self.user_id))
            .unwrap();
        id
    }

    pub fn other_user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .with_conn(|conn| queries::create_user(conn, &id, None, None, true))
            .unwrap();
        id
    }

    pub fn thread(&self) -> Option<Thread> {
        self.db
            .with_conn(|conn| queries::get_thread_by_id(conn, &self.thread_id))
            .unwrap()
    }

    pub fn history(&self) -> Vec<Message> {
        self.db
            .with_conn(|conn| queries::get_thread_message_history(conn, &self.thread_id))
            .unwrap()
    }

    pub fn usage(&self) -> Usage {
        self.db
            .with_conn(|conn| queries::get_usage_by_user_id(conn, &self.user_id))
            .unwrap()
            .unwrap()
    }

    pub fn charge(&self, credits: i64) {
        let delta = UsageDelta { credits, ..Default::default() };
        self.db
            .with_conn(|conn| queries::increment_usage(conn, &self.user_id, &delta))
            .unwrap();
    }

    pub fn subscribe(&self, ends_at: chrono::DateTime<chrono::Utc>) {
        let customer = Customer {
            user_id: self.user_id,
            customer_id: format!("cus_{}", self.user_id.simple()),
            subscription_ends_at: Some(ends_at),
        };
        self.db
            .with_conn(|conn| queries::upsert_customer(conn, &customer))
            .unwrap();
    }

    pub fn seed_message(&self, role: Role, body: &str) -> Uuid {
        self.seed_message_in(&self.thread_id, role, body)
    }

    pub fn seed_message_in(&self, thread_id: &Uuid, role: Role, body: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .with_conn(|conn| queries::create_message(conn, &id, thread_id, role, &text(body), None))
            .unwrap();
        id
    }
}

/// A `ModelClient` that plays back canned output.
pub struct ScriptedModel {
    title: Option<String>,
    title_gate: Mutex<Option<oneshot::Receiver<()>>>,
    deltas: Vec<String>,
    fail_on_start: bool,
    fail_after_deltas: bool,
    hang: bool,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    pub fn replying(deltas: &[&str], title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            title_gate: Mutex::new(None),
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_on_start: false,
            fail_after_deltas: false,
            hang: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            title: None,
            fail_on_start: true,
            ..Self::replying(&[], "")
        }
    }

    pub fn failing_mid_stream(deltas: &[&str]) -> Self {
        Self {
            fail_after_deltas: true,
            ..Self::replying(deltas, "Partial")
        }
    }

    /// Accepts the request and then never sends a delta.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::replying(&[], "Never")
        }
    }

    /// Title generation blocks until the returned sender fires.
    pub fn gated_title(title: &str) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let model = Self::replying(&[], title);
        *model.title_gate.lock().unwrap() = Some(rx);
        (model, tx)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate_text(&self, request: GenerateRequest) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push(request);
        let gate = self.title_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.title.clone().ok_or_else(|| anyhow::anyhow!("title model unavailable"))
    }

    async fn stream_text(&self, request: GenerateRequest) -> anyhow::Result<TextDeltaStream> {
        self.requests.lock().unwrap().push(request);
        if self.fail_on_start {
            anyhow::bail!("model unavailable");
        }
        if self.hang {
            return Ok(Box::pin(stream::pending()));
        }

        let mut items: Vec<anyhow::Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
        if self.fail_after_deltas {
            items.push(Err(anyhow::anyhow!("connection reset")));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}
