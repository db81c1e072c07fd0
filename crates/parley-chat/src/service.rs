use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::{Database, queries};
use parley_streams::{RetryPolicy, StreamStore, TextStream, create_resumable_stream, get_resumable_stream};
use parley_types::api::ChatRequest;
use parley_types::events::ChatStreamEvent;
use parley_types::models::{MessagePart, UsageDelta};

use crate::context::{self, PrepareRequest, ThreadContext};
use crate::error::ChatError;
use crate::limits::LimitsConfig;
use crate::model::{GenerateRequest, ModelClient};
use crate::prompt::{prompt_messages, system_prompt};
use crate::title::{TitleLatch, spawn_title_generation};

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub title_model: String,
    pub limits: LimitsConfig,
    pub retry: RetryPolicy,
    /// Longest wait for the model's first delta and between deltas.
    pub idle_timeout: Duration,
    /// Longest wait for the title before completing without one.
    pub title_wait: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            title_model: "gpt-4o-mini".into(),
            limits: LimitsConfig::default(),
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(60),
            title_wait: Duration::from_secs(30),
        }
    }
}

/// Runs chat requests end to end: preparation, charging, generation,
/// persistence and stream registration.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    model: Arc<dyn ModelClient>,
    streams: Arc<dyn StreamStore>,
    config: ChatConfig,
}

/// Charge `delta` to the user. Returns what was actually charged, which is
/// nothing when the write failed, so a later refund cannot undercount usage.
async fn charge_usage(db: &Arc<Database>, user_id: Uuid, delta: UsageDelta) -> UsageDelta {
    let db = db.clone();
    let charge = tokio::task::spawn_blocking(move || {
        db.with_conn(|conn| queries::increment_usage(conn, &user_id, &delta))
    })
    .await;
    match charge {
        Ok(Ok(())) => delta,
        Ok(Err(e)) => {
            warn!("Failed to charge usage for {}: {}", user_id, e);
            UsageDelta::default()
        }
        Err(e) => {
            warn!("spawn_blocking join error while charging usage: {}", e);
            UsageDelta::default()
        }
    }
}

/// State carried from preparation into the response stream.
struct ChatRun {
    db: Arc<Database>,
    model: Arc<dyn ModelClient>,
    ctx: ThreadContext,
    user_id: Uuid,
    stream_id: String,
    reply_id: Uuid,
    charged: UsageDelta,
    title_latch: Option<TitleLatch>,
    idle_timeout: Duration,
    title_wait: Duration,
}

impl ChatService {
    pub fn new(
        db: Arc<Database>,
        model: Arc<dyn ModelClient>,
        streams: Arc<dyn StreamStore>,
        config: ChatConfig,
    ) -> Self {
        Self {
            db,
            model,
            streams,
            config,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.config.limits
    }

    /// Prepare the thread and start generating. The returned stream yields
    /// serialized [`ChatStreamEvent`]s and is resumable when the stream store
    /// accepted it.
    pub async fn start_chat(
        &self,
        user_id: Uuid,
        is_anonymous: bool,
        request: ChatRequest,
    ) -> Result<TextStream, ChatError> {
        let stream_id = Uuid::new_v4().to_string();
        let prepare = PrepareRequest {
            thread_id: request.thread_id,
            user_id,
            is_anonymous,
            message_id: request.message.id,
            parts: request.message.parts,
            model_id: request.model_id,
            stream_id: stream_id.clone(),
        };

        let db = self.db.clone();
        let limits = self.config.limits;
        let ctx =
            tokio::task::spawn_blocking(move || context::prepare_thread_context(&db, &prepare, &limits, Utc::now()))
                .await??;

        let charged = UsageDelta {
            credits: ctx.model.credits,
            search: i64::from(request.search),
            research: 0,
        };
        let charged = charge_usage(&self.db, user_id, charged).await;

        let title_latch = match (ctx.is_new_thread, ctx.messages.last()) {
            (true, Some(first)) => {
                let latch = TitleLatch::new();
                // Detached: completion waits on the latch, not the handle.
                let _ = spawn_title_generation(
                    &latch,
                    self.model.clone(),
                    self.db.clone(),
                    self.config.title_model.clone(),
                    ctx.thread.id,
                    first.text(),
                )
                .await;
                Some(latch)
            }
            _ => None,
        };

        info!("Starting stream {} on thread {} with {}", stream_id, ctx.thread.id, ctx.model.id);

        let run = ChatRun {
            db: self.db.clone(),
            model: self.model.clone(),
            ctx,
            user_id,
            stream_id: stream_id.clone(),
            reply_id: Uuid::new_v4(),
            charged,
            title_latch,
            idle_timeout: self.config.idle_timeout,
            title_wait: self.config.title_wait,
        };
        let source: TextStream = Box::pin(chat_events(run).map(|event| event.to_json()));

        Ok(create_resumable_stream(self.streams.as_ref(), &self.config.retry, &stream_id, source).await)
    }

    /// Reattach to the thread's live stream. `Ok(None)` when the store no
    /// longer has it; the thread is then handed back to `ready` so it does
    /// not stay locked by a stream nobody can finish.
    pub async fn resume_chat(&self, user_id: Uuid, thread_id: Uuid) -> Result<Option<TextStream>, ChatError> {
        let db = self.db.clone();
        let stream_id =
            tokio::task::spawn_blocking(move || context::validate_resume_context(&db, &thread_id, &user_id)).await??;

        debug!("Resuming stream {} on thread {}", stream_id, thread_id);
        let resumed = get_resumable_stream(self.streams.as_ref(), &self.config.retry, &stream_id).await;
        if resumed.is_none() {
            warn!("Stream {} for thread {} is gone, releasing the thread", stream_id, thread_id);
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || {
                context::abort_thread_stream(&db, &thread_id, &stream_id, &user_id, &UsageDelta::default())
            })
            .await??;
        }
        Ok(resumed)
    }
}

fn chat_events(run: ChatRun) -> impl Stream<Item = ChatStreamEvent> + Send {
    async_stream::stream! {
        let ChatRun { db, model, ctx, user_id, stream_id, reply_id, charged, title_latch, idle_timeout, title_wait } = run;
        let thread_id = ctx.thread.id;
        let mut release = ReleaseOnDrop::new(db.clone(), thread_id, stream_id.clone(), user_id);

        yield ChatStreamEvent::Start {
            thread_id,
            message_id: reply_id,
            stream_id: stream_id.clone(),
        };

        let request = GenerateRequest {
            model: ctx.model.provider_model.clone(),
            system: system_prompt(&ctx.settings, Utc::now()),
            temperature: ctx.settings.temperature,
            messages: prompt_messages(&ctx.messages),
        };

        let mut reply = String::new();
        let mut failure = None;
        match tokio::time::timeout(idle_timeout, model.stream_text(request)).await {
            Ok(Ok(mut deltas)) => loop {
                match tokio::time::timeout(idle_timeout, deltas.next()).await {
                    Ok(Some(Ok(text))) => {
                        reply.push_str(&text);
                        yield ChatStreamEvent::Delta { text };
                    }
                    Ok(Some(Err(e))) => {
                        failure = Some(e);
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        failure = Some(anyhow!("model stream stalled for {}s", idle_timeout.as_secs()));
                        break;
                    }
                }
            },
            Ok(Err(e)) => failure = Some(e),
            Err(_) => failure = Some(anyhow!("model did not answer within {}s", idle_timeout.as_secs())),
        }

        if let Some(e) = failure {
            warn!("Generation on thread {} failed: {}", thread_id, e);
            let aborted = {
                let db = db.clone();
                let stream_id = stream_id.clone();
                tokio::task::spawn_blocking(move || {
                    context::abort_thread_stream(&db, &thread_id, &stream_id, &user_id, &charged)
                })
                .await
            };
            match aborted {
                Ok(Ok(())) => release.disarm(),
                Ok(Err(e)) => error!("Failed to release thread {}: {}", thread_id, e),
                Err(e) => error!("spawn_blocking join error while releasing thread: {}", e),
            }
            yield ChatStreamEvent::Error { message: "generation failed".into() };
            return;
        }

        if let Some(latch) = &title_latch {
            if tokio::time::timeout(title_wait, latch.wait()).await.is_err() {
                warn!("Title for thread {} not ready after {}s, finishing without it", thread_id, title_wait.as_secs());
            }
        }

        let model_id = ctx.model.id.clone();
        let finished = {
            let db = db.clone();
            let stream_id = stream_id.clone();
            tokio::task::spawn_blocking(move || -> Result<(bool, String), ChatError> {
                let parts = vec![MessagePart::Text { text: reply }];
                let stored = context::complete_thread_stream(
                    &db,
                    &thread_id,
                    &stream_id,
                    Some((&reply_id, parts.as_slice(), model_id.as_str())),
                )?;
                let title = db
                    .with_conn(|conn| queries::get_thread_by_id(conn, &thread_id))?
                    .map(|t| t.title)
                    .unwrap_or_default();
                Ok((stored, title))
            })
            .await
            .map_err(ChatError::from)
            .and_then(|finished| finished)
        };

        match finished {
            Ok((false, _)) => {
                release.disarm();
                warn!("Stream {} lost thread {} before completing", stream_id, thread_id);
                yield ChatStreamEvent::Error { message: "stream was superseded".into() };
            }
            Ok((true, title)) => {
                release.disarm();
                if title_latch.is_some() && !title.is_empty() {
                    yield ChatStreamEvent::Title { title };
                }
                info!("Stream {} on thread {} finished", stream_id, thread_id);
                yield ChatStreamEvent::Finish { message_id: reply_id };
            }
            Err(e) => {
                error!("Failed to complete thread {}: {}", thread_id, e);
                yield ChatStreamEvent::Error { message: "failed to save reply".into() };
            }
        }
    }
}

/// Hands the thread back to `ready` if the response stream is dropped before
/// it reached a terminal event. No refund: the model may have run.
struct ReleaseOnDrop {
    db: Arc<Database>,
    thread_id: Uuid,
    stream_id: String,
    user_id: Uuid,
    armed: bool,
}

impl ReleaseOnDrop {
    fn new(db: Arc<Database>, thread_id: Uuid, stream_id: String, user_id: Uuid) -> Self {
        Self {
            db,
            thread_id,
            stream_id,
            user_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release thread {}", self.thread_id);
            return;
        };

        let db = self.db.clone();
        let thread_id = self.thread_id;
        let stream_id = std::mem::take(&mut self.stream_id);
        let user_id = self.user_id;
        handle.spawn_blocking(move || {
            debug!("Stream {} dropped early, releasing thread {}", stream_id, thread_id);
            if let Err(e) = context::abort_thread_stream(&db, &thread_id, &stream_id, &user_id, &UsageDelta::default()) {
                warn!("Failed to release thread {}: {}", thread_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_streams::StreamRegistry;
    use parley_types::api::ChatMessageInput;
    use parley_types::models::ThreadStatus;

    use crate::testing::{Fixture, ScriptedModel, text};

    fn service(fx: &Fixture, model: ScriptedModel) -> (ChatService, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let registry = StreamRegistry::new(16, Duration::from_secs(60));
        let service = ChatService::new(fx.db.clone(), model.clone(), Arc::new(registry), ChatConfig::default());
        (service, model)
    }

    fn chat_request(fx: &Fixture, model_id: &str, body: &str) -> ChatRequest {
        ChatRequest {
            thread_id: fx.thread_id,
            model_id: model_id.into(),
            message: ChatMessageInput {
                id: Uuid::new_v4(),
                parts: text(body),
            },
            search: false,
        }
    }

    async fn events(stream: TextStream) -> Vec<ChatStreamEvent> {
        stream
            .map(|json| serde_json::from_str::<ChatStreamEvent>(&json).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn new_thread_streams_reply_and_title() {
        let fx = Fixture::new();
        let (service, model) = service(&fx, ScriptedModel::replying(&["Hel", "lo"], "Greeting"));

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hi there"))
            .await
            .unwrap();
        let events = events(stream).await;

        assert!(matches!(events[0], ChatStreamEvent::Start { thread_id, .. } if thread_id == fx.thread_id));
        assert_eq!(events[1], ChatStreamEvent::Delta { text: "Hel".into() });
        assert_eq!(events[2], ChatStreamEvent::Delta { text: "lo".into() });
        assert_eq!(events[3], ChatStreamEvent::Title { title: "Greeting".into() });
        assert!(events[4].is_terminal());

        let thread = fx.thread().unwrap();
        assert_eq!(thread.status, ThreadStatus::Ready);
        assert!(thread.stream_id.is_none());
        let history = fx.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), "Hello");
        assert_eq!(fx.usage().credits, 1);

        let streamed = model
            .requests()
            .into_iter()
            .find(|r| r.system.contains("helpful assistant"))
            .unwrap();
        assert_eq!(streamed.model, "gpt-4o-mini");
        assert_eq!(streamed.messages[0].content, "hi there");
        assert!((streamed.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn existing_thread_gets_no_title_event() {
        let fx = Fixture::new();
        fx.create_thread();
        let (service, _) = service(&fx, ScriptedModel::replying(&["ok"], "Ignored"));

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "again"))
            .await
            .unwrap();
        let events = events(stream).await;

        assert_eq!(events.len(), 3);
        assert!(!events.iter().any(|e| matches!(e, ChatStreamEvent::Title { .. })));
    }

    #[tokio::test]
    async fn model_failure_refunds_and_releases() {
        let fx = Fixture::new();
        fx.create_thread();
        let (service, _) = service(&fx, ScriptedModel::failing());

        let mut request = chat_request(&fx, "gpt-4o", "hi");
        request.search = true;
        let stream = service.start_chat(fx.user_id, true, request).await.unwrap();
        let events = events(stream).await;

        assert!(matches!(events.last(), Some(ChatStreamEvent::Error { .. })));
        assert_eq!(fx.thread().unwrap().status, ThreadStatus::Ready);
        let usage = fx.usage();
        assert_eq!(usage.credits, 0);
        assert_eq!(usage.search, 0);
        // The user message stays; only the reply is missing.
        assert_eq!(fx.history().len(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_deltas() {
        let fx = Fixture::new();
        fx.create_thread();
        let (service, _) = service(&fx, ScriptedModel::failing_mid_stream(&["par", "tial"]));

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hi"))
            .await
            .unwrap();
        let events = events(stream).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(events[3], ChatStreamEvent::Error { .. }));
        assert_eq!(fx.usage().credits, 0);
        assert_eq!(fx.thread().unwrap().status, ThreadStatus::Ready);
    }

    #[tokio::test]
    async fn search_is_charged_on_success() {
        let fx = Fixture::new();
        let (service, _) = service(&fx, ScriptedModel::replying(&["found"], "Search"));

        let mut request = chat_request(&fx, "gpt-4o-mini", "look it up");
        request.search = true;
        let stream = service.start_chat(fx.user_id, true, request).await.unwrap();
        events(stream).await;

        let usage = fx.usage();
        assert_eq!(usage.credits, 1);
        assert_eq!(usage.search, 1);
    }

    #[tokio::test]
    async fn over_quota_is_rejected_before_streaming() {
        let fx = Fixture::new();
        fx.charge(8);
        let (service, model) = service(&fx, ScriptedModel::replying(&["no"], "No"));

        let err = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o", "hi"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(model.requests().is_empty());
        assert_eq!(fx.usage().credits, 8);
    }

    #[tokio::test]
    async fn resume_follows_a_live_stream() {
        let fx = Fixture::new();
        let (model, release) = ScriptedModel::gated_title("Later");
        let (service, _) = service(&fx, model);

        let first = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hi"))
            .await
            .unwrap();

        // Completion waits on the title latch, so the thread is still streaming.
        let second = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "again"))
            .await
            .err()
            .unwrap();
        assert!(matches!(second, ChatError::Conflict(_)));

        let resumed = service.resume_chat(fx.user_id, fx.thread_id).await.unwrap().unwrap();
        let stranger = service.resume_chat(fx.other_user(), fx.thread_id).await.err().unwrap();
        assert!(matches!(stranger, ChatError::Forbidden(_)));

        release.send(()).unwrap();
        let original = events(first).await;
        let replayed = events(resumed).await;

        assert_eq!(original, replayed);
        let ChatStreamEvent::Start { message_id, .. } = original[0] else {
            panic!("first event was not start");
        };
        assert_eq!(original.last(), Some(&ChatStreamEvent::Finish { message_id }));

        let done = service.resume_chat(fx.user_id, fx.thread_id).await.err().unwrap();
        assert!(matches!(done, ChatError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_model_times_out_and_refunds() {
        let fx = Fixture::new();
        fx.create_thread();
        let (service, _) = service(&fx, ScriptedModel::hanging());

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hello?"))
            .await
            .unwrap();
        let events = events(stream).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ChatStreamEvent::Error { .. }));
        assert_eq!(fx.thread().unwrap().status, ThreadStatus::Ready);
        assert_eq!(fx.usage().credits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_title_does_not_block_completion() {
        let fx = Fixture::new();
        let (model, _never_released) = ScriptedModel::gated_title("Too late");
        let (service, _) = service(&fx, model);

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hi"))
            .await
            .unwrap();
        let events = events(stream).await;

        assert!(matches!(events.last(), Some(ChatStreamEvent::Finish { .. })));
        assert!(!events.iter().any(|e| matches!(e, ChatStreamEvent::Title { .. })));
        assert_eq!(fx.thread().unwrap().status, ThreadStatus::Ready);
    }

    #[tokio::test]
    async fn superseded_stream_ends_with_error() {
        let fx = Fixture::new();
        let (model, release) = ScriptedModel::gated_title("Title");
        let (service, _) = service(&fx, model);

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "hi"))
            .await
            .unwrap();
        fx.db
            .with_conn(|conn| queries::update_thread(conn, &fx.thread_id, ThreadStatus::Streaming, Some("other")))
            .unwrap();
        release.send(()).unwrap();
        let events = events(stream).await;

        assert!(matches!(events.last(), Some(ChatStreamEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, ChatStreamEvent::Finish { .. })));
        let thread = fx.thread().unwrap();
        assert_eq!(thread.stream_id.as_deref(), Some("other"));
        assert_eq!(fx.history().len(), 1);
    }

    #[tokio::test]
    async fn resume_of_a_lost_stream_releases_the_thread() {
        let fx = Fixture::new();
        fx.create_thread();
        fx.db
            .with_conn(|conn| queries::update_thread(conn, &fx.thread_id, ThreadStatus::Streaming, Some("lost")))
            .unwrap();
        let (service, _) = service(&fx, ScriptedModel::replying(&["back"], "Unused"));

        let resumed = service.resume_chat(fx.user_id, fx.thread_id).await.unwrap();
        assert!(resumed.is_none());
        let thread = fx.thread().unwrap();
        assert_eq!(thread.status, ThreadStatus::Ready);
        assert!(thread.stream_id.is_none());

        let stream = service
            .start_chat(fx.user_id, true, chat_request(&fx, "gpt-4o-mini", "still there?"))
            .await
            .unwrap();
        assert!(matches!(events(stream).await.last(), Some(ChatStreamEvent::Finish { .. })));
    }

    #[tokio::test]
    async fn failed_charge_charges_nothing() {
        let fx = Fixture::new();
        let delta = UsageDelta { credits: 3, search: 1, research: 0 };

        assert_eq!(charge_usage(&fx.db, fx.user_id, delta).await, delta);
        assert_eq!(fx.usage().credits, 3);

        fx.db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE usage")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(charge_usage(&fx.db, fx.user_id, delta).await, UsageDelta::default());
    }

    #[tokio::test]
    async fn dropped_guard_releases_thread() {
        let fx = Fixture::new();
        fx.create_thread();
        let stream_id = "s-1".to_string();
        fx.db
            .with_conn(|conn| queries::update_thread(conn, &fx.thread_id, ThreadStatus::Streaming, Some(&stream_id)))
            .unwrap();

        drop(ReleaseOnDrop::new(fx.db.clone(), fx.thread_id, stream_id, fx.user_id));

        for _ in 0..100 {
            if !fx.thread().unwrap().is_streaming() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("thread was never released");
    }
}
