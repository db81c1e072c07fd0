use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{StreamStore, StreamSupplier, TextStream};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream already registered: {0}")]
    Duplicate(String),

    #[error("registry at capacity ({0} streams)")]
    AtCapacity(usize),

    #[error("stream source already taken: {0}")]
    SourceTaken(String),
}

/// In-process store of live and recently finished streams.
///
/// Every chunk is buffered, so a subscriber that attaches late first gets the
/// replay and then follows the live tail.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    streams: RwLock<HashMap<String, Arc<StreamEntry>>>,
    max_streams: usize,
    /// How long a finished stream stays resumable
    retention: Duration,
}

struct StreamEntry {
    buffer: Mutex<Buffer>,
    /// Bumped after every change to `buffer`; subscribers wait on it.
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct Buffer {
    chunks: Vec<String>,
    finished_at: Option<Instant>,
}

impl StreamEntry {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            buffer: Mutex::new(Buffer::default()),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, chunk: String) {
        self.lock().chunks.push(chunk);
        self.version.send_modify(|v| *v += 1);
    }

    fn finish(&self) {
        self.lock().finished_at = Some(Instant::now());
        self.version.send_modify(|v| *v += 1);
    }

    /// Chunks from `cursor` onward, and whether the stream has ended.
    fn read_from(&self, cursor: usize) -> (Vec<String>, bool) {
        let buffer = self.lock();
        let pending = buffer.chunks.get(cursor..).map(<[String]>::to_vec).unwrap_or_default();
        (pending, buffer.finished_at.is_some())
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        self.lock()
            .finished_at
            .is_some_and(|finished| now.duration_since(finished) >= retention)
    }
}

impl StreamRegistry {
    pub fn new(max_streams: usize, retention: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                streams: RwLock::new(HashMap::new()),
                max_streams,
                retention,
            }),
        }
    }

    /// Register `stream_id`, spawn a task that drains `source` into the
    /// buffer, and return a subscriber positioned at the start.
    pub async fn register(&self, stream_id: &str, supplier: &StreamSupplier) -> Result<TextStream, RegistryError> {
        let entry = {
            let mut streams = self.inner.streams.write().await;

            if streams.contains_key(stream_id) {
                return Err(RegistryError::Duplicate(stream_id.to_string()));
            }
            if streams.len() >= self.inner.max_streams {
                let now = Instant::now();
                let retention = self.inner.retention;
                streams.retain(|_, entry| !entry.expired(retention, now));
                if streams.len() >= self.inner.max_streams {
                    return Err(RegistryError::AtCapacity(self.inner.max_streams));
                }
            }

            let mut source = supplier
                .take()
                .ok_or_else(|| RegistryError::SourceTaken(stream_id.to_string()))?;

            let entry = Arc::new(StreamEntry::new());
            streams.insert(stream_id.to_string(), entry.clone());

            let pump = entry.clone();
            let id = stream_id.to_string();
            tokio::spawn(async move {
                while let Some(chunk) = source.next().await {
                    pump.push(chunk);
                }
                pump.finish();
                debug!("Stream {} drained", id);
            });

            entry
        };

        info!("Registered resumable stream {}", stream_id);
        Ok(subscribe(entry))
    }

    /// Subscriber for an existing stream, or `None` if it is unknown or pruned.
    pub async fn resume(&self, stream_id: &str) -> Option<TextStream> {
        let entry = self.inner.streams.read().await.get(stream_id).cloned()?;
        Some(subscribe(entry))
    }

    pub async fn len(&self) -> usize {
        self.inner.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop finished streams older than the retention window. Returns how many
    /// were removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let retention = self.inner.retention;
        let mut streams = self.inner.streams.write().await;
        let before = streams.len();
        streams.retain(|_, entry| !entry.expired(retention, now));
        before - streams.len()
    }
}

#[async_trait]
impl StreamStore for StreamRegistry {
    async fn create_new_resumable_stream(
        &self,
        stream_id: &str,
        supplier: &StreamSupplier,
    ) -> anyhow::Result<TextStream> {
        Ok(self.register(stream_id, supplier).await?)
    }

    async fn resume_existing_stream(&self, stream_id: &str) -> anyhow::Result<Option<TextStream>> {
        Ok(self.resume(stream_id).await)
    }
}

fn subscribe(entry: Arc<StreamEntry>) -> TextStream {
    let mut version = entry.version.subscribe();

    Box::pin(async_stream::stream! {
        let mut cursor = 0;
        loop {
            let (pending, finished) = entry.read_from(cursor);
            cursor += pending.len();
            for chunk in pending {
                yield chunk;
            }
            if finished {
                break;
            }
            // The entry owns the sender, so this only fails if it was torn down.
            if version.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Background task that prunes finished streams on an interval.
pub async fn run_prune_loop(registry: StreamRegistry, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let count = registry.prune().await;
        if count > 0 {
            info!("Pruned {} finished streams", count);
        }
        let live = registry.len().await;
        if live > registry.inner.max_streams / 2 {
            warn!("Stream registry is {}% full", live * 100 / registry.inner.max_streams.max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn chunks(items: &[&str]) -> TextStream {
        let owned: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        Box::pin(stream::iter(owned))
    }

    /// A source the test feeds by hand.
    fn channel_source() -> (mpsc::UnboundedSender<String>, TextStream) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let source = Box::pin(async_stream::stream! {
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
        });
        (tx, source)
    }

    #[tokio::test]
    async fn subscriber_receives_everything() {
        let registry = StreamRegistry::new(8, Duration::from_secs(60));
        let supplier = StreamSupplier::new(chunks(&["a", "b", "c"]));

        let out: Vec<String> = registry.register("s1", &supplier).await.unwrap().collect().await;
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_then_live_tail() {
        let registry = StreamRegistry::new(8, Duration::from_secs(60));
        let (tx, source) = channel_source();
        let supplier = StreamSupplier::new(source);

        let mut first = registry.register("s1", &supplier).await.unwrap();
        tx.send("one".into()).unwrap();
        assert_eq!(first.next().await.as_deref(), Some("one"));

        let mut resumed = registry.resume("s1").await.unwrap();
        assert_eq!(resumed.next().await.as_deref(), Some("one"));

        tx.send("two".into()).unwrap();
        drop(tx);
        assert_eq!(resumed.next().await.as_deref(), Some("two"));
        assert_eq!(resumed.next().await, None);
        assert_eq!(first.collect::<Vec<_>>().await, vec!["two"]);
    }

    #[tokio::test]
    async fn finished_stream_replays_in_full() {
        let registry = StreamRegistry::new(8, Duration::from_secs(60));
        let supplier = StreamSupplier::new(chunks(&["x", "y"]));
        let _ = registry.register("s1", &supplier).await.unwrap().collect::<Vec<_>>().await;

        let replay: Vec<String> = registry.resume("s1").await.unwrap().collect().await;
        assert_eq!(replay, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn unknown_stream_is_none() {
        let registry = StreamRegistry::new(8, Duration::from_secs(60));
        assert!(registry.resume("missing").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_taking_source() {
        let registry = StreamRegistry::new(8, Duration::from_secs(60));
        registry.register("s1", &StreamSupplier::new(chunks(&["a"]))).await.unwrap();

        let supplier = StreamSupplier::new(chunks(&["b"]));
        let err = registry.register("s1", &supplier).await.err().unwrap();
        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert!(supplier.take().is_some());
    }

    #[tokio::test]
    async fn capacity_is_enforced_for_live_streams() {
        let registry = StreamRegistry::new(1, Duration::from_secs(60));
        let (_tx, source) = channel_source();
        registry.register("live", &StreamSupplier::new(source)).await.unwrap();

        let err = registry.register("next", &StreamSupplier::new(chunks(&["a"]))).await.err().unwrap();
        assert!(matches!(err, RegistryError::AtCapacity(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_expired_streams_only() {
        let registry = StreamRegistry::new(8, Duration::from_secs(30));
        let _ = registry
            .register("done", &StreamSupplier::new(chunks(&["a"])))
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        let (_tx, source) = channel_source();
        registry.register("live", &StreamSupplier::new(source)).await.unwrap();

        assert_eq!(registry.prune().await, 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.prune().await, 1);
        assert!(registry.resume("done").await.is_none());
        assert!(registry.resume("live").await.is_some());
    }
}
