//! Resumable response streams.
//!
//! A [`StreamStore`] keeps a named stream alive on the server so a client that
//! disconnects can reattach and continue receiving. The functions in
//! [`bridge`] wrap store calls with bounded retries and degrade instead of
//! failing the request.

pub mod bridge;
pub mod registry;
pub mod retry;

use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::Stream;

pub use bridge::{create_resumable_stream, get_resumable_stream};
pub use registry::{RegistryError, StreamRegistry};
pub use retry::RetryPolicy;

/// A stream of serialized text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Register `stream_id` and start draining the supplier's stream into it.
    /// The store only takes the source once registration has succeeded.
    async fn create_new_resumable_stream(
        &self,
        stream_id: &str,
        supplier: &StreamSupplier,
    ) -> anyhow::Result<TextStream>;

    /// `Ok(None)` when no stream is registered under `stream_id`.
    async fn resume_existing_stream(&self, stream_id: &str) -> anyhow::Result<Option<TextStream>>;
}

/// Hands the underlying stream to whoever takes it first: the store on a
/// successful registration, or the caller falling back to direct delivery.
pub struct StreamSupplier {
    source: Mutex<Option<TextStream>>,
}

impl StreamSupplier {
    pub fn new(source: TextStream) -> Self {
        Self {
            source: Mutex::new(Some(source)),
        }
    }

    pub fn take(&self) -> Option<TextStream> {
        match self.source.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
