use futures_util::stream;
use tracing::warn;

use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::{StreamStore, StreamSupplier, TextStream};

/// Make `source` resumable under `stream_id`.
///
/// Registration is retried per `policy`. If every attempt fails the caller
/// gets `source` back unchanged: the response still streams, it just cannot
/// be resumed.
pub async fn create_resumable_stream(
    store: &dyn StreamStore,
    policy: &RetryPolicy,
    stream_id: &str,
    source: TextStream,
) -> TextStream {
    let supplier = StreamSupplier::new(source);

    let created = retry_with_backoff(policy, "create resumable stream", || {
        store.create_new_resumable_stream(stream_id, &supplier)
    })
    .await;

    match created {
        Ok(resumable) => resumable,
        Err(e) => {
            warn!("Stream {} is not resumable, serving it directly: {}", stream_id, e);
            // The store only takes the source on success, so it is still here.
            supplier.take().unwrap_or_else(|| Box::pin(stream::empty()))
        }
    }
}

/// Reattach to `stream_id`. `None` means there is nothing to resume, either
/// because the stream is unknown or because the store stayed unreachable.
pub async fn get_resumable_stream(
    store: &dyn StreamStore,
    policy: &RetryPolicy,
    stream_id: &str,
) -> Option<TextStream> {
    let resumed = retry_with_backoff(policy, "resume stream", || store.resume_existing_stream(stream_id)).await;

    match resumed {
        Ok(resumable) => resumable,
        Err(e) => {
            warn!("Could not resume stream {}: {}", stream_id, e);
            None
        }
    }
}
