//! Verifies that `#[instrument]` annotations produce the expected spans on
//! `MemoryBackend` operations and the retry helpers.

#![allow(clippy::expect_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tessera_storage::{MemoryBackend, RetryConfig, StorageBackend, with_retry_timeout};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (SpanCollector, Arc<Mutex<Vec<String>>>) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    (collector, spans)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_backend_operations_create_spans() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let backend = MemoryBackend::without_sweeper();
    backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(5)).await.expect("set");
    backend.compare_and_delete(b"k", b"v").await.expect("compare_and_delete");
    let _ = backend.get(b"k").await;

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["set_with_ttl", "compare_and_delete", "get"] {
        assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
    }
}

#[tokio::test]
async fn retry_helper_creates_span() {
    let (collector, spans) = collect();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let result =
        with_retry_timeout(&RetryConfig::default(), Duration::from_secs(1), None, "get", || async {
            Ok::<_, tessera_storage::StorageError>(())
        })
        .await;
    assert!(result.is_ok());

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "with_retry_timeout"),
        "expected a 'with_retry_timeout' span, got: {recorded:?}"
    );
}
