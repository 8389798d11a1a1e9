mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::Value;
use serial_test::serial;
use support::{CREATE_QUEUE, DLQ, POST_ID, Pipeline};
use vhub::application::repos::RepoError;
use vhub::application::workers::check_dead_letters;
use vhub::cache::{CacheError, CacheEvictor, CacheKey, CacheStore, Namespace};

struct UnreachableCache;

#[async_trait]
impl CacheStore for UnreachableCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Value>, CacheError> {
        Err(CacheError::unavailable("connection refused"))
    }

    async fn put(&self, _key: &CacheKey, _value: Value, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::unavailable("connection refused"))
    }

    async fn evict(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Err(CacheError::unavailable("connection refused"))
    }

    async fn evict_namespace(&self, _namespace: Namespace) -> Result<usize, CacheError> {
        Err(CacheError::unavailable("connection refused"))
    }
}

#[tokio::test(start_paused = true)]
#[serial]
async fn pipeline_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let mut pipeline = Pipeline::start().await;
    let alice = pipeline.volunteer("alice@example.com");
    let bob = pipeline.volunteer("bob@example.com");

    // Miss, then hit.
    pipeline.queries.post_by_id(POST_ID).await.expect("query");
    pipeline.queries.post_by_id(POST_ID).await.expect("query");

    let created = pipeline
        .producer
        .enqueue_create(alice, POST_ID, "")
        .await
        .expect("enqueue");
    pipeline.wait_acked(CREATE_QUEUE, &created.message_id).await;

    pipeline.store.fail_next(RepoError::Timeout);
    pipeline.store.fail_next(RepoError::Timeout);
    let doomed = pipeline
        .producer
        .enqueue_create(bob, POST_ID, "")
        .await
        .expect("enqueue");
    pipeline.wait_acked(CREATE_QUEUE, &doomed.message_id).await;

    let depth = check_dead_letters(&pipeline.broker, DLQ)
        .await
        .expect("queue depth");
    assert_eq!(depth, 1);

    CacheEvictor::new(Arc::new(UnreachableCache), true)
        .evict_key(&CacheKey::post_by_id(POST_ID))
        .await;

    pipeline.stop().await;

    let entries = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = entries
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "vhub_producer_publish_total",
        "vhub_pipeline_outcome_total",
        "vhub_pipeline_handle_ms",
        "vhub_pipeline_dead_letter_total",
        "vhub_dead_letter_queue_depth",
        "vhub_cache_hit_total",
        "vhub_cache_miss_total",
        "vhub_cache_evict_total",
        "vhub_cache_evict_failed_total",
        "vhub_cache_evict_ms",
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }

    let dead_letters: u64 = entries
        .iter()
        .filter(|(composite_key, _, _, _)| {
            composite_key.key().name() == "vhub_pipeline_dead_letter_total"
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .sum();
    assert_eq!(dead_letters, 1);

    let outcome_labels: HashSet<String> = entries
        .iter()
        .filter(|(composite_key, _, _, _)| {
            composite_key.key().name() == "vhub_pipeline_outcome_total"
        })
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(outcome_labels.contains("created"));
    assert!(outcome_labels.contains("retryable"));
}
