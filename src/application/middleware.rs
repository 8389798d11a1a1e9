//! Handler wrappers composed around a [`MessageHandler`].
//!
//! ```text
//! Instrumented<TimeLimited<CommandHandler>>
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{Instrument, info, info_span, warn};

use super::consumer::MessageHandler;
use super::dispatch::attempt_of;
use super::outcome::{DropReason, Outcome, RetryableError};
use crate::broker::Envelope;
use crate::domain::commands::CommandKind;

const METRIC_OUTCOME: &str = "vhub_pipeline_outcome_total";
const METRIC_HANDLE_MS: &str = "vhub_pipeline_handle_ms";

/// Wraps each delivery in a span, logs the outcome at the level its kind
/// calls for and records outcome and latency metrics.
pub struct Instrumented<H> {
    inner: H,
    primary_queue: String,
}

impl<H> Instrumented<H> {
    pub fn new(inner: H, primary_queue: impl Into<String>) -> Self {
        Self {
            inner,
            primary_queue: primary_queue.into(),
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Instrumented<H> {
    fn kind(&self) -> CommandKind {
        self.inner.kind()
    }

    async fn handle(&self, envelope: &Envelope) -> Outcome {
        let kind = self.kind().as_str();
        let attempt = attempt_of(envelope, &self.primary_queue);
        let span = info_span!(
            "handle_message",
            kind,
            message_id = %envelope.message_id,
            attempt,
            redelivered = envelope.redelivered,
        );

        let started_at = Instant::now();
        let outcome = self.inner.handle(envelope).instrument(span.clone()).await;
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        histogram!(METRIC_HANDLE_MS, "kind" => kind).record(elapsed_ms);
        counter!(METRIC_OUTCOME, "kind" => kind, "outcome" => outcome.label()).increment(1);

        span.in_scope(|| log_outcome(&outcome, elapsed_ms));
        outcome
    }
}

fn log_outcome(outcome: &Outcome, elapsed_ms: f64) {
    let label = outcome.label();
    match outcome {
        Outcome::Processed(effect) => info!(
            target = "vhub::application::middleware",
            outcome = label,
            effect = ?effect,
            elapsed_ms,
            "Command processed"
        ),
        Outcome::Dropped(reason @ (DropReason::Malformed(_) | DropReason::Poison(_))) => warn!(
            target = "vhub::application::middleware",
            outcome = label,
            reason = %reason.describe(),
            elapsed_ms,
            "Command dropped"
        ),
        Outcome::Dropped(reason) => info!(
            target = "vhub::application::middleware",
            outcome = label,
            reason = %reason.describe(),
            elapsed_ms,
            "Command dropped; referent missing"
        ),
        Outcome::Retryable(err) => warn!(
            target = "vhub::application::middleware",
            outcome = label,
            error = %err,
            elapsed_ms,
            "Command failed; eligible for retry"
        ),
    }
}

/// Turns processing that outlives `limit` into a retryable failure.
pub struct TimeLimited<H> {
    inner: H,
    limit: Duration,
}

impl<H> TimeLimited<H> {
    pub fn new(inner: H, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for TimeLimited<H> {
    fn kind(&self) -> CommandKind {
        self.inner.kind()
    }

    async fn handle(&self, envelope: &Envelope) -> Outcome {
        match tokio::time::timeout(self.limit, self.inner.handle(envelope)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Retryable(RetryableError::Timeout(self.limit)),
        }
    }
}
