//! Webhook processor
//!
//! Drives stored events through a handler with at-most-once side effects per
//! successful run. A worker must win the claim before the handler is invoked,
//! and the event is only marked processed after the handler returns `Ok`.
//! Handler errors are classified and reported in the outcome, never
//! re-thrown; only store failures surface as `Err`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::events::{WebhookEventRecord, WebhookEventStore};

/// A claim older than this is treated as abandoned by a crashed worker
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

/// Events handled concurrently by [`WebhookProcessor::process_batch`]
const BATCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient failure; the event goes back to the queue
    #[error("retryable: {0}")]
    Retryable(String),

    /// The event can never succeed; it is dead-lettered
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEventRecord) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    AlreadyProcessed,
    DeadLettered,
    ClaimedElsewhere,
    /// Our claim went stale and was taken over before the outcome was written
    ClaimLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    Skipped(SkipReason),
    FailedWillRetry(String),
    FailedPermanent(String),
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Processed => "processed",
            ProcessOutcome::Skipped(_) => "skipped",
            ProcessOutcome::FailedWillRetry(_) => "failed_will_retry",
            ProcessOutcome::FailedPermanent(_) => "failed_permanent",
        }
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Events whose store writes failed; they stay queued for the next run
    pub errors: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Processed => self.processed += 1,
            ProcessOutcome::Skipped(_) => self.skipped += 1,
            ProcessOutcome::FailedWillRetry(_) => self.retrying += 1,
            ProcessOutcome::FailedPermanent(_) => self.dead_lettered += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.retrying + self.dead_lettered + self.errors
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn WebhookEventStore>,
    max_attempts: i32,
    claim_timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn WebhookEventStore>, max_attempts: i32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            claim_timeout: CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn WebhookEventStore> {
        &self.store
    }

    /// Process a single stored event
    pub async fn process_event(
        &self,
        id: Uuid,
        handler: &dyn EventHandler,
    ) -> StoreResult<ProcessOutcome> {
        let Some(event) = self.store.claim_event(id, self.claim_timeout).await? else {
            let reason = self.skip_reason(id).await?;
            tracing::debug!(event_id = %id, reason = ?reason, "Skipping webhook event");
            return Ok(ProcessOutcome::Skipped(reason));
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = event.attempts,
            "Processing webhook event (claimed exclusive processing rights)"
        );

        match handler.handle(&event).await {
            Ok(()) => {
                if !self.store.mark_processed(event.id, event.attempts).await? {
                    // The claim went stale and another worker owns the event
                    // now; it will re-run the idempotent side effect
                    tracing::warn!(
                        event_id = %event.id,
                        attempt = event.attempts,
                        "Claim lost before the event could be marked processed"
                    );
                }
                Ok(ProcessOutcome::Processed)
            }
            Err(HandlerError::Retryable(message)) if event.attempts < self.max_attempts => {
                tracing::warn!(
                    event_id = %event.id,
                    attempt = event.attempts,
                    max_attempts = self.max_attempts,
                    error = %message,
                    "Webhook handler failed, event released for retry"
                );
                if !self
                    .store
                    .release_event(event.id, event.attempts, &message)
                    .await?
                {
                    return Ok(Self::claim_lost(&event));
                }
                Ok(ProcessOutcome::FailedWillRetry(message))
            }
            Err(err) => {
                let message = match err {
                    HandlerError::Retryable(message) => {
                        format!("gave up after {} attempts: {}", event.attempts, message)
                    }
                    HandlerError::Permanent(message) => message,
                };
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt = event.attempts,
                    error = %message,
                    "Webhook handler failed permanently, event dead-lettered"
                );
                if !self
                    .store
                    .mark_failed(event.id, event.attempts, &message)
                    .await?
                {
                    return Ok(Self::claim_lost(&event));
                }
                Ok(ProcessOutcome::FailedPermanent(message))
            }
        }
    }

    fn claim_lost(event: &WebhookEventRecord) -> ProcessOutcome {
        tracing::warn!(
            event_id = %event.id,
            attempt = event.attempts,
            "Claim lost before the failure could be recorded, leaving the event to its new owner"
        );
        ProcessOutcome::Skipped(SkipReason::ClaimLost)
    }

    async fn skip_reason(&self, id: Uuid) -> StoreResult<SkipReason> {
        Ok(match self.store.get_event(id).await? {
            None => SkipReason::NotFound,
            Some(event) if event.processed => SkipReason::AlreadyProcessed,
            Some(event) if event.is_dead_lettered() => SkipReason::DeadLettered,
            Some(_) => SkipReason::ClaimedElsewhere,
        })
    }

    /// Pull up to `limit` unprocessed events and process them concurrently
    pub async fn process_batch(
        &self,
        limit: i64,
        handler: &dyn EventHandler,
    ) -> StoreResult<BatchSummary> {
        let events = self.store.get_unprocessed_events(limit).await?;
        if events.is_empty() {
            return Ok(BatchSummary::default());
        }

        let results: Vec<StoreResult<ProcessOutcome>> = stream::iter(events)
            .map(|event| self.process_event(event.id, handler))
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for result in results {
            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to process webhook event in batch");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            skipped = summary.skipped,
            retrying = summary.retrying,
            dead_lettered = summary.dead_lettered,
            errors = summary.errors,
            "Webhook batch complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::{DuplicatePolicy, NewWebhookEvent};
    use crate::memory::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations and answers with a fixed result
    struct ScriptedHandler {
        calls: AtomicUsize,
        result: Result<(), HandlerError>,
    }

    impl ScriptedHandler {
        fn new(result: Result<(), HandlerError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, _event: &WebhookEventRecord) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    async fn setup(max_attempts: i32) -> (Arc<MemoryStore>, WebhookProcessor, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .create_event(
                NewWebhookEvent::new("payment", json!({ "data": { "id": "1" } })).data_id("1"),
                DuplicatePolicy::Replay,
            )
            .await
            .unwrap()
            .record()
            .id;
        let processor = WebhookProcessor::new(store.clone(), max_attempts);
        (store, processor, id)
    }

    #[tokio::test]
    async fn test_success_marks_processed() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        let handler = ScriptedHandler::new(Ok(()));

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Processed);
        let event = store.get_event(id).await.unwrap().unwrap();
        assert!(event.processed);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_processed_event_is_noop() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        let handler = ScriptedHandler::new(Ok(()));
        processor.process_event(id, &handler).await.unwrap();
        let before = store.get_event(id).await.unwrap();

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::AlreadyProcessed));
        assert_eq!(handler.calls(), 1);
        assert_eq!(store.get_event(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_absent_event_is_noop() {
        let (_store, processor, _id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        let handler = ScriptedHandler::new(Ok(()));

        let outcome = processor
            .process_event(Uuid::new_v4(), &handler)
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::NotFound));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_claimed_event_is_not_handled_twice() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        store.claim_event(id, CLAIM_TIMEOUT).await.unwrap();
        let handler = ScriptedHandler::new(Ok(()));

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::ClaimedElsewhere));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_recovered() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        store.claim_event(id, CLAIM_TIMEOUT).await.unwrap();
        let processor = processor.with_claim_timeout(Duration::ZERO);
        let handler = ScriptedHandler::new(Ok(()));

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Processed);
        assert_eq!(store.get_event(id).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_event_queued() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        let handler = ScriptedHandler::new(Err(HandlerError::Retryable("timeout".into())));

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::FailedWillRetry("timeout".into()));
        let event = store.get_event(id).await.unwrap().unwrap();
        assert!(!event.processed);
        assert!(event.claimed_at.is_none());
        assert_eq!(event.last_error.as_deref(), Some("timeout"));
        let queued = store.get_unprocessed_events(10).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        let handler = ScriptedHandler::new(Err(HandlerError::Permanent("unknown payment".into())));

        let outcome = processor.process_event(id, &handler).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::FailedPermanent("unknown payment".into())
        );
        let event = store.get_event(id).await.unwrap().unwrap();
        assert!(!event.processed);
        assert!(event.is_dead_lettered());
        assert!(store.get_unprocessed_events(10).await.unwrap().is_empty());

        let again = processor.process_event(id, &handler).await.unwrap();
        assert_eq!(again, ProcessOutcome::Skipped(SkipReason::DeadLettered));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let (store, processor, id) = setup(2).await;
        let handler = ScriptedHandler::new(Err(HandlerError::Retryable("5xx".into())));

        let first = processor.process_event(id, &handler).await.unwrap();
        let second = processor.process_event(id, &handler).await.unwrap();

        assert!(matches!(first, ProcessOutcome::FailedWillRetry(_)));
        assert!(matches!(second, ProcessOutcome::FailedPermanent(_)));
        assert!(store.get_event(id).await.unwrap().unwrap().is_dead_lettered());
    }

    #[tokio::test]
    async fn test_batch_summarises_outcomes() {
        let (store, processor, _id) = setup(DEFAULT_MAX_ATTEMPTS).await;
        for i in 0..4 {
            store
                .create_event(
                    NewWebhookEvent::new("payment", json!({ "n": i })),
                    DuplicatePolicy::Replay,
                )
                .await
                .unwrap();
        }
        let handler = ScriptedHandler::new(Ok(()));

        let summary = processor.process_batch(3, &handler).await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.total(), 3);
        assert_eq!(store.get_unprocessed_events(10).await.unwrap().len(), 2);

        let rest = processor.process_batch(10, &handler).await.unwrap();
        assert_eq!(rest.processed, 2);
        assert_eq!(processor.process_batch(10, &handler).await.unwrap().total(), 0);
    }

    /// Simulates a second worker taking over the stale claim mid-flight
    struct StolenClaimHandler {
        store: Arc<MemoryStore>,
        result: Result<(), HandlerError>,
    }

    #[async_trait]
    impl EventHandler for StolenClaimHandler {
        async fn handle(&self, event: &WebhookEventRecord) -> Result<(), HandlerError> {
            self.store
                .claim_event(event.id, Duration::ZERO)
                .await
                .unwrap()
                .expect("takeover claim");
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_lost_claim_does_not_release_new_owner() {
        for result in [
            Err(HandlerError::Retryable("timeout".into())),
            Err(HandlerError::Permanent("bad payload".into())),
        ] {
            let (store, processor, id) = setup(DEFAULT_MAX_ATTEMPTS).await;
            let handler = StolenClaimHandler {
                store: store.clone(),
                result,
            };

            let outcome = processor.process_event(id, &handler).await.unwrap();

            assert_eq!(outcome, ProcessOutcome::Skipped(SkipReason::ClaimLost));
            let event = store.get_event(id).await.unwrap().unwrap();
            assert_eq!(event.attempts, 2);
            assert!(event.claimed_at.is_some(), "new owner keeps its claim");
            assert!(!event.is_dead_lettered());
            assert!(event.last_error.is_none());

            // Nobody else can start while the new owner is working
            let other = ScriptedHandler::new(Ok(()));
            let again = processor.process_event(id, &other).await.unwrap();
            assert_eq!(again, ProcessOutcome::Skipped(SkipReason::ClaimedElsewhere));
            assert_eq!(other.calls(), 0);
        }
    }

    /// Delegates to a [`MemoryStore`] but fails every claim on one event
    struct BrokenClaimStore {
        inner: Arc<MemoryStore>,
        broken: Uuid,
    }

    #[async_trait]
    impl WebhookEventStore for BrokenClaimStore {
        async fn create_event(
            &self,
            input: NewWebhookEvent,
            policy: DuplicatePolicy,
        ) -> StoreResult<crate::events::CreatedEvent> {
            self.inner.create_event(input, policy).await
        }

        async fn get_unprocessed_events(&self, limit: i64) -> StoreResult<Vec<WebhookEventRecord>> {
            self.inner.get_unprocessed_events(limit).await
        }

        async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEventRecord>> {
            self.inner.get_event(id).await
        }

        async fn claim_event(
            &self,
            id: Uuid,
            stale_after: Duration,
        ) -> StoreResult<Option<WebhookEventRecord>> {
            if id == self.broken {
                return Err(StoreError::Conflict("connection reset".to_string()));
            }
            self.inner.claim_event(id, stale_after).await
        }

        async fn mark_processed(&self, id: Uuid, attempt: i32) -> StoreResult<bool> {
            self.inner.mark_processed(id, attempt).await
        }

        async fn release_event(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
            self.inner.release_event(id, attempt, error).await
        }

        async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
            self.inner.mark_failed(id, attempt, error).await
        }
    }

    #[tokio::test]
    async fn test_batch_counts_store_errors_and_keeps_going() {
        let (store, _processor, broken) = setup(DEFAULT_MAX_ATTEMPTS).await;
        for i in 0..3 {
            store
                .create_event(
                    NewWebhookEvent::new("payment", json!({ "n": i })),
                    DuplicatePolicy::Replay,
                )
                .await
                .unwrap();
        }
        let processor = WebhookProcessor::new(
            Arc::new(BrokenClaimStore {
                inner: store.clone(),
                broken,
            }),
            DEFAULT_MAX_ATTEMPTS,
        );
        let handler = ScriptedHandler::new(Ok(()));

        let summary = processor.process_batch(10, &handler).await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.total(), 4);
        assert_eq!(handler.calls(), 3);
        let queued = store.get_unprocessed_events(10).await.unwrap();
        assert_eq!(queued.iter().map(|e| e.id).collect::<Vec<_>>(), vec![broken]);
    }
}
