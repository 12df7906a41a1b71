//! Bounded capture queue and persistence worker
//!
//! The interceptor's hot path only enqueues; classification and storage run
//! on a dedicated worker task. A full queue drops the persistence step with
//! a counter bump and never delays the caller's LLM call. Closing the queue
//! lets the worker drain remaining jobs before exiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::processing::Classifier;
use crate::storage::Store;
use crate::types::{
    ChatId, ChatRecord, EntityIndexRow, MemoryKind, MemoryRow, SearchQuery, UserContext,
};

/// Default capture queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One captured exchange awaiting classification and persistence.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub user_input: String,
    pub ai_output: String,
    pub model: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub captured_at: DateTime<Utc>,
}

/// Bounded queue between the interceptor and the persistence worker.
#[derive(Clone)]
pub struct CaptureQueue {
    sender: Sender<CaptureJob>,
    receiver: Receiver<CaptureJob>,
    dropped: Arc<AtomicU64>,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking. On a full queue the job is dropped with a
    /// warning; the caller's call path is never delayed.
    pub fn enqueue(&self, job: CaptureJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, "capture queue full, persistence dropped");
                false
            }
        }
    }

    /// Stop accepting jobs; the worker drains what is already queued.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    fn receiver(&self) -> Receiver<CaptureJob> {
        self.receiver.clone()
    }
}

/// Run one exchange through the write pipeline: chat history, then
/// classification, then the memory tables when the classifier says so.
pub async fn persist_exchange(
    store: &Store,
    classifier: &Classifier,
    namespace: &str,
    session_id: &str,
    user_context: &UserContext,
    job: CaptureJob,
) -> Result<ChatId> {
    let chat_id = Uuid::new_v4().to_string();
    let record = ChatRecord {
        chat_id: chat_id.clone(),
        user_input: job.user_input.clone(),
        ai_output: job.ai_output.clone(),
        model: job.model.clone(),
        timestamp: job.captured_at,
        session_id: session_id.to_string(),
        namespace: namespace.to_string(),
        tokens_used: job
            .metadata
            .get("tokens_used")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        metadata: job.metadata.clone(),
    };
    store.put_chat(&record)?;

    let processed = classifier
        .classify(&job.user_input, &job.ai_output, &job.model, user_context)
        .await;

    if !processed.should_store {
        debug!(chat_id = %chat_id, "classifier marked exchange as not stored");
        return Ok(chat_id);
    }

    let now = Utc::now();
    let memory_id = Uuid::new_v4().to_string();
    let entity_relevance = processed.importance.relevance_score.max(0.5);
    let row = MemoryRow::from_processed(
        memory_id.clone(),
        Some(chat_id.clone()),
        processed,
        namespace,
        now,
    );
    let entities: Vec<EntityIndexRow> = row
        .processed_data
        .entities
        .iter_typed()
        .map(|(entity_type, value)| EntityIndexRow {
            memory_id: memory_id.clone(),
            memory_kind: row.kind(),
            entity_type,
            entity_value: value.to_string(),
            relevance_score: entity_relevance,
            namespace: namespace.to_string(),
            created_at: now,
        })
        .collect();

    store.put_memory(&row, &entities)?;
    if row.kind() == MemoryKind::LongTerm {
        link_related(store, namespace, &row);
    }
    debug!(chat_id = %chat_id, memory_id = %memory_id, kind = row.kind().as_str(), "exchange persisted");
    Ok(chat_id)
}

/// Record relationship edges from a new long-term memory to prior memories
/// sharing its entities. Best-effort; failures only log.
fn link_related(store: &Store, namespace: &str, row: &MemoryRow) {
    let entity_text: Vec<&str> = row
        .processed_data
        .entities
        .iter_typed()
        .map(|(_, value)| value)
        .take(5)
        .collect();
    if entity_text.is_empty() {
        return;
    }

    let query = SearchQuery {
        text: entity_text.join(" "),
        namespace: namespace.to_string(),
        limit: 3,
        ..Default::default()
    };
    let candidates = match store.search_entities(&query) {
        Ok(candidates) => candidates,
        Err(e) => {
            debug!(error = %e, "entity lookup for relationship linking failed");
            return;
        }
    };

    for candidate in candidates {
        if candidate.memory_id == row.memory_id {
            continue;
        }
        if let Err(e) = store.link_memories(
            namespace,
            &row.memory_id,
            &candidate.memory_id,
            "related_to",
            candidate.strategy_score.clamp(0.0, 1.0),
        ) {
            debug!(error = %e, "relationship insert failed");
        }
    }
}

/// Dedicated worker draining the capture queue in FIFO order.
pub struct CaptureWorker {
    store: Store,
    classifier: Arc<Classifier>,
    namespace: String,
    session_id: String,
    user_context: UserContext,
    receiver: Receiver<CaptureJob>,
}

impl CaptureWorker {
    pub fn new(
        store: Store,
        classifier: Arc<Classifier>,
        namespace: String,
        session_id: String,
        user_context: UserContext,
        queue: &CaptureQueue,
    ) -> Self {
        Self {
            store,
            classifier,
            namespace,
            session_id,
            user_context,
            receiver: queue.receiver(),
        }
    }

    /// Process jobs until the queue is closed and drained. Storage errors
    /// on a single exchange are logged and never stop the worker.
    pub async fn run(self) {
        let mut processed = 0u64;
        while let Ok(job) = self.receiver.recv().await {
            match persist_exchange(
                &self.store,
                &self.classifier,
                &self.namespace,
                &self.session_id,
                &self.user_context,
                job,
            )
            .await
            {
                Ok(_) => processed += 1,
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "fatal storage error, capture worker stopping");
                    break;
                }
                Err(e) => warn!(error = %e, "failed to persist captured exchange"),
            }
        }
        info!(processed, "capture worker drained and stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::RuleBasedClient;

    fn job(text: &str) -> CaptureJob {
        CaptureJob {
            user_input: text.to_string(),
            ai_output: "Understood, noted for later.".to_string(),
            model: "m1".to_string(),
            metadata: HashMap::new(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn full_queue_drops_with_counter() {
        let queue = CaptureQueue::new(2);
        assert!(queue.enqueue(job("one")));
        assert!(queue.enqueue(job("two")));
        assert!(!queue.enqueue(job("three")));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn worker_drains_after_close() {
        let store = Store::open_in_memory().unwrap();
        let classifier = Arc::new(Classifier::new(
            Arc::new(RuleBasedClient),
            Arc::new(AtomicU64::new(0)),
        ));
        let queue = CaptureQueue::new(8);

        queue.enqueue(job("I use Go and prefer table-driven tests"));
        queue.enqueue(job("Our deploy target is Kubernetes on AWS"));
        queue.close();

        let worker = CaptureWorker::new(
            store.clone(),
            classifier,
            "default".to_string(),
            "session-1".to_string(),
            UserContext::default(),
            &queue,
        );
        worker.run().await;

        let stats = store.stats("default").unwrap();
        assert_eq!(stats.chat_count, 2);
        // fallback classification stores short-term rows
        assert_eq!(stats.short_term_count, 2);
    }

    #[tokio::test]
    async fn pipeline_writes_chat_and_memory_atomically() {
        let store = Store::open_in_memory().unwrap();
        let classifier = Classifier::new(Arc::new(RuleBasedClient), Arc::new(AtomicU64::new(0)));

        let chat_id = persist_exchange(
            &store,
            &classifier,
            "default",
            "session-1",
            &UserContext::default(),
            job("I use Go and prefer table-driven tests"),
        )
        .await
        .unwrap();

        assert!(!chat_id.is_empty());
        let stats = store.stats("default").unwrap();
        assert_eq!(stats.chat_count, 1);
        assert_eq!(stats.short_term_count, 1);
        assert!(stats.entity_count > 0);
    }

    #[tokio::test]
    async fn tiny_exchange_skips_memory_tables() {
        let store = Store::open_in_memory().unwrap();
        let classifier = Classifier::new(Arc::new(RuleBasedClient), Arc::new(AtomicU64::new(0)));

        let mut tiny = job("hi");
        tiny.ai_output = "hey".to_string();
        persist_exchange(
            &store,
            &classifier,
            "default",
            "session-1",
            &UserContext::default(),
            tiny,
        )
        .await
        .unwrap();

        let stats = store.stats("default").unwrap();
        assert_eq!(stats.chat_count, 1);
        assert_eq!(stats.short_term_count, 0);
        assert_eq!(stats.long_term_count, 0);
    }
}
