//! End-to-end pipeline scenarios
//!
//! Drives the coordinator through the public API with a scripted
//! processing client, covering recording, both injection modes, recursion
//! prevention, expiry, and degraded classification.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use memori::config::MemoriConfig;
use memori::intercept::{ChatClient, ChatMessage, ChatResponse};
use memori::{
    Memori, MemoriError, ProcessingClient, Result, RuleBasedClient, StructuredReply,
};

/// Replays canned structured replies in order; refuses once the script is
/// exhausted, which lands callers on their rule-based fallbacks.
struct ScriptedClient {
    replies: Mutex<VecDeque<StructuredReply>>,
}

impl ScriptedClient {
    fn new(replies: Vec<StructuredReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl ProcessingClient for ScriptedClient {
    async fn structured(
        &self,
        _system: &str,
        _user: &str,
        _schema: &serde_json::Value,
    ) -> Result<StructuredReply> {
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| StructuredReply::Refusal("script exhausted".to_string())))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Fake provider SDK that records the message lists it was dispatched.
#[derive(Clone, Default)]
struct EchoClient {
    dispatched: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

#[async_trait]
impl ChatClient for EchoClient {
    async fn complete(&self, messages: &[ChatMessage], model: &str) -> Result<ChatResponse> {
        self.dispatched.lock().push(messages.to_vec());
        Ok(ChatResponse {
            content: "Certainly.".to_string(),
            model: model.to_string(),
            tokens_used: 0,
        })
    }
}

fn classification_reply(
    category: &str,
    importance: f64,
    retention: &str,
    summary: &str,
    technologies: &[&str],
    labels: &[&str],
) -> StructuredReply {
    StructuredReply::Parsed(json!({
        "category": {"category": category, "confidence": 0.9, "reasoning": "test"},
        "alternate_categories": [],
        "entities": {
            "people": [], "technologies": technologies, "topics": [],
            "skills": [], "projects": [], "keywords": [],
        },
        "importance": {
            "importance_score": importance,
            "novelty_score": 0.6,
            "relevance_score": 0.7,
            "actionability_score": 0.5,
            "retention_type": retention,
            "reasoning": "test",
        },
        "summary": summary,
        "searchable_content": summary.to_lowercase(),
        "should_store": true,
        "conscious_labels": labels,
    }))
}

fn base_config(namespace: &str) -> MemoriConfig {
    let mut config = MemoriConfig::default();
    config.database.connection_string = ":memory:".to_string();
    config.memory.namespace = namespace.to_string();
    config.provider.api_key = None;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn single_turn_record_lands_in_long_term() {
    let client = ScriptedClient::new(vec![classification_reply(
        "preference",
        0.8,
        "long_term",
        "User uses Go and prefers table-driven tests",
        &["Go"],
        &["preference"],
    )]);

    let memori = Memori::new(base_config("ns1")).with_processing_client(client);
    memori.enable().await.unwrap();

    memori
        .record("I use Go and prefer table-driven tests", "Noted.", "m1", None)
        .await
        .unwrap();

    let stats = memori.get_memory_stats().unwrap();
    assert_eq!(stats.chat_count, 1);
    assert_eq!(stats.long_term_count, 1);
    assert_eq!(stats.short_term_count, 0);
    assert_eq!(stats.category_counts.get("preference"), Some(&1));
    assert!(stats.avg_importance.unwrap() >= 0.5);
    assert!(stats.entity_count >= 1);

    // entity search finds it by the technology name
    let hits = memori.retrieve_context("Go", Some(5)).unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].summary.contains("table-driven"));

    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_mode_injects_ranked_context() {
    let client = ScriptedClient::new(vec![
        classification_reply(
            "context",
            0.8,
            "long_term",
            "Go project uses table-driven tests",
            &["Go"],
            &[],
        ),
        classification_reply(
            "preference",
            0.6,
            "long_term",
            "Prefers pytest for Python work",
            &["pytest"],
            &[],
        ),
    ]);

    let mut config = base_config("ns-auto");
    config.modes.auto_ingest = true;
    let memori = Memori::new(config).with_processing_client(client);
    memori.enable().await.unwrap();

    memori
        .record("Our Go project uses table-driven tests", "Good approach.", "m1", None)
        .await
        .unwrap();
    memori
        .record("I prefer pytest", "Understood.", "m1", None)
        .await
        .unwrap();

    let echo = EchoClient::default();
    let wrapped = memori.interceptor().unwrap().wrap(echo.clone());

    wrapped
        .complete(&[ChatMessage::user("Help me add tests")], "m1")
        .await
        .unwrap();

    let dispatched = echo.dispatched.lock();
    let messages = &dispatched[0];
    // a context prefix was attached as a new first message
    assert!(messages[0].content.contains("Relevant prior context:"));
    assert!(messages[0].content.contains("table-driven tests"));
    let go_pos = messages[0].content.find("table-driven tests").unwrap();
    if let Some(pytest_pos) = messages[0].content.find("pytest") {
        assert!(go_pos < pytest_pos, "tests memory should rank first");
    }
    // the caller's message survives untouched at the end
    assert_eq!(messages.last().unwrap().content, "Help me add tests");
    drop(dispatched);

    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn conscious_priming_injects_exactly_once() {
    let client = ScriptedClient::new(vec![
        classification_reply(
            "fact",
            0.9,
            "long_term",
            "User's name is Dana, lead on the billing service",
            &[],
            &["user_identity"],
        ),
        classification_reply(
            "preference",
            0.8,
            "long_term",
            "Prefers concise answers",
            &[],
            &["preference"],
        ),
        classification_reply(
            "skill",
            0.7,
            "long_term",
            "Fluent in Rust and SQL",
            &["Rust"],
            &["skill"],
        ),
    ]);

    let mut config = base_config("ns-conscious");
    config.modes.conscious_ingest = true;
    config.modes.analysis_interval_hours = 0;
    let memori = Memori::new(config).with_processing_client(client);
    memori.enable().await.unwrap();

    memori.record("My name is Dana, I lead the billing service", "Hi Dana!", "m1", None).await.unwrap();
    memori.record("Keep answers concise please", "Will do.", "m1", None).await.unwrap();
    memori.record("I'm fluent in Rust and SQL", "Great.", "m1", None).await.unwrap();

    let promoted = memori.trigger_conscious_analysis().unwrap();
    assert_eq!(promoted, 3);

    let essentials = memori.get_essential_conversations(None).unwrap();
    assert_eq!(essentials.len(), 3);

    let echo = EchoClient::default();
    let wrapped = memori.interceptor().unwrap().wrap(echo.clone());

    wrapped.complete(&[ChatMessage::user("First question")], "m1").await.unwrap();
    wrapped.complete(&[ChatMessage::user("Second question")], "m1").await.unwrap();

    let dispatched = echo.dispatched.lock();
    assert!(dispatched[0][0].content.contains("Known context about this user:"));
    assert!(dispatched[0][0].content.contains("Dana"));
    // second call carries no working-set block
    assert!(!dispatched[1]
        .iter()
        .any(|m| m.content.contains("Known context about this user:")));
    drop(dispatched);

    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn conscious_analysis_is_idempotent() {
    let client = ScriptedClient::new(vec![classification_reply(
        "fact",
        0.9,
        "long_term",
        "Works at Acme on the payments team",
        &[],
        &["user_identity"],
    )]);

    let mut config = base_config("ns-idem");
    config.modes.conscious_ingest = true;
    config.modes.analysis_interval_hours = 0;
    let memori = Memori::new(config).with_processing_client(client);
    memori.enable().await.unwrap();

    memori.record("I work at Acme on payments", "Noted.", "m1", None).await.unwrap();

    memori.trigger_conscious_analysis().unwrap();
    let first = memori.get_essential_conversations(None).unwrap();
    memori.trigger_conscious_analysis().unwrap();
    let second = memori.get_essential_conversations(None).unwrap();

    // re-promotion reconciles by source id instead of duplicating
    assert_eq!(first, second);
    assert_eq!(second.len(), 1);

    memori.disable().await;
}

/// Stand-in for an SDK whose planner call would itself pass back through
/// the interceptor hooks: when asked for a plan it fires `on_response`
/// exactly as a hooked library would.
struct ReenteringPlannerClient {
    memori: Mutex<Option<Arc<Memori>>>,
}

#[async_trait]
impl ProcessingClient for ReenteringPlannerClient {
    async fn structured(
        &self,
        system: &str,
        _user: &str,
        _schema: &serde_json::Value,
    ) -> Result<StructuredReply> {
        // only the planning call simulates SDK hook re-entry; the
        // classification call from the capture worker stays plain
        let memori = if system.contains("search plan") {
            self.memori.lock().clone()
        } else {
            None
        };
        if let Some(memori) = memori {
            if let Ok(interceptor) = memori.interceptor() {
                let callbacks = interceptor.callbacks();
                let planner_messages = vec![ChatMessage::user("internal planning prompt")];
                let response = ChatResponse {
                    content: "{\"search_terms\":[]}".to_string(),
                    model: "planner".to_string(),
                    tokens_used: 0,
                };
                // would create a chat row if recursion prevention failed
                callbacks.on_response(&planner_messages, &response);
            }
        }
        Ok(StructuredReply::Refusal("no plan".to_string()))
    }

    fn name(&self) -> &'static str {
        "reentering"
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn planner_calls_are_never_recorded() {
    let client = Arc::new(ReenteringPlannerClient {
        memori: Mutex::new(None),
    });

    let mut config = base_config("ns-recursion2");
    config.modes.auto_ingest = true;
    let memori = Arc::new(Memori::new(config).with_processing_client(client.clone()));
    memori.enable().await.unwrap();
    *client.memori.lock() = Some(memori.clone());

    let echo = EchoClient::default();
    let wrapped = memori.interceptor().unwrap().wrap(echo.clone());
    wrapped
        .complete(&[ChatMessage::user("What did we decide about Go testing?")], "m1")
        .await
        .unwrap();

    // wait for the single queued capture to land
    for _ in 0..50 {
        let stats = memori.get_memory_stats().unwrap();
        if stats.chat_count >= 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let stats = memori.get_memory_stats().unwrap();
    assert_eq!(stats.chat_count, 1, "planner call must not be recorded");

    *client.memori.lock() = None;
    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expiry_sweep_removes_rows_and_search_entries() {
    use chrono::{Duration, Utc};
    use memori::types::{
        MemoryRow, ProcessedMemory, RetentionType, SearchQuery,
    };

    let store = memori::Store::open_in_memory().unwrap();

    let mut processed = ProcessedMemory::default();
    processed.summary = "temporary note about kafka tuning".to_string();
    processed.searchable_content = "temporary note about kafka tuning".to_string();
    processed.should_store = true;
    processed.importance.retention_type = RetentionType::ShortTerm;

    let now = Utc::now();
    let mut row = MemoryRow::from_processed(
        "exp-1".to_string(),
        None,
        processed,
        "default",
        now,
    );
    row.expires_at = Some(now - Duration::seconds(1));
    store.put_memory(&row, &[]).unwrap();

    let query = SearchQuery::new("kafka", "default");
    assert_eq!(store.search_fts(&query).unwrap().len(), 1);

    let removed = store.expire_short_term(now).unwrap();
    assert_eq!(removed, 1);

    assert!(store.list_short_term("default", 10).unwrap().is_empty());
    // the FTS trigger removed the mirror entry with the row
    assert!(store.search_fts(&query).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_classifier_still_records() {
    let memori =
        Memori::new(base_config("ns-degraded")).with_processing_client(Arc::new(RuleBasedClient));
    memori.enable().await.unwrap();

    memori
        .record(
            "We deploy with Terraform to AWS every Friday",
            "That cadence sounds reasonable.",
            "m1",
            None,
        )
        .await
        .unwrap();

    let stats = memori.get_memory_stats().unwrap();
    assert_eq!(stats.chat_count, 1);
    assert_eq!(stats.short_term_count, 1);
    assert_eq!(stats.long_term_count, 0);
    assert_eq!(stats.category_counts.get("context"), Some(&1));
    assert_eq!(stats.fallback_classifications, 1);

    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn namespaces_are_isolated() {
    let memori_a =
        Memori::new(base_config("tenant-a")).with_processing_client(Arc::new(RuleBasedClient));
    memori_a.enable().await.unwrap();
    memori_a
        .record("Tenant A uses PostgreSQL for everything", "Noted.", "m1", None)
        .await
        .unwrap();

    // same process, separate namespace over a separate store
    let memori_b =
        Memori::new(base_config("tenant-b")).with_processing_client(Arc::new(RuleBasedClient));
    memori_b.enable().await.unwrap();

    assert_eq!(memori_b.get_memory_stats().unwrap().chat_count, 0);
    assert!(memori_b.retrieve_context("PostgreSQL", None).unwrap().is_empty());

    memori_a.disable().await;
    memori_b.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disable_then_enable_preserves_state() {
    use tempfile::tempdir;

    let dir = tempdir().unwrap();
    let path = dir.path().join("memori.db");
    let mut config = base_config("ns-cycle");
    config.database.connection_string = path.to_str().unwrap().to_string();

    let memori = Memori::new(config.clone()).with_processing_client(Arc::new(RuleBasedClient));
    memori.enable().await.unwrap();
    memori
        .record("I use Go and prefer table-driven tests", "Noted.", "m1", None)
        .await
        .unwrap();
    memori.disable().await;

    let memori = Memori::new(config).with_processing_client(Arc::new(RuleBasedClient));
    memori.enable().await.unwrap();
    let stats = memori.get_memory_stats().unwrap();
    assert_eq!(stats.chat_count, 1);
    assert_eq!(stats.short_term_count, 1);
    memori.disable().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn public_methods_error_when_disabled() {
    let memori = Memori::new(base_config("ns-off"));
    assert!(matches!(
        memori.retrieve_context("anything", None),
        Err(MemoriError::NotEnabled)
    ));
    assert!(matches!(
        memori.get_memory_stats(),
        Err(MemoriError::NotEnabled)
    ));
    assert!(matches!(
        memori.trigger_conscious_analysis(),
        Err(MemoriError::NotEnabled)
    ));
}
