//! Coordinator: lifecycle, wiring, and the public API
//!
//! `Memori` owns the store, classifier, analyzer, planner, injector, and
//! interceptor lifetimes. State machine: configured → enabled → disabled;
//! `enable` is idempotent, `disable` from any other state is a no-op, and a
//! fatal store error transitions to disabled with the error recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{init_logging, MemoriConfig};
use crate::conscious::{AnalyzerConfig, ConsciousAnalyzer};
use crate::error::{MemoriError, Result};
use crate::inject::{ContextInjector, InjectorConfig, DEFAULT_TOKEN_BUDGET};
use crate::intercept::{
    persist_exchange, CaptureJob, CaptureQueue, CaptureWorker, InterceptModes, Interceptor,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::processing::{create_client, Classifier, ProcessingClient};
use crate::retrieval::RetrievalPlanner;
use crate::search;
use crate::storage::Store;
use crate::types::{ChatId, MemoryHit, MemoryStats, SearchQuery, UserContext};

/// Grace period for draining in-flight work on disable
const DISABLE_GRACE: Duration = Duration::from_secs(5);

/// Interval for the expiry pruner and retention sweep
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Configured,
    Enabled,
    Disabled,
}

struct EnabledParts {
    store: Store,
    classifier: Arc<Classifier>,
    interceptor: Interceptor,
    queue: CaptureQueue,
    analyzer: Arc<ConsciousAnalyzer>,
    worker_task: tokio::task::JoinHandle<()>,
    analyzer_task: Option<tokio::task::JoinHandle<()>>,
    maintenance_task: Option<tokio::task::JoinHandle<()>>,
    session_id: String,
}

struct Inner {
    lifecycle: Lifecycle,
    parts: Option<EnabledParts>,
    last_error: Option<String>,
}

/// Root object of the memory layer.
pub struct Memori {
    config: MemoriConfig,
    user_context: UserContext,
    client_override: Option<Arc<dyn ProcessingClient>>,
    fallback_count: Arc<AtomicU64>,
    inner: Mutex<Inner>,
}

impl Memori {
    /// Build a coordinator in the configured state.
    pub fn new(config: MemoriConfig) -> Self {
        Self {
            config,
            user_context: UserContext::default(),
            client_override: None,
            fallback_count: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Configured,
                parts: None,
                last_error: None,
            }),
        }
    }

    /// Build from the config search path and environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(MemoriConfig::load()?))
    }

    /// Supply caller context that biases classification.
    pub fn with_user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = user_context;
        self
    }

    /// Inject a concrete processing client instead of building one from
    /// the provider section.
    pub fn with_processing_client(mut self, client: Arc<dyn ProcessingClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().lifecycle == Lifecycle::Enabled
    }

    /// Last fatal error, if the coordinator was force-disabled.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Validate config, open the store, start the pipeline, and prime the
    /// session. Idempotent: enabling an enabled coordinator is a no-op.
    pub async fn enable(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }

        self.config.validate()?;
        init_logging(&self.config.logging)?;

        let namespace = self.config.memory.namespace.clone();
        let session_id = Uuid::new_v4().to_string();
        let store = Store::open(&self.config.database)?;

        if self.config.memory.auto_cleanup {
            run_maintenance(&store, &self.config, &namespace);
        }

        let client = match &self.client_override {
            Some(client) => client.clone(),
            None => create_client(&self.config.provider)?,
        };
        let classifier = Arc::new(Classifier::new(client.clone(), self.fallback_count.clone()));

        let queue = CaptureQueue::new(DEFAULT_QUEUE_CAPACITY);
        let worker = CaptureWorker::new(
            store.clone(),
            classifier.clone(),
            namespace.clone(),
            session_id.clone(),
            self.user_context.clone(),
            &queue,
        );
        let worker_task = tokio::spawn(worker.run());

        let analyzer = Arc::new(ConsciousAnalyzer::new(
            store.clone(),
            AnalyzerConfig {
                namespace: namespace.clone(),
                working_set_size: self.config.modes.working_set_size,
            },
        ));

        if self.config.modes.conscious_ingest {
            if let Err(e) = analyzer.analyze() {
                // degraded mode; the working set simply stays stale
                warn!(error = %e, "conscious analysis at enable failed");
            }
        }

        let analyzer_task = if self.config.modes.conscious_ingest
            && self.config.modes.analysis_interval_hours > 0
        {
            Some(
                analyzer
                    .clone()
                    .spawn_periodic(self.config.modes.analysis_interval_hours),
            )
        } else {
            None
        };

        let maintenance_task = if self.config.memory.auto_cleanup {
            Some(spawn_maintenance(
                store.clone(),
                self.config.clone(),
                namespace.clone(),
            ))
        } else {
            None
        };

        let planner = RetrievalPlanner::new(client, namespace.clone());
        let injector = ContextInjector::new(
            store.clone(),
            InjectorConfig {
                namespace: namespace.clone(),
                working_set_size: self.config.modes.working_set_size,
                token_budget: DEFAULT_TOKEN_BUDGET,
            },
        );
        injector.reset_session();

        let initial_memory_count = store
            .stats(&namespace)
            .map(|s| s.short_term_count + s.long_term_count)
            .unwrap_or(0);

        let interceptor = Interceptor::new(
            store.clone(),
            planner,
            injector,
            queue.clone(),
            InterceptModes {
                conscious: self.config.modes.conscious_ingest,
                auto: self.config.modes.auto_ingest,
            },
            namespace.clone(),
            self.config.memory.context_limit,
            initial_memory_count,
        );

        let mut inner = self.inner.lock();
        inner.parts = Some(EnabledParts {
            store,
            classifier,
            interceptor,
            queue,
            analyzer,
            worker_task,
            analyzer_task,
            maintenance_task,
            session_id,
        });
        inner.lifecycle = Lifecycle::Enabled;
        inner.last_error = None;
        info!(namespace = %namespace, "memori enabled");
        Ok(())
    }

    /// Stop capture, drain queued work within the grace period, stop the
    /// analyzer, and close the store. No-op unless enabled.
    pub async fn disable(&self) {
        let parts = {
            let mut inner = self.inner.lock();
            if inner.lifecycle != Lifecycle::Enabled {
                return;
            }
            inner.lifecycle = Lifecycle::Disabled;
            inner.parts.take()
        };

        let Some(mut parts) = parts else { return };

        parts.queue.close();
        if tokio::time::timeout(DISABLE_GRACE, &mut parts.worker_task)
            .await
            .is_err()
        {
            let remaining = parts.queue.len();
            parts.worker_task.abort();
            warn!(remaining, "disable grace period expired, discarding queued captures");
        }

        if let Some(task) = parts.analyzer_task {
            task.abort();
        }
        if let Some(task) = parts.maintenance_task {
            task.abort();
        }
        info!("memori disabled");
    }

    /// Manual recording path. Runs the full pipeline synchronously and
    /// surfaces storage errors, including conflicts, to the caller.
    pub async fn record(
        &self,
        user_input: &str,
        ai_output: &str,
        model: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<ChatId> {
        let (store, classifier, namespace, session_id) = self.pipeline_handles()?;

        let result = persist_exchange(
            &store,
            &classifier,
            &namespace,
            &session_id,
            &self.user_context,
            CaptureJob {
                user_input: user_input.to_string(),
                ai_output: ai_output.to_string(),
                model: model.to_string(),
                metadata: metadata.unwrap_or_default(),
                captured_at: Utc::now(),
            },
        )
        .await;

        if let Err(e) = &result {
            self.note_fatal(e);
        }
        result
    }

    /// Direct ranked search with no injection.
    pub fn retrieve_context(&self, query: &str, limit: Option<usize>) -> Result<Vec<MemoryHit>> {
        let inner = self.inner.lock();
        let parts = enabled_parts(&inner)?;
        let search_query = SearchQuery {
            limit: limit.unwrap_or(self.config.memory.context_limit),
            ..SearchQuery::new(query, self.config.memory.namespace.clone())
        };
        search::try_search(&parts.store, &search_query)
    }

    /// Manual analyzer run. Returns the number of promoted memories.
    pub fn trigger_conscious_analysis(&self) -> Result<usize> {
        let analyzer = {
            let inner = self.inner.lock();
            enabled_parts(&inner)?.analyzer.clone()
        };
        analyzer.analyze()
    }

    /// Summaries of the current working set.
    pub fn get_essential_conversations(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let parts = enabled_parts(&inner)?;
        let rows = parts.store.working_set(
            &self.config.memory.namespace,
            limit.unwrap_or(self.config.modes.working_set_size),
        )?;
        Ok(rows.into_iter().map(|row| row.summary).collect())
    }

    /// Row counts, category distribution, and degradation counters.
    pub fn get_memory_stats(&self) -> Result<MemoryStats> {
        let inner = self.inner.lock();
        let parts = enabled_parts(&inner)?;
        let mut stats = parts.store.stats(&self.config.memory.namespace)?;
        stats.queue_dropped = parts.queue.dropped_count();
        stats.fallback_classifications = self.fallback_count.load(Ordering::Relaxed);
        Ok(stats)
    }

    /// Interceptor handle for the callback and wrapped-client attachment
    /// strategies.
    pub fn interceptor(&self) -> Result<Interceptor> {
        let inner = self.inner.lock();
        Ok(enabled_parts(&inner)?.interceptor.clone())
    }

    /// Session identifier assigned at enable.
    pub fn session_id(&self) -> Result<String> {
        let inner = self.inner.lock();
        Ok(enabled_parts(&inner)?.session_id.clone())
    }

    fn pipeline_handles(&self) -> Result<(Store, Arc<Classifier>, String, String)> {
        let inner = self.inner.lock();
        let parts = enabled_parts(&inner)?;
        Ok((
            parts.store.clone(),
            parts.classifier.clone(),
            self.config.memory.namespace.clone(),
            parts.session_id.clone(),
        ))
    }

    /// Transition to disabled on fatal storage errors, keeping the message
    /// for operators.
    fn note_fatal(&self, error: &MemoriError) {
        if !error.is_fatal() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.lifecycle == Lifecycle::Enabled {
            warn!(error = %error, "fatal storage error, disabling");
            inner.lifecycle = Lifecycle::Disabled;
            inner.last_error = Some(error.to_string());
            if let Some(parts) = inner.parts.take() {
                parts.queue.close();
                if let Some(task) = parts.analyzer_task {
                    task.abort();
                }
                if let Some(task) = parts.maintenance_task {
                    task.abort();
                }
            }
        }
    }
}

fn enabled_parts(inner: &Inner) -> Result<&EnabledParts> {
    match (&inner.lifecycle, &inner.parts) {
        (Lifecycle::Enabled, Some(parts)) => Ok(parts),
        _ => Err(MemoriError::NotEnabled),
    }
}

fn run_maintenance(store: &Store, config: &MemoriConfig, namespace: &str) {
    let now = Utc::now();
    match store.expire_short_term(now) {
        Ok(0) => {}
        Ok(count) => info!(count, "expired short-term memories"),
        Err(e) => warn!(error = %e, "short-term expiry failed"),
    }
    if let Some(max_age) = config.memory.retention_policy.max_age_days() {
        let cutoff = now - chrono::Duration::days(max_age);
        match store.sweep_long_term(namespace, cutoff) {
            Ok(0) => {}
            Ok(count) => info!(count, "swept aged long-term memories"),
            Err(e) => warn!(error = %e, "long-term retention sweep failed"),
        }
    }
}

fn spawn_maintenance(
    store: Store,
    config: MemoriConfig,
    namespace: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = store.clone();
            let config = config.clone();
            let namespace = namespace.clone();
            let outcome =
                tokio::task::spawn_blocking(move || run_maintenance(&store, &config, &namespace))
                    .await;
            if let Err(e) = outcome {
                warn!(error = %e, "maintenance task panicked");
            }
        }
    })
}
