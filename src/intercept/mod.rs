//! Interceptor surface
//!
//! Observes outbound requests and inbound responses from LLM client
//! libraries without caller changes, in preference order: native callback
//! registration (`ProviderCallbacks`), a drop-in wrapped client
//! (`RecordedClient`), and the coordinator's manual `record` entry point.
//! No strategy mutates host-library state; there is no patching of library
//! internals.

mod queue;

pub use queue::{
    persist_exchange, CaptureJob, CaptureQueue, CaptureWorker, DEFAULT_QUEUE_CAPACITY,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::inject::ContextInjector;
use crate::retrieval::{in_planner, RetrievalPlanner};
use crate::search;
use crate::storage::Store;
use crate::types::MemoryHit;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Response from an underlying provider client.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    /// 0 when the provider reports no usage
    pub tokens_used: u32,
}

/// The provider SDK surface the wrapped-client strategy delegates to.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], model: &str) -> Result<ChatResponse>;
}

/// Which ingestion modes drive injection on this interceptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterceptModes {
    pub conscious: bool,
    pub auto: bool,
}

struct InterceptorShared {
    store: Store,
    planner: RetrievalPlanner,
    injector: ContextInjector,
    queue: CaptureQueue,
    modes: InterceptModes,
    namespace: String,
    context_limit: usize,
    /// Approximate memory count for plan-cache bucketing
    memory_count: AtomicI64,
}

/// Observes calls, injects context before dispatch, and enqueues captured
/// exchanges after the response.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<InterceptorShared>,
}

impl Interceptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Store,
        planner: RetrievalPlanner,
        injector: ContextInjector,
        queue: CaptureQueue,
        modes: InterceptModes,
        namespace: String,
        context_limit: usize,
        initial_memory_count: i64,
    ) -> Self {
        Self {
            inner: Arc::new(InterceptorShared {
                store,
                planner,
                injector,
                queue,
                modes,
                namespace,
                context_limit,
                memory_count: AtomicI64::new(initial_memory_count),
            }),
        }
    }

    /// Native callback handle for libraries with an official hook registry.
    pub fn callbacks(&self) -> ProviderCallbacks {
        ProviderCallbacks {
            interceptor: self.clone(),
        }
    }

    /// Drop-in wrapper around a provider client.
    pub fn wrap<C: ChatClient>(&self, client: C) -> RecordedClient<C> {
        RecordedClient {
            client,
            interceptor: self.clone(),
        }
    }

    /// Build the outbound message list with injected context. The caller's
    /// list is never mutated; a new list is returned.
    pub async fn before_request(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if in_planner() {
            return messages.to_vec();
        }

        let inner = &self.inner;
        let user_input = last_user_content(messages);

        let auto_hits: Vec<MemoryHit> = if inner.modes.auto && !user_input.is_empty() {
            let plan = inner
                .planner
                .plan(&user_input, inner.memory_count.load(Ordering::Relaxed))
                .await;
            let query = plan.to_query(&inner.namespace, inner.context_limit);
            search::search(&inner.store, &query)
        } else {
            Vec::new()
        };

        let block = inner
            .injector
            .build_block(&auto_hits, inner.modes.conscious);

        match block {
            Some(text) => {
                let mut out = Vec::with_capacity(messages.len() + 1);
                out.push(ChatMessage::system(text));
                out.extend(messages.iter().cloned());
                out
            }
            None => messages.to_vec(),
        }
    }

    /// Capture one finished call. Extracts the last user turn and the final
    /// assistant text, then enqueues persistence. Calls made while the
    /// planner scope is active are skipped entirely.
    pub fn after_response(&self, messages: &[ChatMessage], response: &ChatResponse) {
        if in_planner() {
            debug!("planner-scoped call, capture skipped");
            return;
        }

        let user_input = last_user_content(messages);
        if user_input.is_empty() && response.content.is_empty() {
            return;
        }

        let mut metadata = HashMap::new();
        if response.tokens_used > 0 {
            metadata.insert(
                "tokens_used".to_string(),
                serde_json::Value::from(response.tokens_used),
            );
        }

        let accepted = self.inner.queue.enqueue(CaptureJob {
            user_input,
            ai_output: response.content.clone(),
            model: response.model.clone(),
            metadata,
            captured_at: Utc::now(),
        });
        if accepted {
            self.inner.memory_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.queue.dropped_count()
    }
}

/// Extract the last user turn from an outbound message list.
fn last_user_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Success/failure callbacks for libraries exposing an official hook
/// registry. The host calls `on_request` with the outbound messages and
/// `on_response` after completion; failures are simply not recorded.
#[derive(Clone)]
pub struct ProviderCallbacks {
    interceptor: Interceptor,
}

impl ProviderCallbacks {
    /// Hook to run before dispatch; returns the augmented message list.
    pub async fn on_request(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        self.interceptor.before_request(messages).await
    }

    /// Hook to run after a successful response.
    pub fn on_response(&self, messages: &[ChatMessage], response: &ChatResponse) {
        self.interceptor.after_response(messages, response);
    }

    /// Hook to run after a failed call. Nothing is recorded; the error
    /// belongs to the caller.
    pub fn on_failure(&self, _messages: &[ChatMessage]) {}
}

/// Drop-in client that injects context and records around the wrapped
/// provider call.
pub struct RecordedClient<C: ChatClient> {
    client: C,
    interceptor: Interceptor,
}

#[async_trait]
impl<C: ChatClient> ChatClient for RecordedClient<C> {
    async fn complete(&self, messages: &[ChatMessage], model: &str) -> Result<ChatResponse> {
        let augmented = self.interceptor.before_request(messages).await;
        let response = self.client.complete(&augmented, model).await?;
        // capture against the caller's original messages so injected
        // context never feeds back into the pipeline
        self.interceptor.after_response(messages, &response);
        Ok(response)
    }
}
