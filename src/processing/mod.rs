//! Structured-output processing clients
//!
//! The core calls an LLM for memory categorization and retrieval planning
//! through the narrow `ProcessingClient` interface. Provider adapters live
//! here; nothing else in the crate touches an SDK or HTTP client.

mod classifier;
mod heuristics;
#[cfg(feature = "openai")]
mod openai;

pub use classifier::{pick_category, Classifier};
pub use heuristics::{
    extract_entities, extract_search_terms, normalize_searchable, MIN_STORE_CHARS,
};
#[cfg(feature = "openai")]
pub use openai::OpenAiClient;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::error::Result;

/// Outcome of a structured-output call.
#[derive(Debug, Clone)]
pub enum StructuredReply {
    /// Parsed object conforming to the requested schema
    Parsed(serde_json::Value),
    /// The model declined; the caller falls back to rule-based behavior
    Refusal(String),
}

/// Narrow interface for structured categorization and planning calls.
///
/// Concrete implementations (OpenAI, Azure, any OpenAI-compatible endpoint,
/// or the rule-based stub) are injected at construction time.
#[async_trait]
pub trait ProcessingClient: Send + Sync {
    /// Request an object matching `schema` for the given prompt pair.
    async fn structured(
        &self,
        system: &str,
        user: &str,
        schema: &serde_json::Value,
    ) -> Result<StructuredReply>;

    fn name(&self) -> &'static str;
}

/// Stub client that refuses every request, driving callers onto their
/// deterministic fallback paths. Useful for offline operation and tests.
#[derive(Debug, Default, Clone)]
pub struct RuleBasedClient;

#[async_trait]
impl ProcessingClient for RuleBasedClient {
    async fn structured(
        &self,
        _system: &str,
        _user: &str,
        _schema: &serde_json::Value,
    ) -> Result<StructuredReply> {
        Ok(StructuredReply::Refusal(
            "rule-based stub performs no model calls".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "rule-based"
    }
}

/// Build a processing client from the provider section.
#[cfg(feature = "openai")]
pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn ProcessingClient>> {
    if config.api_key.is_none() && config.base_url.is_none() && config.azure_endpoint.is_none() {
        // no provider configured; degrade to the stub
        return Ok(Arc::new(RuleBasedClient));
    }
    Ok(Arc::new(OpenAiClient::new(config.clone())?))
}

#[cfg(not(feature = "openai"))]
pub fn create_client(_config: &ProviderConfig) -> Result<Arc<dyn ProcessingClient>> {
    Ok(Arc::new(RuleBasedClient))
}
