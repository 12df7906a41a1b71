//! Retrieval planner for auto mode
//!
//! Turns the current user input into a search plan, with a hard total
//! budget. The primary path asks the processing client for a structured
//! plan; the fallback derives terms by stop-word filtering and entity
//! extraction. Planner model calls run inside a task-local scope the
//! interceptor consults, so a planner call can never re-enter capture.

mod cache;

pub use cache::{PlanCache, DEFAULT_PLAN_TTL};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::processing::{extract_search_terms, ProcessingClient, StructuredReply};
use crate::types::{MemoryCategory, SearchQuery};

/// Total planning budget before the fallback takes over
pub const PLANNER_BUDGET: Duration = Duration::from_secs(2);

/// Fallback expected result count
const FALLBACK_EXPECTED_COUNT: usize = 5;

tokio::task_local! {
    static IN_PLANNER: bool;
}

/// True while the current task is inside a planner model call. The
/// interceptor skips capture for any call made under this scope.
pub fn in_planner() -> bool {
    IN_PLANNER.try_with(|v| *v).unwrap_or(false)
}

const PLANNING_PROMPT: &str = "\
You translate a user's current message into a search plan over their \
conversational memory. Emit concrete search terms (entities, technologies, \
topics), optionally constrain categories (fact, preference, skill, context, \
rule), an importance threshold for important-only lookups, a time window in \
days for recency-bound questions, and the number of memories you expect to \
be useful.";

fn planning_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "search_terms": {"type": "array", "items": {"type": "string"}},
            "categories": {"type": "array", "items": {"type": "string"}},
            "importance_threshold": {"type": ["number", "null"], "minimum": 0.0, "maximum": 1.0},
            "time_window_days": {"type": ["integer", "null"], "minimum": 1},
            "expected_count": {"type": "integer", "minimum": 1, "maximum": 20},
        },
        "required": ["search_terms", "categories", "importance_threshold",
                      "time_window_days", "expected_count"],
        "additionalProperties": false,
    })
}

/// A search plan for one user input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub categories: Vec<MemoryCategory>,
    pub importance_threshold: Option<f32>,
    pub time_window_days: Option<i64>,
    #[serde(default = "default_expected")]
    pub expected_count: usize,
}

fn default_expected() -> usize {
    FALLBACK_EXPECTED_COUNT
}

impl RetrievalPlan {
    /// Materialize the plan as a store query, capped at `limit`.
    pub fn to_query(&self, namespace: &str, limit: usize) -> SearchQuery {
        SearchQuery {
            text: self.search_terms.join(" "),
            namespace: namespace.to_string(),
            categories: self.categories.clone(),
            min_importance: self.importance_threshold,
            created_after: self
                .time_window_days
                .map(|days| Utc::now() - chrono::Duration::days(days)),
            created_before: None,
            limit: self.expected_count.min(limit).max(1),
        }
    }
}

// Lenient mirror of the planning schema; unknown categories are dropped.
#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    search_terms: Vec<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    importance_threshold: Option<f32>,
    #[serde(default)]
    time_window_days: Option<i64>,
    #[serde(default = "default_expected")]
    expected_count: usize,
}

impl From<PlanDraft> for RetrievalPlan {
    fn from(draft: PlanDraft) -> Self {
        RetrievalPlan {
            search_terms: draft.search_terms,
            categories: draft
                .categories
                .iter()
                .filter_map(|raw| raw.parse().ok())
                .collect(),
            importance_threshold: draft
                .importance_threshold
                .map(|t| t.clamp(0.0, 1.0)),
            time_window_days: draft.time_window_days.filter(|d| *d > 0),
            expected_count: draft.expected_count.clamp(1, 20),
        }
    }
}

/// Plans retrieval for the current user input.
pub struct RetrievalPlanner {
    client: Arc<dyn ProcessingClient>,
    cache: PlanCache,
    namespace: String,
}

impl RetrievalPlanner {
    pub fn new(client: Arc<dyn ProcessingClient>, namespace: String) -> Self {
        Self {
            client,
            cache: PlanCache::new(DEFAULT_PLAN_TTL),
            namespace,
        }
    }

    /// Produce a plan for `user_input`, consulting the cache first. The
    /// model path runs under the in-planner scope and the total budget;
    /// expiry or failure falls back to rule-based planning.
    pub async fn plan(&self, user_input: &str, memory_count: i64) -> RetrievalPlan {
        let key = PlanCache::key(&self.namespace, user_input, memory_count);
        if let Some(plan) = self.cache.get(&key) {
            debug!("plan cache hit");
            return plan;
        }

        let plan = match tokio::time::timeout(
            PLANNER_BUDGET,
            IN_PLANNER.scope(true, self.model_plan(user_input)),
        )
        .await
        {
            Ok(Some(plan)) => plan,
            Ok(None) => fallback_plan(user_input),
            Err(_) => {
                warn!(budget_ms = PLANNER_BUDGET.as_millis() as u64, "planner budget expired");
                fallback_plan(user_input)
            }
        };

        self.cache.put(key, plan.clone());
        plan
    }

    async fn model_plan(&self, user_input: &str) -> Option<RetrievalPlan> {
        match self
            .client
            .structured(PLANNING_PROMPT, user_input, &planning_schema())
            .await
        {
            Ok(StructuredReply::Parsed(value)) => {
                match serde_json::from_value::<PlanDraft>(value) {
                    Ok(draft) => Some(draft.into()),
                    Err(e) => {
                        warn!(error = %e, "planner reply did not match schema");
                        None
                    }
                }
            }
            Ok(StructuredReply::Refusal(reason)) => {
                debug!(reason, "planner refused");
                None
            }
            Err(e) => {
                warn!(error = %e, "planner call failed");
                None
            }
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.hit_count()
    }
}

/// Rule-based plan: stop-word filtered terms from the last user message.
pub fn fallback_plan(user_input: &str) -> RetrievalPlan {
    RetrievalPlan {
        search_terms: extract_search_terms(user_input),
        categories: Vec::new(),
        importance_threshold: None,
        time_window_days: None,
        expected_count: FALLBACK_EXPECTED_COUNT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::RuleBasedClient;

    #[tokio::test]
    async fn stub_client_lands_on_fallback() {
        let planner = RetrievalPlanner::new(Arc::new(RuleBasedClient), "default".to_string());
        let plan = planner.plan("Help me add tests to the Go project", 10).await;

        assert!(plan.search_terms.contains(&"tests".to_string()));
        assert!(plan.search_terms.contains(&"go".to_string()));
        assert_eq!(plan.expected_count, 5);
    }

    #[tokio::test]
    async fn plans_are_cached() {
        let planner = RetrievalPlanner::new(Arc::new(RuleBasedClient), "default".to_string());
        let _ = planner.plan("same input", 10).await;
        let _ = planner.plan("same input", 12).await; // same count bucket
        assert_eq!(planner.cache_hits(), 1);
    }

    #[tokio::test]
    async fn in_planner_flag_is_task_scoped() {
        assert!(!in_planner());
        IN_PLANNER
            .scope(true, async {
                assert!(in_planner());
            })
            .await;
        assert!(!in_planner());
    }

    #[test]
    fn plan_query_caps_limit() {
        let plan = RetrievalPlan {
            search_terms: vec!["go".to_string()],
            expected_count: 15,
            ..Default::default()
        };
        let query = plan.to_query("ns1", 5);
        assert_eq!(query.limit, 5);
        assert_eq!(query.namespace, "ns1");
    }

    #[test]
    fn draft_drops_unknown_categories() {
        let draft: PlanDraft = serde_json::from_value(json!({
            "search_terms": ["go"],
            "categories": ["preference", "nonsense"],
            "importance_threshold": 1.5,
            "time_window_days": -3,
            "expected_count": 50,
        }))
        .unwrap();
        let plan: RetrievalPlan = draft.into();
        assert_eq!(plan.categories, vec![MemoryCategory::Preference]);
        assert_eq!(plan.importance_threshold, Some(1.0));
        assert!(plan.time_window_days.is_none());
        assert_eq!(plan.expected_count, 20);
    }
}
