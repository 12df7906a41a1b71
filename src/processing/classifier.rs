//! Exchange classification
//!
//! Primary path asks the processing client for a `ProcessedMemory`-shaped
//! object under a strict schema; any unavailability, refusal, or malformed
//! reply degrades to the deterministic rule-based path. The pipeline never
//! blocks the interceptor on classifier failure.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{
    truncate_chars, CategorySignal, ConsciousLabel, EntitySet, ImportanceSignal, MemoryCategory,
    ProcessedMemory, RetentionType, UserContext, SUMMARY_MAX_CHARS,
};

use super::heuristics::{extract_entities, normalize_searchable, MIN_STORE_CHARS};
use super::{ProcessingClient, StructuredReply};

const CATEGORIZATION_PROMPT: &str = "\
You are a memory categorization engine. Given one exchange between a user \
and an assistant, distill it into a structured memory record. Decide the \
primary category (fact, preference, skill, context, rule), extract entity \
groups, score importance / novelty / relevance / actionability in [0,1], \
choose a retention type (short_term, long_term, permanent), and write a \
self-contained summary under 500 characters plus normalized searchable \
text. Set should_store=false for small talk with no lasting value. Flag \
conscious_labels (user_identity, preference, skill, current_project, \
repeated_reference) when the record should prime future sessions.";

/// Strict response schema for the categorization call.
pub(crate) fn categorization_schema() -> serde_json::Value {
    let category_object = json!({
        "type": "object",
        "properties": {
            "category": {"type": "string", "enum": ["fact", "preference", "skill", "context", "rule"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "reasoning": {"type": "string"},
        },
        "required": ["category", "confidence", "reasoning"],
        "additionalProperties": false,
    });
    let string_set = json!({"type": "array", "items": {"type": "string"}});

    json!({
        "type": "object",
        "properties": {
            "category": category_object,
            "alternate_categories": {"type": "array", "items": category_object},
            "entities": {
                "type": "object",
                "properties": {
                    "people": string_set,
                    "technologies": string_set,
                    "topics": string_set,
                    "skills": string_set,
                    "projects": string_set,
                    "keywords": string_set,
                },
                "required": ["people", "technologies", "topics", "skills", "projects", "keywords"],
                "additionalProperties": false,
            },
            "importance": {
                "type": "object",
                "properties": {
                    "importance_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "novelty_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "relevance_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "actionability_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "retention_type": {"type": "string", "enum": ["short_term", "long_term", "permanent"]},
                    "reasoning": {"type": "string"},
                },
                "required": ["importance_score", "novelty_score", "relevance_score",
                              "actionability_score", "retention_type", "reasoning"],
                "additionalProperties": false,
            },
            "summary": {"type": "string"},
            "searchable_content": {"type": "string"},
            "should_store": {"type": "boolean"},
            "conscious_labels": string_set,
        },
        "required": ["category", "alternate_categories", "entities", "importance",
                      "summary", "searchable_content", "should_store", "conscious_labels"],
        "additionalProperties": false,
    })
}

// Lenient mirror of the schema; unknown enum strings are coerced rather
// than rejected, per the boundary-validation rules.
#[derive(Debug, Deserialize)]
struct ReplyDraft {
    category: CategoryDraft,
    #[serde(default)]
    alternate_categories: Vec<CategoryDraft>,
    #[serde(default)]
    entities: EntityDraft,
    #[serde(default)]
    importance: ImportanceDraft,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    searchable_content: String,
    #[serde(default = "default_true")]
    should_store: bool,
    #[serde(default)]
    conscious_labels: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CategoryDraft {
    category: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Default, Deserialize)]
struct EntityDraft {
    #[serde(default)]
    people: Vec<String>,
    #[serde(default)]
    technologies: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    projects: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ImportanceDraft {
    #[serde(default = "default_half")]
    importance_score: f32,
    #[serde(default = "default_half")]
    novelty_score: f32,
    #[serde(default = "default_half")]
    relevance_score: f32,
    #[serde(default = "default_half")]
    actionability_score: f32,
    #[serde(default)]
    retention_type: String,
    #[serde(default)]
    reasoning: String,
}

fn default_half() -> f32 {
    0.5
}

impl Default for ImportanceDraft {
    fn default() -> Self {
        Self {
            importance_score: 0.5,
            novelty_score: 0.5,
            relevance_score: 0.5,
            actionability_score: 0.5,
            retention_type: String::new(),
            reasoning: String::new(),
        }
    }
}

fn parse_label(raw: &str) -> Option<ConsciousLabel> {
    match raw {
        "user_identity" => Some(ConsciousLabel::UserIdentity),
        "preference" => Some(ConsciousLabel::Preference),
        "skill" => Some(ConsciousLabel::Skill),
        "current_project" => Some(ConsciousLabel::CurrentProject),
        "repeated_reference" => Some(ConsciousLabel::RepeatedReference),
        _ => None,
    }
}

/// Resolve the final category among the primary and any alternates.
/// Highest confidence wins; equal confidence falls back to the documented
/// order rule > preference > skill > fact > context.
pub fn pick_category(primary: (MemoryCategory, f32), alternates: &[(MemoryCategory, f32)]) -> (MemoryCategory, f32) {
    let mut best = primary;
    for &(category, confidence) in alternates {
        let better = confidence > best.1
            || (confidence == best.1 && category.tie_break_rank() > best.0.tie_break_rank());
        if better {
            best = (category, confidence);
        }
    }
    best
}

fn draft_to_processed(draft: ReplyDraft) -> ProcessedMemory {
    let primary = (
        MemoryCategory::parse_or_context(&draft.category.category),
        draft.category.confidence,
    );
    let alternates: Vec<(MemoryCategory, f32)> = draft
        .alternate_categories
        .iter()
        .map(|c| (MemoryCategory::parse_or_context(&c.category), c.confidence))
        .collect();
    let (category, confidence) = pick_category(primary, &alternates);

    let entities = EntitySet {
        people: draft.entities.people.into_iter().collect(),
        technologies: draft.entities.technologies.into_iter().collect(),
        topics: draft.entities.topics.into_iter().collect(),
        skills: draft.entities.skills.into_iter().collect(),
        projects: draft.entities.projects.into_iter().collect(),
        keywords: draft.entities.keywords.into_iter().collect(),
    };

    let searchable_content = if draft.searchable_content.trim().is_empty() {
        normalize_searchable(&draft.summary, &entities)
    } else {
        draft.searchable_content
    };

    let conscious_labels: BTreeSet<ConsciousLabel> = draft
        .conscious_labels
        .iter()
        .filter_map(|raw| parse_label(raw))
        .collect();

    ProcessedMemory {
        category: CategorySignal {
            category,
            confidence,
            reasoning: draft.category.reasoning,
        },
        entities,
        importance: ImportanceSignal {
            importance_score: draft.importance.importance_score,
            novelty_score: draft.importance.novelty_score,
            relevance_score: draft.importance.relevance_score,
            actionability_score: draft.importance.actionability_score,
            retention_type: draft
                .importance
                .retention_type
                .parse()
                .unwrap_or(RetentionType::ShortTerm),
            reasoning: draft.importance.reasoning,
        },
        summary: draft.summary,
        searchable_content,
        should_store: draft.should_store,
        conscious_labels,
    }
    .validate()
}

/// Converts raw exchanges into validated `ProcessedMemory` records.
pub struct Classifier {
    client: Arc<dyn ProcessingClient>,
    fallback_count: Arc<AtomicU64>,
}

impl Classifier {
    pub fn new(client: Arc<dyn ProcessingClient>, fallback_count: Arc<AtomicU64>) -> Self {
        Self {
            client,
            fallback_count,
        }
    }

    /// Classify one exchange. Never fails; every error path lands on the
    /// deterministic fallback.
    pub async fn classify(
        &self,
        user_input: &str,
        ai_output: &str,
        model: &str,
        user_context: &UserContext,
    ) -> ProcessedMemory {
        let user_prompt = format_exchange(user_input, ai_output, model, user_context);

        match self
            .client
            .structured(CATEGORIZATION_PROMPT, &user_prompt, &categorization_schema())
            .await
        {
            Ok(StructuredReply::Parsed(value)) => {
                match serde_json::from_value::<ReplyDraft>(value) {
                    Ok(draft) => draft_to_processed(draft),
                    Err(e) => {
                        warn!(error = %e, "classifier reply did not match schema");
                        self.fallback(user_input, ai_output)
                    }
                }
            }
            Ok(StructuredReply::Refusal(reason)) => {
                debug!(reason, "classifier refused, using fallback");
                self.fallback(user_input, ai_output)
            }
            Err(e) => {
                warn!(error = %e, "classifier unavailable, using fallback");
                self.fallback(user_input, ai_output)
            }
        }
    }

    /// Deterministic rule-based classification: category `context`,
    /// importance 0.5, short-term retention, regex-extracted entities.
    pub fn fallback(&self, user_input: &str, ai_output: &str) -> ProcessedMemory {
        self.fallback_count.fetch_add(1, Ordering::Relaxed);

        let combined = format!("{} {}", user_input.trim(), ai_output.trim());
        let should_store = combined.trim().chars().count() >= MIN_STORE_CHARS;
        let entities = extract_entities(&combined);
        let summary = truncate_chars(combined.trim(), SUMMARY_MAX_CHARS);
        let searchable_content = normalize_searchable(&combined, &entities);

        ProcessedMemory {
            category: CategorySignal {
                category: MemoryCategory::Context,
                confidence: 0.3,
                reasoning: "rule-based fallback classification".to_string(),
            },
            entities,
            importance: ImportanceSignal {
                importance_score: 0.5,
                novelty_score: 0.5,
                relevance_score: 0.5,
                actionability_score: 0.5,
                retention_type: RetentionType::ShortTerm,
                reasoning: "rule-based fallback classification".to_string(),
            },
            summary,
            searchable_content,
            should_store,
            conscious_labels: BTreeSet::new(),
        }
        .validate()
    }
}

fn format_exchange(
    user_input: &str,
    ai_output: &str,
    model: &str,
    user_context: &UserContext,
) -> String {
    let mut prompt = format!(
        "Model: {}\n\nUser:\n{}\n\nAssistant:\n{}\n",
        model, user_input, ai_output
    );
    if !user_context.is_empty() {
        prompt.push_str("\nKnown user context (bias only, do not restate):\n");
        if !user_context.current_projects.is_empty() {
            prompt.push_str(&format!(
                "- projects: {}\n",
                user_context.current_projects.join(", ")
            ));
        }
        if !user_context.skills.is_empty() {
            prompt.push_str(&format!("- skills: {}\n", user_context.skills.join(", ")));
        }
        if !user_context.preferences.is_empty() {
            prompt.push_str(&format!(
                "- preferences: {}\n",
                user_context.preferences.join(", ")
            ));
        }
    }
    prompt
}
