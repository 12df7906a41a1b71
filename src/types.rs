//! Core types for memori

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Unique identifier for a recorded exchange
pub type ChatId = String;

/// Unique identifier for a memory row
pub type MemoryId = String;

/// Maximum length of a processed memory summary
pub const SUMMARY_MAX_CHARS: usize = 500;

/// Default time-to-live for classifier-created short-term rows
pub const SHORT_TERM_TTL_DAYS: i64 = 7;

/// One row per recorded exchange. Never mutated after capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    /// Stable unique identifier, assigned at record time
    pub chat_id: ChatId,
    pub user_input: String,
    pub ai_output: String,
    /// Model identifier reported by the provider
    pub model: String,
    /// UTC capture time, non-decreasing within a session
    pub timestamp: DateTime<Utc>,
    /// One per coordinator lifetime
    pub session_id: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 0 if the provider did not report usage
    #[serde(default)]
    pub tokens_used: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Memory category produced by the classifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Skill,
    #[default]
    Context,
    Rule,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Skill => "skill",
            MemoryCategory::Context => "context",
            MemoryCategory::Rule => "rule",
        }
    }

    /// Parse a category, coercing anything unknown to `Context`.
    pub fn parse_or_context(s: &str) -> Self {
        s.parse().unwrap_or(MemoryCategory::Context)
    }

    /// Tie-break rank when two categories score equally:
    /// rule > preference > skill > fact > context.
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            MemoryCategory::Rule => 4,
            MemoryCategory::Preference => 3,
            MemoryCategory::Skill => 2,
            MemoryCategory::Fact => 1,
            MemoryCategory::Context => 0,
        }
    }

    pub fn all() -> &'static [MemoryCategory] {
        &[
            MemoryCategory::Fact,
            MemoryCategory::Preference,
            MemoryCategory::Skill,
            MemoryCategory::Context,
            MemoryCategory::Rule,
        ]
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fact" => Ok(MemoryCategory::Fact),
            "preference" => Ok(MemoryCategory::Preference),
            "skill" => Ok(MemoryCategory::Skill),
            "context" => Ok(MemoryCategory::Context),
            "rule" => Ok(MemoryCategory::Rule),
            _ => Err(format!("Unknown memory category: {}", s)),
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a memory is retained
///
/// - `ShortTerm`: expires after a TTL (default 7 days)
/// - `LongTerm`: subject to the retention policy sweep
/// - `Permanent`: never auto-pruned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    #[default]
    ShortTerm,
    LongTerm,
    Permanent,
}

impl RetentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionType::ShortTerm => "short_term",
            RetentionType::LongTerm => "long_term",
            RetentionType::Permanent => "permanent",
        }
    }

    /// Default expiry for classifier-created rows of this retention type.
    pub fn default_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RetentionType::ShortTerm => Some(now + Duration::days(SHORT_TERM_TTL_DAYS)),
            RetentionType::LongTerm | RetentionType::Permanent => None,
        }
    }
}

impl std::str::FromStr for RetentionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "short_term" => Ok(RetentionType::ShortTerm),
            "long_term" => Ok(RetentionType::LongTerm),
            "permanent" => Ok(RetentionType::Permanent),
            _ => Err(format!("Unknown retention type: {}", s)),
        }
    }
}

/// Which physical table a memory row lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ShortTerm,
    LongTerm,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::ShortTerm => "short_term",
            MemoryKind::LongTerm => "long_term",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            MemoryKind::ShortTerm => "short_term_memory",
            MemoryKind::LongTerm => "long_term_memory",
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "short_term" => Ok(MemoryKind::ShortTerm),
            "long_term" => Ok(MemoryKind::LongTerm),
            _ => Err(format!("Unknown memory kind: {}", s)),
        }
    }
}

/// Flags marking a memory as a candidate for working-set promotion
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConsciousLabel {
    UserIdentity,
    Preference,
    Skill,
    CurrentProject,
    RepeatedReference,
}

impl ConsciousLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsciousLabel::UserIdentity => "user_identity",
            ConsciousLabel::Preference => "preference",
            ConsciousLabel::Skill => "skill",
            ConsciousLabel::CurrentProject => "current_project",
            ConsciousLabel::RepeatedReference => "repeated_reference",
        }
    }
}

/// Category decision with the classifier's confidence and reasoning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CategorySignal {
    pub category: MemoryCategory,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
}

/// Entity groups extracted from an exchange. Sets: order irrelevant,
/// duplicates collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntitySet {
    #[serde(default)]
    pub people: BTreeSet<String>,
    #[serde(default)]
    pub technologies: BTreeSet<String>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub projects: BTreeSet<String>,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

impl EntitySet {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
            && self.technologies.is_empty()
            && self.topics.is_empty()
            && self.skills.is_empty()
            && self.projects.is_empty()
            && self.keywords.is_empty()
    }

    /// Total entity count across all groups.
    pub fn len(&self) -> usize {
        self.people.len()
            + self.technologies.len()
            + self.topics.len()
            + self.skills.len()
            + self.projects.len()
            + self.keywords.len()
    }

    /// Iterate `(entity_type, value)` pairs across all groups.
    pub fn iter_typed(&self) -> impl Iterator<Item = (EntityType, &str)> {
        self.people
            .iter()
            .map(|v| (EntityType::Person, v.as_str()))
            .chain(
                self.technologies
                    .iter()
                    .map(|v| (EntityType::Technology, v.as_str())),
            )
            .chain(self.topics.iter().map(|v| (EntityType::Topic, v.as_str())))
            .chain(self.skills.iter().map(|v| (EntityType::Skill, v.as_str())))
            .chain(
                self.projects
                    .iter()
                    .map(|v| (EntityType::Project, v.as_str())),
            )
            .chain(
                self.keywords
                    .iter()
                    .map(|v| (EntityType::Keyword, v.as_str())),
            )
    }
}

/// Importance signals with the retention decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceSignal {
    /// All scores in [0, 1]
    pub importance_score: f32,
    #[serde(default)]
    pub novelty_score: f32,
    #[serde(default)]
    pub relevance_score: f32,
    #[serde(default)]
    pub actionability_score: f32,
    #[serde(default)]
    pub retention_type: RetentionType,
    #[serde(default)]
    pub reasoning: String,
}

impl Default for ImportanceSignal {
    fn default() -> Self {
        Self {
            importance_score: 0.5,
            novelty_score: 0.5,
            relevance_score: 0.5,
            actionability_score: 0.5,
            retention_type: RetentionType::ShortTerm,
            reasoning: String::new(),
        }
    }
}

/// The classifier's output record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessedMemory {
    pub category: CategorySignal,
    #[serde(default)]
    pub entities: EntitySet,
    #[serde(default)]
    pub importance: ImportanceSignal,
    /// Self-contained restatement, at most [`SUMMARY_MAX_CHARS`] chars
    pub summary: String,
    /// Normalized text optimized for keyword search
    pub searchable_content: String,
    /// If false, the record is discarded after chat_history
    #[serde(default)]
    pub should_store: bool,
    #[serde(default)]
    pub conscious_labels: BTreeSet<ConsciousLabel>,
}

impl ProcessedMemory {
    /// Clamp scores into [0, 1] and truncate the summary to the documented
    /// cap. Categories are coerced at parse time, so the record is fully
    /// in-range afterwards. Applied at the classifier/store boundary.
    pub fn validate(mut self) -> Self {
        self.category.confidence = clamp01(self.category.confidence);
        self.importance.importance_score = clamp01(self.importance.importance_score);
        self.importance.novelty_score = clamp01(self.importance.novelty_score);
        self.importance.relevance_score = clamp01(self.importance.relevance_score);
        self.importance.actionability_score = clamp01(self.importance.actionability_score);
        self.summary = truncate_chars(&self.summary, SUMMARY_MAX_CHARS);
        self
    }

    /// Which table this record lands in when stored.
    pub fn memory_kind(&self) -> MemoryKind {
        match self.importance.retention_type {
            RetentionType::ShortTerm => MemoryKind::ShortTerm,
            RetentionType::LongTerm | RetentionType::Permanent => MemoryKind::LongTerm,
        }
    }
}

/// A row in `short_term_memory` or `long_term_memory`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub memory_id: MemoryId,
    /// Back-reference to the originating exchange, if any
    pub chat_id: Option<ChatId>,
    pub processed_data: ProcessedMemory,
    pub importance_score: f32,
    pub category_primary: MemoryCategory,
    pub retention_type: RetentionType,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    /// None = not auto-pruned
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub searchable_content: String,
    pub summary: String,
    // Long-term only; zero on short-term rows
    #[serde(default)]
    pub novelty_score: f32,
    #[serde(default)]
    pub relevance_score: f32,
    #[serde(default)]
    pub actionability_score: f32,
    /// Set on working-set rows promoted by the conscious analyzer
    #[serde(default)]
    pub is_permanent_context: bool,
}

impl MemoryRow {
    /// Build a storable row from a validated `ProcessedMemory`.
    pub fn from_processed(
        memory_id: MemoryId,
        chat_id: Option<ChatId>,
        processed: ProcessedMemory,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let retention = processed.importance.retention_type;
        Self {
            memory_id,
            chat_id,
            importance_score: processed.importance.importance_score,
            category_primary: processed.category.category,
            retention_type: retention,
            namespace: namespace.to_string(),
            created_at: now,
            expires_at: retention.default_expiry(now),
            access_count: 0,
            last_accessed: None,
            searchable_content: processed.searchable_content.clone(),
            summary: processed.summary.clone(),
            novelty_score: processed.importance.novelty_score,
            relevance_score: processed.importance.relevance_score,
            actionability_score: processed.importance.actionability_score,
            is_permanent_context: false,
            processed_data: processed,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        match self.retention_type {
            RetentionType::ShortTerm => MemoryKind::ShortTerm,
            _ => MemoryKind::LongTerm,
        }
    }
}

/// Entity type in the entity index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Technology,
    Topic,
    Skill,
    Project,
    Keyword,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Technology => "technology",
            EntityType::Topic => "topic",
            EntityType::Skill => "skill",
            EntityType::Project => "project",
            EntityType::Keyword => "keyword",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "person" => Ok(EntityType::Person),
            "technology" => Ok(EntityType::Technology),
            "topic" => Ok(EntityType::Topic),
            "skill" => Ok(EntityType::Skill),
            "project" => Ok(EntityType::Project),
            "keyword" => Ok(EntityType::Keyword),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// A row in `memory_entities`. Cascades with its parent memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityIndexRow {
    pub memory_id: MemoryId,
    pub memory_kind: MemoryKind,
    pub entity_type: EntityType,
    pub entity_value: String,
    pub relevance_score: f32,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
}

/// Rule category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    #[default]
    Preference,
    Instruction,
    Constraint,
    Goal,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Preference => "preference",
            RuleType::Instruction => "instruction",
            RuleType::Constraint => "constraint",
            RuleType::Goal => "goal",
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preference" => Ok(RuleType::Preference),
            "instruction" => Ok(RuleType::Instruction),
            "constraint" => Ok(RuleType::Constraint),
            "goal" => Ok(RuleType::Goal),
            _ => Err(format!("Unknown rule type: {}", s)),
        }
    }
}

/// A row in `rules_memory`. Inactive rules are ignored by the injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    pub rule_id: String,
    pub rule_text: String,
    pub rule_type: RuleType,
    /// Priority in [1, 10], higher wins
    pub priority: u8,
    pub active: bool,
    pub context_conditions: Option<String>,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleRow {
    /// Clamp priority into the documented [1, 10] range.
    pub fn clamp_priority(priority: i64) -> u8 {
        priority.clamp(1, 10) as u8
    }
}

/// Which strategy produced a search hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    FullText,
    Entity,
    Category,
    Importance,
    Temporal,
    /// LIKE-based fallback when FTS is unavailable
    Scan,
}

/// A ranked search query against the memory tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Restrict to these categories when non-empty
    #[serde(default)]
    pub categories: Vec<MemoryCategory>,
    /// Importance gate; the planner sets 0.7 for "important only"
    pub min_importance: Option<f32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    5
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            namespace: namespace.into(),
            limit: default_search_limit(),
            ..Default::default()
        }
    }
}

/// A ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub memory_id: MemoryId,
    pub memory_kind: MemoryKind,
    pub summary: String,
    pub category_primary: MemoryCategory,
    pub importance_score: f32,
    pub created_at: DateTime<Utc>,
    /// Composite score; see the search engine for the formula
    pub final_score: f32,
    /// Strategies that matched this candidate
    pub strategies: Vec<MatchStrategy>,
}

/// An unranked candidate produced by a single search strategy. The search
/// engine combines candidates into [`MemoryHit`]s.
#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub memory_id: MemoryId,
    pub memory_kind: MemoryKind,
    pub summary: String,
    pub category_primary: MemoryCategory,
    pub importance_score: f32,
    pub created_at: DateTime<Utc>,
    pub strategy: MatchStrategy,
    /// Strategy-intrinsic score in [0, 1]
    pub strategy_score: f32,
}

/// Filters for `list_long_term`
#[derive(Debug, Clone, Default)]
pub struct LongTermFilters {
    pub category: Option<MemoryCategory>,
    pub min_importance: Option<f32>,
    pub created_after: Option<DateTime<Utc>>,
}

/// Store health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub connected: bool,
    pub schema_version: i32,
    pub fts_available: bool,
}

/// Counters exposed by `get_memory_stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub chat_count: i64,
    pub short_term_count: i64,
    pub long_term_count: i64,
    pub rule_count: i64,
    pub entity_count: i64,
    pub category_counts: HashMap<String, i64>,
    pub avg_importance: Option<f64>,
    /// Exchanges whose persistence was dropped on queue overflow
    pub queue_dropped: u64,
    /// Classifications served by the rule-based fallback
    pub fallback_classifications: u64,
    pub schema_version: i32,
    pub fts_available: bool,
}

/// Caller-supplied context that biases classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub current_projects: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
}

impl UserContext {
    pub fn is_empty(&self) -> bool {
        self.current_projects.is_empty() && self.skills.is_empty() && self.preferences.is_empty()
    }
}

/// Clamp a score into [0, 1]. NaN collapses to 0.
pub fn clamp01(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Truncate a string to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Maximum namespace length
pub const MAX_NAMESPACE_LENGTH: usize = 64;

/// Namespace validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    Empty,
    TooLong,
    InvalidChars,
}

impl std::fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceError::Empty => write!(f, "Namespace cannot be empty"),
            NamespaceError::TooLong => {
                write!(f, "Namespace exceeds {} characters", MAX_NAMESPACE_LENGTH)
            }
            NamespaceError::InvalidChars => write!(
                f,
                "Namespace can only contain lowercase letters, numbers, hyphens, and underscores"
            ),
        }
    }
}

impl std::error::Error for NamespaceError {}

/// Normalize and validate a namespace: trim, lowercase, `[a-z0-9_-]`,
/// max 64 chars.
pub fn normalize_namespace(s: &str) -> std::result::Result<String, NamespaceError> {
    let normalized = s.trim().to_lowercase();

    if normalized.is_empty() {
        return Err(NamespaceError::Empty);
    }

    if normalized.len() > MAX_NAMESPACE_LENGTH {
        return Err(NamespaceError::TooLong);
    }

    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(NamespaceError::InvalidChars);
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_coercion() {
        assert_eq!(
            MemoryCategory::parse_or_context("preference"),
            MemoryCategory::Preference
        );
        assert_eq!(
            MemoryCategory::parse_or_context("opinion"),
            MemoryCategory::Context
        );
        assert_eq!(
            MemoryCategory::parse_or_context(""),
            MemoryCategory::Context
        );
    }

    #[test]
    fn tie_break_order() {
        let mut cats = MemoryCategory::all().to_vec();
        cats.sort_by_key(|c| std::cmp::Reverse(c.tie_break_rank()));
        assert_eq!(
            cats,
            vec![
                MemoryCategory::Rule,
                MemoryCategory::Preference,
                MemoryCategory::Skill,
                MemoryCategory::Fact,
                MemoryCategory::Context,
            ]
        );
    }

    #[test]
    fn validate_clamps_and_truncates() {
        let processed = ProcessedMemory {
            category: CategorySignal {
                category: MemoryCategory::Fact,
                confidence: 1.7,
                reasoning: String::new(),
            },
            importance: ImportanceSignal {
                importance_score: -0.2,
                novelty_score: f32::NAN,
                relevance_score: 0.4,
                actionability_score: 2.0,
                retention_type: RetentionType::LongTerm,
                reasoning: String::new(),
            },
            summary: "x".repeat(SUMMARY_MAX_CHARS + 50),
            ..Default::default()
        }
        .validate();

        assert_eq!(processed.category.confidence, 1.0);
        assert_eq!(processed.importance.importance_score, 0.0);
        assert_eq!(processed.importance.novelty_score, 0.0);
        assert_eq!(processed.importance.actionability_score, 1.0);
        assert_eq!(processed.summary.chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn processed_memory_round_trip() {
        let mut entities = EntitySet::default();
        entities.technologies.insert("Rust".to_string());
        entities.technologies.insert("SQLite".to_string());
        entities.keywords.insert("testing".to_string());

        let original = ProcessedMemory {
            category: CategorySignal {
                category: MemoryCategory::Preference,
                confidence: 0.85,
                reasoning: "stated preference".to_string(),
            },
            entities,
            importance: ImportanceSignal {
                importance_score: 0.7,
                retention_type: RetentionType::LongTerm,
                ..Default::default()
            },
            summary: "User prefers table-driven tests".to_string(),
            searchable_content: "user prefers table driven tests rust sqlite".to_string(),
            should_store: true,
            conscious_labels: [ConsciousLabel::Preference].into_iter().collect(),
        };

        let json = serde_json::to_string(&original).unwrap();
        let back: ProcessedMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn retention_expiry() {
        let now = Utc::now();
        assert!(RetentionType::ShortTerm.default_expiry(now).is_some());
        assert!(RetentionType::LongTerm.default_expiry(now).is_none());
        assert!(RetentionType::Permanent.default_expiry(now).is_none());
    }

    #[test]
    fn namespace_normalization() {
        assert_eq!(normalize_namespace("  MyApp  "), Ok("myapp".to_string()));
        assert_eq!(normalize_namespace(""), Err(NamespaceError::Empty));
        assert_eq!(
            normalize_namespace("has spaces"),
            Err(NamespaceError::InvalidChars)
        );
        assert_eq!(
            normalize_namespace(&"a".repeat(65)),
            Err(NamespaceError::TooLong)
        );
    }

    #[test]
    fn rule_priority_clamped() {
        assert_eq!(RuleRow::clamp_priority(0), 1);
        assert_eq!(RuleRow::clamp_priority(5), 5);
        assert_eq!(RuleRow::clamp_priority(99), 10);
    }
}
